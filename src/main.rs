use clap::Parser;
use tracing::info;

use xmpp_console::config::{Cli, ConsoleConfig};
use xmpp_console::frontend::{terminal, web};
use xmpp_console::{client, logging};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.dangerous_insecure_tls {
        eprintln!("WARNING: TLS certificate verification is DISABLED (--dangerous-insecure-tls)");
        eprintln!("         This is insecure and should only be used for development/testing.");
    }

    let log_dir = logging::init(cli.verbose.as_deref(), cli.log_file.as_deref());
    if cli.verbose.is_some() || cli.log_file.is_some() {
        logging::print_startup_diagnostics(&log_dir);
    }

    client::init_crypto_provider();
    let config = ConsoleConfig::from(&cli);
    info!(web = cli.web, "Starting console");

    // one operator, one session: a single thread is plenty
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async {
        if cli.web {
            web::serve(config, cli.port, !cli.no_open).await
        } else {
            terminal::run(config).await
        }
    })
}
