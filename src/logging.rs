//! Diagnostic logging: a daily-rotating file, plus stderr on request.

use std::path::{Path, PathBuf};

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "xmpp-console.log";

/// Where the log file lives.
///
/// `--log-file=PATH` puts it next to `PATH`; otherwise the platform data
/// directory is used (`~/.local/share/xmpp-console/logs` on Linux).
pub fn log_dir(log_file: Option<&Path>) -> PathBuf {
    match log_file {
        Some(path) => path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
        None => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("xmpp-console")
            .join("logs"),
    }
}

/// Filter for the stderr layer. `xmpp` raises the wire-level modules to debug.
pub fn stderr_directives(level: Option<&str>) -> &'static str {
    match level {
        Some("xmpp") => "xmpp_console=info,xmpp_console::client=debug,console=off,info",
        _ => "xmpp_console=info,console=off,warn",
    }
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init(verbose: Option<&str>, log_file: Option<&Path>) -> PathBuf {
    let dir = log_dir(log_file);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("Warning: could not create log directory '{}': {}", dir.display(), e);
    }
    let rust_log = std::env::var("RUST_LOG").is_ok();

    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("xmpp_console=info,console=info,info")
    };
    let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    // notifications already reach the operator, keep them off stderr
    let stderr_layer = (verbose.is_some() || rust_log).then(|| {
        let filter = if rust_log {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(stderr_directives(verbose))
        };
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // the writer thread must outlive main
    std::mem::forget(guard);
    dir
}

pub fn print_startup_diagnostics(log_dir: &Path) {
    eprintln!("xmpp-console v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    eprintln!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
    eprintln!("Log file: {}", log_dir.join(LOG_FILE_NAME).display());
    eprintln!("---");
}
