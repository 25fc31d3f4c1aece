//! Command line and the configuration derived from it.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use crate::client::ClientOptions;
use crate::console::login::Credentials;
use crate::console::session::Presupplied;

pub const DEFAULT_SERVICE: &str = "xmpp://localhost";
pub const DEFAULT_WEB_PORT: u16 = 8080;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// SASL client stream.
    #[default]
    Client,
    /// XEP-0114 external component.
    Component,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Decided by the service address.
    #[default]
    Auto,
    Tcp,
    Tls,
    #[value(name = "websocket")]
    WebSocket,
}

#[derive(Debug, Parser)]
#[command(name = "xmpp-console", version, about = "Interactive XMPP stanza console")]
pub struct Cli {
    /// ws://, wss://, xmpp://, xmpps://, tcp://, tls://, host:port or a bare domain
    pub service: Option<String>,

    /// Authentication type
    #[arg(short = 't', long = "type", value_enum, default_value_t = AuthType::Client)]
    pub auth_type: AuthType,

    /// How to reach a service given without a scheme
    #[arg(long, value_enum, default_value_t = Transport::Auto)]
    pub transport: Transport,

    /// Serve the browser console instead of the terminal one
    #[arg(short, long)]
    pub web: bool,

    /// Port of the browser console
    #[arg(short, long, default_value_t = DEFAULT_WEB_PORT)]
    pub port: u16,

    /// Do not open a browser tab in web mode
    #[arg(long)]
    pub no_open: bool,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    #[arg(long)]
    pub domain: Option<String>,

    /// Log to stderr; `--verbose=xmpp` also traces the wire
    #[arg(short, long, num_args = 0..=1, require_equals = true, default_missing_value = "default", value_name = "LEVEL")]
    pub verbose: Option<String>,

    /// Write logs next to this path instead of the platform log directory
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Disable TLS certificate verification (INSECURE)
    #[arg(long)]
    pub dangerous_insecure_tls: bool,
}

/// Everything a session needs, resolved from the command line.
#[derive(Debug, Clone, Serialize)]
pub struct ConsoleConfig {
    pub service: Option<String>,
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    pub transport: Transport,
    pub domain: Option<String>,
    pub username: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
    #[serde(skip)]
    pub insecure_tls: bool,
}

impl ConsoleConfig {
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            kind: self.auth_type,
            transport: self.transport,
            insecure_tls: self.insecure_tls,
        }
    }

    pub fn presupplied(&self) -> Presupplied {
        Presupplied {
            domain: self.domain.clone(),
            credentials: Credentials {
                username: self.username.clone(),
                password: self.password.clone(),
            },
        }
    }

    /// What the browser console may learn about this configuration.
    pub fn params(&self) -> Params {
        Params {
            service: self.service.clone(),
            auth_type: self.auth_type,
            transport: self.transport,
            domain: self.domain.clone(),
            username: self.username.clone(),
            has_password: self.password.is_some(),
        }
    }
}

impl From<&Cli> for ConsoleConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            service: cli.service.clone(),
            auth_type: cli.auth_type,
            transport: cli.transport,
            domain: cli.domain.clone(),
            username: cli.username.clone(),
            password: cli.password.clone(),
            insecure_tls: cli.dangerous_insecure_tls,
        }
    }
}

/// Body of `GET /params`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Params {
    pub service: Option<String>,
    #[serde(rename = "type")]
    pub auth_type: AuthType,
    pub transport: Transport,
    pub domain: Option<String>,
    pub username: Option<String>,
    pub has_password: bool,
}
