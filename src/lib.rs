pub mod client;
pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod frontend;
pub mod jid;
pub mod logging;
pub mod xml;

pub use error::{ConsoleError, Result};
