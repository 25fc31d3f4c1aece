//! Errors surfaced by the console core and the connection entity.
//!
//! Every variant ends up as an operator-facing notification; none of them is
//! allowed to terminate the process from inside the core.

use crate::xml::XmlError;

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    /// Operator-submitted text is not well-formed XML.
    #[error("invalid XML \"{input}\"")]
    MalformedInput {
        input: String,
        #[source]
        source: XmlError,
    },

    /// The front-end rejected or the operator cancelled a prompt.
    #[error("prompt cancelled")]
    PromptCancelled,

    /// connect/open/send failed at the socket or TLS layer.
    #[error("{0}")]
    Transport(String),

    /// The peer reported a stream-level error.
    #[error("{0}")]
    Protocol(String),

    /// SASL or component handshake rejected by the server.
    #[error("authentication failed: {0}")]
    Authentication(String),
}

impl From<String> for ConsoleError {
    fn from(message: String) -> Self {
        ConsoleError::Transport(message)
    }
}

pub type Result<T, E = ConsoleError> = std::result::Result<T, E>;
