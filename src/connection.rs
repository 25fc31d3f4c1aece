//! The connection entity as seen by the console.
//!
//! The console never owns a connection: it subscribes to its events and calls
//! `open`/`send`. [`crate::client::XmppClient`] is the implementation used by
//! the binary; tests drive the controller with an in-memory double.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::console::login::Credentials;
use crate::error::{ConsoleError, Result};
use crate::jid::Jid;
use crate::xml::{Element, Stanza};

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Transport established, no stream yet.
    Connect,
    /// Stream header received from the peer.
    Open,
    /// Authenticated and bound.
    Online(Jid),
    /// Any element received, stream headers included.
    Element(Stanza),
    /// Any element written, whether protocol-originated or operator-submitted.
    Send(Stanza),
    Error(String),
    Close,
    /// The peer expects credentials.
    Authenticate(AuthRequest),
}

/// One attempt the connection is waiting on.
#[derive(Debug)]
pub struct AuthAttempt {
    pub mechanism: Option<String>,
    pub credentials: Credentials,
    pub outcome: oneshot::Sender<Result<()>>,
}

/// Authentication offered by the connection.
///
/// Cloneable so it can travel through every subscriber; only the first
/// `authenticate` call is delivered.
#[derive(Clone)]
pub struct AuthRequest {
    mechanisms: Vec<String>,
    responder: Arc<Mutex<Option<oneshot::Sender<AuthAttempt>>>>,
}

impl AuthRequest {
    /// `mechanisms` empty means the handshake has no mechanism (components).
    pub fn new(mechanisms: Vec<String>) -> (Self, oneshot::Receiver<AuthAttempt>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                mechanisms,
                responder: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn mechanisms(&self) -> &[String] {
        &self.mechanisms
    }

    /// Hand over credentials and wait for the server's verdict.
    pub async fn authenticate(&self, credentials: Credentials, mechanism: Option<&str>) -> Result<()> {
        let responder = self
            .responder
            .lock()
            .map_err(|_| ConsoleError::Protocol("authentication state poisoned".to_string()))?
            .take()
            .ok_or_else(|| ConsoleError::Protocol("authentication already answered".to_string()))?;

        let (outcome, verdict) = oneshot::channel();
        responder
            .send(AuthAttempt {
                mechanism: mechanism.map(str::to_string),
                credentials,
                outcome,
            })
            .map_err(|_| ConsoleError::Transport("connection closed before authentication".to_string()))?;

        verdict
            .await
            .map_err(|_| ConsoleError::Transport("connection closed during authentication".to_string()))?
    }
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("mechanisms", &self.mechanisms)
            .finish_non_exhaustive()
    }
}

/// Fan-out of connection events to every subscriber.
#[derive(Default)]
pub struct EventEmitter {
    listeners: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl EventEmitter {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: ConnectionEvent) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|listener| listener.send(event.clone()).is_ok());
        }
    }
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Events are buffered from the moment of subscription.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent>;

    fn domain(&self) -> Option<String>;

    fn set_domain(&self, domain: &str);

    async fn connect(&self, service: &str) -> Result<()>;

    /// Open (or re-open) the XML stream towards `domain`.
    async fn open(&self, domain: &str) -> Result<()>;

    async fn send(&self, element: Element) -> Result<()>;

    /// Close the stream and the transport.
    async fn stop(&self) -> Result<()>;
}
