//! XMPP connection entity: transports, STARTTLS, SASL and component handshake.

mod dns;
mod framing;
mod negotiation;
mod tls;
mod transport;

pub use dns::{parse_server_input, ConnectionMode, ParsedServer, XmppEndpoint};
pub use tls::init_crypto_provider;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{AuthType, Transport};
use crate::connection::{AuthAttempt, AuthRequest, Connection, ConnectionEvent, EventEmitter};
use crate::error::{ConsoleError, Result};
use crate::xml::{Element, Stanza};
use negotiation::{Negotiator, Step};
use transport::{Link, LinkReader, LinkWriter};

/// How long `stop` waits for the peer to close its side of the stream.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Correlates log lines of one connection.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub kind: AuthType,
    pub transport: Transport,
    pub insecure_tls: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            kind: AuthType::Client,
            transport: Transport::Auto,
            insecure_tls: false,
        }
    }
}

/// Writes frames and reports each of them as a `Send` event.
struct Outbound {
    writer: Mutex<LinkWriter>,
    events: Arc<EventEmitter>,
}

impl Outbound {
    async fn write(&self, stanza: &Stanza) -> Result<(), String> {
        let wire = self.writer.lock().await.write_frame(&stanza.to_string()).await?;
        let shown = match stanza {
            Stanza::Element(element) if wire == element.to_string() => stanza.clone(),
            _ => Stanza::Raw(wire),
        };
        self.events.emit(ConnectionEvent::Send(shown));
        Ok(())
    }
}

enum LinkState {
    Idle,
    /// Transport up, waiting for `open`.
    Connected { link: Link, tls_name: String },
    Streaming {
        outbound: Arc<Outbound>,
        restart: tokio::sync::mpsc::UnboundedSender<String>,
        reader: JoinHandle<()>,
    },
}

pub struct XmppClient {
    options: ClientOptions,
    events: Arc<EventEmitter>,
    domain: StdMutex<Option<String>>,
    state: Mutex<LinkState>,
}

impl XmppClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            events: Arc::new(EventEmitter::default()),
            domain: StdMutex::new(None),
            state: Mutex::new(LinkState::Idle),
        }
    }

    /// STARTTLS when required, then the stream header and the reader task.
    async fn start_stream(&self, link: Link, tls_name: &str, domain: &str) -> Result<LinkState, String> {
        let link = match link {
            Link::Tcp(tcp) if self.options.kind == AuthType::Client => {
                let tls = tls::perform_starttls(tcp, domain, tls_name, self.options.insecure_tls, &self.events).await?;
                Link::Tls(Box::new(tls))
            }
            other => other,
        };

        let (reader, writer) = link.split();
        let outbound = Arc::new(Outbound {
            writer: Mutex::new(writer),
            events: self.events.clone(),
        });
        let negotiator = Negotiator::new(self.options.kind, domain);
        outbound.write(&negotiator.header()).await?;

        let (restart, restarts) = tokio::sync::mpsc::unbounded_channel();
        let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(run_stream(
            conn_id,
            reader,
            outbound.clone(),
            self.events.clone(),
            negotiator,
            restarts,
        ));
        Ok(LinkState::Streaming {
            outbound,
            restart,
            reader: task,
        })
    }

    async fn establish(&self, service: &str) -> Result<(Link, String), String> {
        match parse_server_input(service, self.options.kind, self.options.transport) {
            ParsedServer::WebSocket(url) => {
                let host = url
                    .split("://")
                    .nth(1)
                    .and_then(|rest| rest.split(['/', ':']).next())
                    .unwrap_or_default()
                    .to_string();
                let link = transport::connect_websocket(&url, self.options.insecure_tls).await?;
                Ok((link, host))
            }
            ParsedServer::Direct(endpoint) => {
                info!(host = %endpoint.host, port = endpoint.port, mode = ?endpoint.mode, domain = ?endpoint.domain, "Using explicit endpoint");
                let link = transport::connect_endpoint(&endpoint, self.options.insecure_tls).await?;
                Ok((link, endpoint.tls_name().to_string()))
            }
            ParsedServer::Domain(domain) => {
                let endpoints = dns::resolve_xmpp_server(&domain).await?;
                let mut last_error = format!("No endpoint for {}", domain);
                for endpoint in &endpoints {
                    match transport::connect_endpoint(endpoint, self.options.insecure_tls).await {
                        Ok(link) => return Ok((link, endpoint.tls_name().to_string())),
                        Err(e) => {
                            warn!(host = %endpoint.host, port = endpoint.port, error = %e, "Endpoint failed, trying next");
                            last_error = e;
                        }
                    }
                }
                Err(last_error)
            }
        }
    }
}

#[async_trait]
impl Connection for XmppClient {
    fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn domain(&self) -> Option<String> {
        self.domain.lock().ok().and_then(|d| d.as_ref().cloned())
    }

    fn set_domain(&self, domain: &str) {
        if let Ok(mut current) = self.domain.lock() {
            *current = Some(domain.to_string());
        }
    }

    async fn connect(&self, service: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !matches!(*state, LinkState::Idle) {
            return Err(ConsoleError::Transport("already connected".to_string()));
        }
        let (link, tls_name) = self.establish(service).await?;
        info!(service, transport = link.describe(), "Transport established");
        *state = LinkState::Connected { link, tls_name };
        drop(state);
        self.events.emit(ConnectionEvent::Connect);
        Ok(())
    }

    async fn open(&self, domain: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, LinkState::Idle) {
            LinkState::Idle => Err(ConsoleError::Transport("not connected".to_string())),
            LinkState::Streaming {
                outbound,
                restart,
                reader,
            } => {
                // a second open restarts the stream towards the new domain
                let result = restart
                    .send(domain.to_string())
                    .map_err(|_| ConsoleError::Transport("stream already closed".to_string()));
                *state = LinkState::Streaming {
                    outbound,
                    restart,
                    reader,
                };
                result
            }
            LinkState::Connected { link, tls_name } => match self.start_stream(link, &tls_name, domain).await {
                Ok(streaming) => {
                    *state = streaming;
                    Ok(())
                }
                Err(e) => {
                    // the link is gone with the failed negotiation
                    warn!(domain, error = %e, "Stream could not be opened");
                    drop(state);
                    self.events.emit(ConnectionEvent::Close);
                    Err(e.into())
                }
            },
        }
    }

    async fn send(&self, element: Element) -> Result<()> {
        let outbound = match &*self.state.lock().await {
            LinkState::Streaming { outbound, .. } => outbound.clone(),
            _ => return Err(ConsoleError::Transport("stream not open".to_string())),
        };
        outbound.write(&Stanza::Element(element)).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock().await, LinkState::Idle);
        match previous {
            LinkState::Idle => Ok(()),
            LinkState::Connected { .. } => {
                self.events.emit(ConnectionEvent::Close);
                Ok(())
            }
            LinkState::Streaming {
                outbound, mut reader, ..
            } => {
                let _ = outbound.write(&Stanza::Raw(framing::stream_close().to_string())).await;
                if tokio::time::timeout(CLOSE_TIMEOUT, &mut reader).await.is_err() {
                    debug!("Peer did not close the stream, aborting reader");
                    reader.abort();
                    self.events.emit(ConnectionEvent::Close);
                }
                outbound.writer.lock().await.shutdown().await;
                Ok(())
            }
        }
    }
}

/// Wait for the operator's credentials, if authentication is on offer.
async fn next_attempt(pending: &mut Option<oneshot::Receiver<AuthAttempt>>) -> Option<AuthAttempt> {
    match pending {
        Some(rx) => {
            let attempt = rx.await.ok();
            *pending = None;
            attempt
        }
        None => std::future::pending().await,
    }
}

/// Reader loop: every inbound frame is reported, then negotiated.
async fn run_stream(
    conn_id: u64,
    mut reader: LinkReader,
    outbound: Arc<Outbound>,
    events: Arc<EventEmitter>,
    mut negotiator: Negotiator,
    mut restarts: tokio::sync::mpsc::UnboundedReceiver<String>,
) {
    info!(conn_id, "Stream reader started");
    let mut pending_auth: Option<oneshot::Receiver<AuthAttempt>> = None;

    loop {
        let steps = tokio::select! {
            frame = reader.next_frame() => match frame {
                Ok(Some(frame)) => {
                    debug!(conn_id, frame = %frame, "Inbound frame");
                    events.emit(ConnectionEvent::Element(Stanza::Raw(frame.clone())));
                    negotiator.inbound(&frame)
                }
                Ok(None) => {
                    info!(conn_id, "Peer closed the connection");
                    vec![Step::Close]
                }
                Err(e) => {
                    warn!(conn_id, error = %e, "Stream read failed");
                    events.emit(ConnectionEvent::Error(e));
                    vec![Step::Close]
                }
            },
            Some(attempt) = next_attempt(&mut pending_auth) => negotiator.attempt(attempt),
            Some(domain) = restarts.recv() => {
                negotiator.set_domain(&domain);
                vec![Step::Write(negotiator.header())]
            }
        };

        for step in steps {
            match step {
                Step::Write(stanza) => {
                    if let Err(e) = outbound.write(&stanza).await {
                        warn!(conn_id, error = %e, "Negotiation write failed");
                        events.emit(ConnectionEvent::Error(e));
                    }
                }
                Step::Emit(event) => events.emit(event),
                Step::Offer(mechanisms) => {
                    let (request, attempts) = AuthRequest::new(mechanisms);
                    pending_auth = Some(attempts);
                    events.emit(ConnectionEvent::Authenticate(request));
                }
                Step::Close => {
                    info!(conn_id, "Stream closed");
                    events.emit(ConnectionEvent::Close);
                    return;
                }
            }
        }
    }
}
