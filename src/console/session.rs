//! Session controller: the bridge between one connection and one front-end.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{AuthRequest, Connection, ConnectionEvent};
use crate::console::hooks::{Direction, FrontEnd, Level};
use crate::console::login::{Credentials, LoginNegotiator};
use crate::console::pretty;
use crate::console::prompt::{ChoiceRequest, PromptBroker, PromptRequest};
use crate::error::ConsoleError;
use crate::jid::Jid;
use crate::xml::Element;

const ANONYMOUS: &str = "ANONYMOUS";

/// Answers known before the session starts.
#[derive(Debug, Clone, Default)]
pub struct Presupplied {
    pub domain: Option<String>,
    pub credentials: Credentials,
}

/// Where the session stands, as published to front-ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Connected,
    Open,
    Online(Jid),
    Closed,
}

#[derive(Debug, Default)]
struct SessionState {
    domain: Option<String>,
    jid: Option<Jid>,
}

pub struct SessionController {
    connection: Arc<dyn Connection>,
    frontend: Arc<dyn FrontEnd>,
    prompts: PromptBroker,
    login: LoginNegotiator,
    presupplied_domain: Option<String>,
    state: Mutex<SessionState>,
    lifecycle: watch::Sender<Lifecycle>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    /// Subscribe to `connection` and start dispatching its events.
    ///
    /// The subscription is taken before this returns, so nothing emitted
    /// afterwards can be missed. Must be called from within a tokio runtime.
    pub fn new(
        connection: Arc<dyn Connection>,
        frontend: Arc<dyn FrontEnd>,
        presupplied: Presupplied,
    ) -> Arc<Self> {
        let events = connection.subscribe();
        let prompts = PromptBroker::new(frontend.clone());
        let login = LoginNegotiator::new(prompts.clone(), frontend.clone(), presupplied.credentials);
        let (lifecycle, _) = watch::channel(Lifecycle::Idle);

        let controller = Arc::new(Self {
            connection,
            frontend,
            prompts,
            login,
            presupplied_domain: presupplied.domain,
            state: Mutex::new(SessionState::default()),
            lifecycle,
            dispatcher: Mutex::new(None),
        });
        let dispatcher = tokio::spawn(Arc::clone(&controller).dispatch(events));
        *controller.dispatcher.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(dispatcher);
        controller
    }

    /// Stop dispatching events without waiting for a `Close`.
    ///
    /// The dispatch task holds the controller alive, so a front-end that goes
    /// away before the connection ever closed must call this.
    pub fn shutdown(&self) {
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
    }

    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    pub fn prompts(&self) -> &PromptBroker {
        &self.prompts
    }

    pub fn domain(&self) -> Option<String> {
        self.state().domain.clone()
    }

    pub fn jid(&self) -> Option<Jid> {
        self.state().jid.clone()
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn notify(&self, level: Level, message: &str) {
        self.frontend.notify(level, message);
    }

    pub fn info(&self, message: &str) {
        self.notify(Level::Info, message);
    }

    pub fn warning(&self, message: &str) {
        self.notify(Level::Warning, message);
    }

    pub fn error(&self, message: &str) {
        self.notify(Level::Error, message);
    }

    /// Initial connect, triggered by the front-end bootstrap.
    ///
    /// Failures are notified; the return value only tells the caller whether
    /// a session can follow.
    pub async fn connect(&self, service: &str) -> bool {
        info!(service, "Connecting");
        match self.connection.connect(service).await {
            Ok(()) => true,
            Err(e) => {
                warn!(service, error = %e, "Connect failed");
                self.error(&e.to_string());
                false
            }
        }
    }

    /// Parse operator input and send it.
    ///
    /// Malformed XML is reported and dropped without touching the connection.
    /// The input is reset only once the connection has accepted the element.
    pub async fn send(&self, raw: &str) {
        let element = match Element::parse(raw) {
            Ok(element) => element,
            Err(source) => {
                let e = ConsoleError::MalformedInput {
                    input: raw.to_string(),
                    source,
                };
                debug!(error = %e, "Rejected operator input");
                self.error(&e.to_string());
                return;
            }
        };

        match self.connection.send(element).await {
            Ok(()) => self.frontend.reset_input(),
            Err(e) => self.error(&e.to_string()),
        }
    }

    async fn dispatch(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            let closed = matches!(event, ConnectionEvent::Close);
            self.handle_event(event);
            if closed {
                debug!("Connection closed, no longer dispatching events");
                break;
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connect => {
                self.lifecycle.send_replace(Lifecycle::Connected);
                self.info("connected");
                let this = Arc::clone(self);
                tokio::spawn(async move { this.negotiate_domain().await });
            }
            ConnectionEvent::Open => {
                self.lifecycle.send_replace(Lifecycle::Open);
                self.info("open");
            }
            ConnectionEvent::Online(jid) => {
                self.state().jid = Some(jid.clone());
                self.lifecycle.send_replace(Lifecycle::Online(jid.clone()));
                self.info(&format!("online {}", jid));
            }
            ConnectionEvent::Element(stanza) => {
                self.frontend.render(Direction::Inbound, &pretty::format(&stanza));
            }
            ConnectionEvent::Send(stanza) => {
                self.frontend.render(Direction::Outbound, &pretty::format(&stanza));
            }
            ConnectionEvent::Error(message) => {
                self.error(&message);
            }
            ConnectionEvent::Close => {
                self.lifecycle.send_replace(Lifecycle::Closed);
                self.info("closed");
            }
            ConnectionEvent::Authenticate(request) => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.authenticate(request).await });
            }
        }
    }

    /// Settle the domain and (re)open the stream towards it.
    ///
    /// A pre-supplied domain wins, then the one entered for an earlier
    /// connect of this session; otherwise the operator is asked.
    pub async fn negotiate_domain(&self) {
        let known = self.presupplied_domain.clone().or_else(|| self.domain());
        let mut request = PromptRequest::new("domain", "Domain").with_precomputed(known);
        if let Some(configured) = self.connection.domain() {
            request = request.with_default(configured);
        }

        let domain = match self.prompts.ask(&request).await {
            Ok(domain) => domain,
            Err(e) => {
                // nothing can be opened without a domain
                self.error(&e.to_string());
                if let Err(e) = self.connection.stop().await {
                    warn!(error = %e, "Failed to drop the connection");
                }
                return;
            }
        };

        self.state().domain = Some(domain.clone());
        self.connection.set_domain(&domain);
        info!(domain = %domain, "Opening stream");
        if let Err(e) = self.connection.open(&domain).await {
            warn!(domain = %domain, error = %e, "Open failed");
            self.error(&e.to_string());
        }
    }

    async fn authenticate(&self, request: AuthRequest) {
        let mechanism = match request.mechanisms() {
            [] => None,
            [only] => Some(only.clone()),
            several => {
                let choice = ChoiceRequest::new("SASL mechanism", several.to_vec());
                match self.prompts.choose(&choice).await {
                    Ok(selected) => Some(selected),
                    Err(e) => {
                        self.error(&e.to_string());
                        return;
                    }
                }
            }
        };

        if mechanism.as_deref() == Some(ANONYMOUS) {
            if let Err(e) = request.authenticate(Credentials::default(), mechanism.as_deref()).await {
                self.error(&e.to_string());
            }
            return;
        }

        self.login
            .login(
                |credentials| request.authenticate(credentials, mechanism.as_deref()),
                mechanism.as_deref(),
            )
            .await;
    }
}
