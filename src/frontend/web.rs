//! Browser front-end.
//!
//! Serves a single page on the loopback interface. Each WebSocket on
//! `/console` is one console session: the page renders what the controller
//! produces and answers its prompts, matched by id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::client::XmppClient;
use crate::config::{ConsoleConfig, Params, DEFAULT_SERVICE};
use crate::connection::Connection;
use crate::console::hooks::{Direction, FrontEnd, Level};
use crate::console::prompt::{ChoiceRequest, PromptKind, PromptRequest};
use crate::console::session::SessionController;
use crate::error::{ConsoleError, Result};

const INDEX_PAGE: &str = include_str!("../../web/index.html");

/// Messages pushed to the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Log {
        level: Level,
        message: String,
    },
    Render {
        direction: Direction,
        xml: String,
    },
    Ask {
        id: u64,
        name: String,
        text: String,
        default: Option<String>,
        password: bool,
    },
    Choose {
        id: u64,
        text: String,
        choices: Vec<String>,
    },
    Reset,
}

/// Messages sent by the page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Answer { id: u64, value: String },
    Cancel { id: u64 },
    Send { xml: String },
}

type PendingPrompt = oneshot::Sender<Result<String>>;

pub struct WebFrontEnd {
    outbound: mpsc::UnboundedSender<ServerMessage>,
    pending: Mutex<HashMap<u64, PendingPrompt>>,
    next_id: AtomicU64,
}

impl WebFrontEnd {
    pub fn new(outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn post(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).is_ok()
    }

    fn take(&self, id: u64) -> Option<PendingPrompt> {
        self.pending.lock().ok().and_then(|mut pending| pending.remove(&id))
    }

    async fn request(&self, make: impl FnOnce(u64) -> ServerMessage) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, answer) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, reply);
        }
        if !self.post(make(id)) {
            self.take(id);
            return Err(ConsoleError::PromptCancelled);
        }
        answer.await.unwrap_or(Err(ConsoleError::PromptCancelled))
    }

    /// Resolve prompt `id`. Unknown ids are ignored.
    pub fn answer(&self, id: u64, value: String) -> bool {
        match self.take(id) {
            Some(reply) => reply.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, id: u64) -> bool {
        match self.take(id) {
            Some(reply) => reply.send(Err(ConsoleError::PromptCancelled)).is_ok(),
            None => false,
        }
    }

    /// Fail every outstanding prompt, used when the page goes away.
    pub fn cancel_all(&self) {
        let drained: Vec<PendingPrompt> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, reply)| reply).collect(),
            Err(_) => Vec::new(),
        };
        for reply in drained {
            let _ = reply.send(Err(ConsoleError::PromptCancelled));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl FrontEnd for WebFrontEnd {
    async fn ask(&self, request: &PromptRequest) -> Result<String> {
        let answer = self
            .request(|id| ServerMessage::Ask {
                id,
                name: request.name.clone(),
                text: request.text.clone(),
                default: request.default.clone(),
                password: request.kind == PromptKind::Password,
            })
            .await?;
        Ok(request.settle(answer))
    }

    async fn choose(&self, request: &ChoiceRequest) -> Result<String> {
        self.request(|id| ServerMessage::Choose {
            id,
            text: request.text.clone(),
            choices: request.choices.clone(),
        })
        .await
    }

    fn notify(&self, level: Level, message: &str) {
        match level {
            Level::Info => info!(target: "console", "{}", message),
            Level::Warning => warn!(target: "console", "{}", message),
            Level::Error => tracing::error!(target: "console", "{}", message),
        }
        self.post(ServerMessage::Log {
            level,
            message: message.to_string(),
        });
    }

    fn render(&self, direction: Direction, xml: &str) {
        self.post(ServerMessage::Render {
            direction,
            xml: xml.to_string(),
        });
    }

    fn reset_input(&self) {
        self.post(ServerMessage::Reset);
    }
}

#[derive(Clone)]
struct WebState {
    config: Arc<ConsoleConfig>,
}

fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/params", get(params))
        .route("/console", get(console_socket))
        .with_state(state)
}

/// Serve the browser console until the process is stopped.
pub async fn serve(config: ConsoleConfig, port: u16, open_browser: bool) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    let url = format!("http://{}/", listener.local_addr()?);

    info!(%url, "Web console listening");
    println!("Console available at {url}");
    println!("Press Ctrl+C to stop.");

    if open_browser {
        if let Err(e) = open::that(&url) {
            warn!(error = %e, "Could not open a browser");
        }
    }

    let state = WebState {
        config: Arc::new(config),
    };
    axum::serve(listener, router(state)).await.context("Web server failed")?;
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

async fn params(State(state): State<WebState>) -> Json<Params> {
    Json(state.config.params())
}

async fn console_socket(ws: WebSocketUpgrade, State(state): State<WebState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

async fn run_session(socket: WebSocket, state: WebState) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            if let Err(e) = send_message(&mut sender, &message).await {
                debug!(error = %e, "Browser went away");
                break;
            }
        }
    });

    info!("Browser console attached");
    let config = state.config;
    let frontend = Arc::new(WebFrontEnd::new(outbound));
    let client = Arc::new(XmppClient::new(config.client_options()));
    let controller = SessionController::new(client.clone(), frontend.clone(), config.presupplied());
    let bootstrap = tokio::spawn(start(controller.clone(), frontend.clone(), config.service.clone()));

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(error = %e, "WebSocket error");
                break;
            }
            _ => continue,
        };
        let message: ClientMessage = match serde_json::from_str(text.as_str()) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed browser message");
                continue;
            }
        };
        match message {
            ClientMessage::Answer { id, value } => {
                if !frontend.answer(id, value) {
                    debug!(id, "Answer for an unknown prompt");
                }
            }
            ClientMessage::Cancel { id } => {
                frontend.cancel(id);
            }
            ClientMessage::Send { xml } => controller.send(xml.trim()).await,
        }
    }

    info!("Browser console detached");
    frontend.cancel_all();
    bootstrap.abort();
    if let Err(e) = client.stop().await {
        debug!(error = %e, "Stream already down");
    }
    controller.shutdown();
    writer.abort();
}

async fn start(controller: Arc<SessionController>, frontend: Arc<WebFrontEnd>, service: Option<String>) {
    let service = match service {
        Some(service) => service,
        None => {
            let request = PromptRequest::new("service", "Service").with_default(DEFAULT_SERVICE);
            match frontend.ask(&request).await {
                Ok(service) => service,
                Err(_) => return,
            }
        }
    };
    controller.connect(&service).await;
}

async fn send_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> std::result::Result<(), axum::Error> {
    let json = serde_json::to_string(message).map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthType, Transport};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn frontend() -> (Arc<WebFrontEnd>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(WebFrontEnd::new(tx)), rx)
    }

    fn config(service: Option<&str>) -> ConsoleConfig {
        ConsoleConfig {
            service: service.map(str::to_string),
            auth_type: AuthType::Client,
            transport: Transport::Auto,
            domain: Some("localhost".into()),
            username: Some("alice".into()),
            password: Some("secret".into()),
            insecure_tls: false,
        }
    }

    #[tokio::test]
    async fn test_answer_resolves_prompt() {
        let (frontend, mut rx) = frontend();
        let asking = {
            let frontend = frontend.clone();
            tokio::spawn(async move { frontend.ask(&PromptRequest::new("domain", "Domain")).await })
        };

        let id = match rx.recv().await.unwrap() {
            ServerMessage::Ask { id, name, password, .. } => {
                assert_eq!(name, "domain");
                assert!(!password);
                id
            }
            other => panic!("unexpected {other:?}"),
        };
        assert!(frontend.answer(id, "example.com".into()));
        assert_eq!(asking.await.unwrap().unwrap(), "example.com");
        assert!(!frontend.answer(id, "again".into()));
    }

    #[tokio::test]
    async fn test_empty_answer_takes_default() {
        let (frontend, mut rx) = frontend();
        let asking = {
            let frontend = frontend.clone();
            tokio::spawn(async move {
                frontend
                    .ask(&PromptRequest::new("service", "Service").with_default(DEFAULT_SERVICE))
                    .await
            })
        };
        let Some(ServerMessage::Ask { id, default, .. }) = rx.recv().await else {
            panic!("expected a prompt");
        };
        assert_eq!(default.as_deref(), Some(DEFAULT_SERVICE));
        frontend.answer(id, " ".into());
        assert_eq!(asking.await.unwrap().unwrap(), DEFAULT_SERVICE);
    }

    #[tokio::test]
    async fn test_password_answer_is_not_trimmed() {
        let (frontend, mut rx) = frontend();
        let asking = {
            let frontend = frontend.clone();
            tokio::spawn(async move { frontend.ask(&PromptRequest::new("password", "Password").password()).await })
        };
        let Some(ServerMessage::Ask { id, password, .. }) = rx.recv().await else {
            panic!("expected a prompt");
        };
        assert!(password);
        frontend.answer(id, " pass phrase ".into());
        assert_eq!(asking.await.unwrap().unwrap(), " pass phrase ");
    }

    #[tokio::test]
    async fn test_cancel_and_cancel_all() {
        let (frontend, mut rx) = frontend();
        let first = {
            let frontend = frontend.clone();
            tokio::spawn(async move { frontend.ask(&PromptRequest::new("username", "Username")).await })
        };
        let Some(ServerMessage::Ask { id, .. }) = rx.recv().await else {
            panic!("expected a prompt");
        };
        assert!(frontend.cancel(id));
        assert!(matches!(first.await.unwrap(), Err(ConsoleError::PromptCancelled)));

        let second = {
            let frontend = frontend.clone();
            tokio::spawn(async move {
                frontend
                    .choose(&ChoiceRequest::new("SASL mechanism", vec!["PLAIN".into()]))
                    .await
            })
        };
        assert!(matches!(rx.recv().await, Some(ServerMessage::Choose { .. })));
        assert_eq!(frontend.pending_count(), 1);
        frontend.cancel_all();
        assert!(matches!(second.await.unwrap(), Err(ConsoleError::PromptCancelled)));
        assert_eq!(frontend.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_prompt_fails_once_page_is_gone() {
        let (frontend, rx) = frontend();
        drop(rx);
        let result = frontend.ask(&PromptRequest::new("password", "Password").password()).await;
        assert!(matches!(result, Err(ConsoleError::PromptCancelled)));
        assert_eq!(frontend.pending_count(), 0);
    }

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_value(ServerMessage::Render {
            direction: Direction::Inbound,
            xml: "<presence/>".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "render", "direction": "in", "xml": "<presence/>"}));

        let json = serde_json::to_value(ServerMessage::Log {
            level: Level::Warning,
            message: "careful".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "log", "level": "warning", "message": "careful"}));

        assert_eq!(
            serde_json::to_value(ServerMessage::Reset).unwrap(),
            serde_json::json!({"type": "reset"})
        );

        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"answer","id":3,"value":"x"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::Answer { id: 3, value: "x".into() });
        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"send","xml":"<presence/>"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::Send { xml: "<presence/>".into() });
    }

    #[tokio::test]
    async fn test_params_endpoint() {
        let state = WebState {
            config: Arc::new(config(Some("xmpp://localhost"))),
        };
        let Json(params) = params(State(state)).await;
        assert_eq!(params.service.as_deref(), Some("xmpp://localhost"));
        assert!(params.has_password);
        assert!(!serde_json::to_string(&params).unwrap().contains("secret"));
    }

    #[tokio::test]
    async fn test_socket_session_asks_for_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = WebState {
            config: Arc::new(config(None)),
        };
        tokio::spawn(async move { axum::serve(listener, router(state)).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/console"))
            .await
            .unwrap();

        let first = loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => break text,
                _ => continue,
            }
        };
        let json: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(json["type"], "ask");
        assert_eq!(json["name"], "service");
        assert_eq!(json["default"], DEFAULT_SERVICE);

        // cancelling the service prompt ends the bootstrap quietly
        let cancel = serde_json::json!({"type": "cancel", "id": json["id"]}).to_string();
        ws.send(WsMessage::Text(cancel)).await.unwrap();
        ws.close(None).await.unwrap();
    }
}
