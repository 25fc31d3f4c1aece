//! Terminal front-end: a line editor for prompts and XML input.
//!
//! rustyline blocks, so it runs on a thread of its own and serves requests in
//! the order they arrive. Prompts and the XML prompt therefore never overlap.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Context as _;
use async_trait::async_trait;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::{ClientOptions, XmppClient};
use crate::config::{ConsoleConfig, DEFAULT_SERVICE};
use crate::connection::Connection;
use crate::console::hooks::FrontEnd;
use crate::console::prompt::{ChoiceRequest, PromptKind, PromptRequest};
use crate::console::session::{Lifecycle, Presupplied, SessionController};
use crate::error::{ConsoleError, Result};

const XML_PROMPT: &str = "xml> ";

/// Why a line could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    /// Ctrl-C
    Interrupted,
    /// Ctrl-D
    Eof,
    Failed(String),
}

impl From<ReadlineError> for LineError {
    fn from(e: ReadlineError) -> Self {
        match e {
            ReadlineError::Interrupted => LineError::Interrupted,
            ReadlineError::Eof => LineError::Eof,
            other => LineError::Failed(other.to_string()),
        }
    }
}

enum InputRequest {
    Line {
        prompt: String,
        /// Text placed in the editor before the operator types.
        initial: Option<String>,
        reply: oneshot::Sender<Result<String, LineError>>,
    },
    Secret {
        prompt: String,
        reply: oneshot::Sender<Result<String, LineError>>,
    },
    History(String),
}

/// Handle on the input thread.
#[derive(Clone)]
pub struct LineInput {
    requests: std_mpsc::Sender<InputRequest>,
}

impl LineInput {
    pub fn spawn() -> anyhow::Result<Self> {
        let mut editor = DefaultEditor::new().context("Failed to initialise the line editor")?;
        let (requests, queue) = std_mpsc::channel::<InputRequest>();

        thread::Builder::new()
            .name("console-input".to_string())
            .spawn(move || {
                for request in queue {
                    match request {
                        InputRequest::Line { prompt, initial, reply } => {
                            let line = match initial {
                                Some(initial) => editor.readline_with_initial(&prompt, (initial.as_str(), "")),
                                None => editor.readline(&prompt),
                            };
                            let _ = reply.send(line.map_err(LineError::from));
                        }
                        InputRequest::Secret { prompt, reply } => {
                            let answer = rpassword::prompt_password(prompt).map_err(|e| match e.kind() {
                                std::io::ErrorKind::Interrupted => LineError::Interrupted,
                                std::io::ErrorKind::UnexpectedEof => LineError::Eof,
                                _ => LineError::Failed(e.to_string()),
                            });
                            let _ = reply.send(answer);
                        }
                        InputRequest::History(line) => {
                            let _ = editor.add_history_entry(line);
                        }
                    }
                }
                debug!("Input thread finished");
            })
            .context("Failed to start the input thread")?;

        Ok(Self { requests })
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<String, LineError>>) -> InputRequest,
    ) -> Result<String, LineError> {
        let (reply, answer) = oneshot::channel();
        self.requests
            .send(make(reply))
            .map_err(|_| LineError::Failed("input thread gone".to_string()))?;
        answer
            .await
            .map_err(|_| LineError::Failed("input thread gone".to_string()))?
    }

    pub async fn read_line(&self, prompt: &str) -> Result<String, LineError> {
        self.edit_line(prompt, None).await
    }

    /// Like `read_line`, starting from `initial` instead of an empty line.
    pub async fn edit_line(&self, prompt: &str, initial: Option<String>) -> Result<String, LineError> {
        let prompt = prompt.to_string();
        self.request(|reply| InputRequest::Line { prompt, initial, reply }).await
    }

    pub async fn read_secret(&self, prompt: &str) -> Result<String, LineError> {
        let prompt = prompt.to_string();
        self.request(|reply| InputRequest::Secret { prompt, reply }).await
    }

    pub fn remember(&self, line: &str) {
        let _ = self.requests.send(InputRequest::History(line.to_string()));
    }
}

pub struct TerminalFrontEnd {
    input: LineInput,
    /// XML line waiting for `reset_input` to be committed to history.
    submitted: Mutex<Option<String>>,
}

fn prompt_label(request: &PromptRequest) -> String {
    match &request.default {
        Some(default) => format!("{} [{}]: ", request.text, default),
        None => format!("{}: ", request.text),
    }
}

/// Accept either the option's number or its literal text.
pub fn pick_choice(choices: &[String], answer: &str) -> String {
    let answer = answer.trim();
    answer
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| choices.get(i))
        .cloned()
        .unwrap_or_else(|| answer.to_string())
}

impl TerminalFrontEnd {
    pub fn new(input: LineInput) -> Self {
        Self {
            input,
            submitted: Mutex::new(None),
        }
    }

    fn submit(&self, line: &str) {
        if let Ok(mut submitted) = self.submitted.lock() {
            *submitted = Some(line.to_string());
        }
    }

    /// The submitted line, if it was never confirmed by `reset_input`.
    fn unsent(&self) -> Option<String> {
        self.submitted.lock().ok().and_then(|mut s| s.take())
    }
}

#[async_trait]
impl FrontEnd for TerminalFrontEnd {
    async fn ask(&self, request: &PromptRequest) -> Result<String> {
        let label = prompt_label(request);
        let answer = match request.kind {
            PromptKind::Password => self.input.read_secret(&label).await,
            PromptKind::Text => self.input.read_line(&label).await,
        }
        .map_err(|e| {
            debug!(name = %request.name, error = ?e, "Prompt not answered");
            ConsoleError::PromptCancelled
        })?;

        Ok(request.settle(answer))
    }

    async fn choose(&self, request: &ChoiceRequest) -> Result<String> {
        println!("{}", request.text.bold());
        for (i, choice) in request.choices.iter().enumerate() {
            println!("  {}) {}", i + 1, choice);
        }
        let answer = self
            .input
            .read_line(&format!("Choice [1-{}]: ", request.choices.len()))
            .await
            .map_err(|_| ConsoleError::PromptCancelled)?;
        Ok(pick_choice(&request.choices, &answer))
    }

    fn reset_input(&self) {
        let line = self.submitted.lock().ok().and_then(|mut s| s.take());
        if let Some(line) = line {
            self.input.remember(&line);
        }
    }
}

/// Run one terminal session until the connection closes or the operator
/// leaves with Ctrl-D.
pub async fn run(config: ConsoleConfig) -> anyhow::Result<()> {
    let input = LineInput::spawn()?;
    let frontend = Arc::new(TerminalFrontEnd::new(input.clone()));

    let service = match &config.service {
        Some(service) => service.clone(),
        None => {
            let request = PromptRequest::new("service", "Service").with_default(DEFAULT_SERVICE);
            match frontend.ask(&request).await {
                Ok(service) => service,
                Err(_) => return Ok(()),
            }
        }
    };

    let options: ClientOptions = config.client_options();
    let client = Arc::new(XmppClient::new(options));
    let presupplied: Presupplied = config.presupplied();
    let controller = SessionController::new(client.clone(), frontend.clone(), presupplied);
    let mut lifecycle = controller.lifecycle();

    if !controller.connect(&service).await {
        return Ok(());
    }

    // XML input only makes sense once the session is online
    loop {
        let state = lifecycle.borrow_and_update().clone();
        match state {
            Lifecycle::Online(_) => break,
            Lifecycle::Closed => return Ok(()),
            _ => {}
        }
        if lifecycle.changed().await.is_err() {
            return Ok(());
        }
    }
    println!(
        "{}",
        "Type an XML stanza and press Enter to send it. Ctrl-D quits.".bright_black()
    );

    // a rejected line comes back for correction
    let mut draft: Option<String> = None;
    loop {
        let line = tokio::select! {
            line = input.edit_line(XML_PROMPT, draft.take()) => line,
            _ = closed(&mut lifecycle) => break,
        };
        match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => {
                frontend.submit(&line);
                controller.send(line.trim()).await;
                draft = frontend.unsent();
            }
            Err(LineError::Interrupted) => {
                println!("{}", "Ctrl-C: press Ctrl-D to quit.".yellow());
            }
            Err(LineError::Eof) => {
                info!("Operator left the console");
                if let Err(e) = client.stop().await {
                    warn!(error = %e, "Failed to close the stream");
                }
                break;
            }
            Err(LineError::Failed(e)) => {
                warn!(error = %e, "Line editor failed");
                let _ = client.stop().await;
                break;
            }
        }
    }
    Ok(())
}

async fn closed(lifecycle: &mut tokio::sync::watch::Receiver<Lifecycle>) {
    loop {
        if *lifecycle.borrow_and_update() == Lifecycle::Closed {
            return;
        }
        if lifecycle.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_choice() {
        let choices = vec!["PLAIN".to_string(), "ANONYMOUS".to_string()];
        assert_eq!(pick_choice(&choices, "2"), "ANONYMOUS");
        assert_eq!(pick_choice(&choices, " PLAIN "), "PLAIN");
        assert_eq!(pick_choice(&choices, "0"), "0");
        assert_eq!(pick_choice(&choices, "3"), "3");
    }

    #[test]
    fn test_prompt_label() {
        let request = PromptRequest::new("service", "Service").with_default("xmpp://localhost");
        assert_eq!(prompt_label(&request), "Service [xmpp://localhost]: ");
        assert_eq!(prompt_label(&PromptRequest::new("domain", "Domain")), "Domain: ");
    }

    fn detached_frontend() -> (TerminalFrontEnd, std_mpsc::Receiver<InputRequest>) {
        let (requests, queue) = std_mpsc::channel();
        (TerminalFrontEnd::new(LineInput { requests }), queue)
    }

    #[test]
    fn test_rejected_line_is_kept_for_editing() {
        let (frontend, queue) = detached_frontend();

        frontend.submit("<presence");
        assert_eq!(frontend.unsent().as_deref(), Some("<presence"));
        assert!(queue.try_recv().is_err());

        frontend.submit("<presence/>");
        frontend.reset_input();
        assert_eq!(frontend.unsent(), None);
        assert!(matches!(queue.try_recv(), Ok(InputRequest::History(line)) if line == "<presence/>"));
    }

    #[tokio::test]
    async fn test_edit_line_carries_draft() {
        let (frontend, queue) = detached_frontend();
        let input = frontend.input.clone();
        let editing = tokio::spawn(async move { input.edit_line(XML_PROMPT, Some("<presence".into())).await });

        let request = tokio::task::spawn_blocking(move || queue.recv().unwrap()).await.unwrap();
        match request {
            InputRequest::Line { prompt, initial, reply } => {
                assert_eq!(prompt, XML_PROMPT);
                assert_eq!(initial.as_deref(), Some("<presence"));
                reply.send(Ok("<presence/>".into())).unwrap();
            }
            _ => panic!("expected a line request"),
        }
        assert_eq!(editing.await.unwrap(), Ok("<presence/>".to_string()));
    }

    #[test]
    fn test_line_error_mapping() {
        assert_eq!(LineError::from(ReadlineError::Interrupted), LineError::Interrupted);
        assert_eq!(LineError::from(ReadlineError::Eof), LineError::Eof);
    }
}
