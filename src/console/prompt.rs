//! Prompt broker: questions and choices as futures.
//!
//! The broker owns the pre-supplied short-circuit and the ordering of
//! multi-prompt sequences; rendering is delegated to the [`FrontEnd`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::console::hooks::FrontEnd;
use crate::error::{ConsoleError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    #[default]
    Text,
    /// Do not echo, do not keep in history.
    Password,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    /// Key of the answer in [`PromptBroker::ask_multiple`] results.
    pub name: String,
    pub text: String,
    pub default: Option<String>,
    /// When set, resolves immediately with this value. Presence is what
    /// counts: an empty string still skips the prompt.
    pub precomputed: Option<String>,
    pub kind: PromptKind,
}

impl PromptRequest {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            default: None,
            precomputed: None,
            kind: PromptKind::Text,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_precomputed(mut self, value: Option<String>) -> Self {
        self.precomputed = value;
        self
    }

    pub fn password(mut self) -> Self {
        self.kind = PromptKind::Password;
        self
    }

    /// Turn what the operator typed into the answer.
    ///
    /// Text is trimmed and falls back to the default when empty. Passwords are
    /// taken byte for byte.
    pub fn settle(&self, typed: String) -> String {
        let answer = match self.kind {
            PromptKind::Password => typed,
            PromptKind::Text => typed.trim().to_string(),
        };
        match &self.default {
            Some(default) if answer.is_empty() => default.clone(),
            _ => answer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceRequest {
    pub text: String,
    pub choices: Vec<String>,
}

impl ChoiceRequest {
    pub fn new(text: impl Into<String>, choices: Vec<String>) -> Self {
        Self {
            text: text.into(),
            choices,
        }
    }
}

#[derive(Clone)]
pub struct PromptBroker {
    frontend: Arc<dyn FrontEnd>,
}

impl PromptBroker {
    pub fn new(frontend: Arc<dyn FrontEnd>) -> Self {
        Self { frontend }
    }

    pub async fn ask(&self, request: &PromptRequest) -> Result<String> {
        if let Some(value) = &request.precomputed {
            debug!(name = %request.name, "Prompt answered from pre-supplied value");
            return Ok(value.clone());
        }
        self.frontend.ask(request).await
    }

    /// Ask each request in list order, one at a time.
    ///
    /// The first failure aborts the sequence.
    pub async fn ask_multiple(&self, requests: &[PromptRequest]) -> Result<HashMap<String, String>> {
        let mut answers = HashMap::with_capacity(requests.len());
        for request in requests {
            let value = self.ask(request).await?;
            answers.insert(request.name.clone(), value);
        }
        Ok(answers)
    }

    pub async fn choose(&self, request: &ChoiceRequest) -> Result<String> {
        let selected = self.frontend.choose(request).await?;
        if !request.choices.iter().any(|c| *c == selected) {
            debug!(selected = %selected, "Choice not among the offered options");
            return Err(ConsoleError::PromptCancelled);
        }
        Ok(selected)
    }
}
