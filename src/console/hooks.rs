//! The surface a front-end plugs into the console.
//!
//! A front-end implements [`FrontEnd`] and hands it to the controller at
//! construction. Only the prompt hooks are mandatory; notifications, rendering
//! and input reset fall back to a plain console sink.

use async_trait::async_trait;
use colored::Colorize;
use serde::Serialize;

use crate::console::prompt::{ChoiceRequest, PromptRequest};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn glyph(self) -> &'static str {
        match self {
            Level::Info => "🛈",
            Level::Warning => "⚠",
            Level::Error => "❌",
        }
    }
}

/// Direction of a rendered stanza relative to this console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    #[serde(rename = "in")]
    Inbound,
    #[serde(rename = "out")]
    Outbound,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::Inbound => "⮈ IN",
            Direction::Outbound => "⮊ OUT",
        }
    }
}

#[async_trait]
pub trait FrontEnd: Send + Sync {
    /// Render one question and resolve with the operator's answer.
    async fn ask(&self, request: &PromptRequest) -> Result<String>;

    /// Render a list of options and resolve with the selected one.
    async fn choose(&self, request: &ChoiceRequest) -> Result<String>;

    fn notify(&self, level: Level, message: &str) {
        print_notification(level, message);
    }

    /// `xml` is already pretty-printed.
    fn render(&self, direction: Direction, xml: &str) {
        print_stanza(direction, xml);
    }

    /// Called once an operator-submitted element has been sent.
    fn reset_input(&self) {}
}

/// Default notification sink: a glyph-prefixed line on stdout, mirrored into
/// the diagnostic log.
pub fn print_notification(level: Level, message: &str) {
    match level {
        Level::Info => {
            tracing::info!(target: "console", "{}", message);
            println!("{} {}", level.glyph().cyan(), message);
        }
        Level::Warning => {
            tracing::warn!(target: "console", "{}", message);
            println!("{} {}", level.glyph().yellow(), message.yellow());
        }
        Level::Error => {
            tracing::error!(target: "console", "{}", message);
            println!("{} {}", level.glyph().red(), message.red());
        }
    }
}

pub fn print_stanza(direction: Direction, xml: &str) {
    let label = match direction {
        Direction::Inbound => direction.label().green().bold(),
        Direction::Outbound => direction.label().blue().bold(),
    };
    println!("{}\n{}\n", label, xml);
}
