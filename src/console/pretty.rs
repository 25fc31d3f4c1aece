//! Stanza pretty-printing for display.

use crate::xml::{Element, Stanza};

/// Format a stanza for display with two-space indentation.
///
/// Raw text that does not parse is returned unchanged so malformed fragments
/// stay visible to the operator.
pub fn format(stanza: &Stanza) -> String {
    match stanza {
        Stanza::Element(element) => element
            .to_pretty_string()
            .unwrap_or_else(|_| element.to_string()),
        Stanza::Raw(text) => format_str(text),
    }
}

pub fn format_str(text: &str) -> String {
    match Element::parse(text) {
        Ok(element) => element.to_pretty_string().unwrap_or_else(|_| text.to_string()),
        Err(_) => text.to_string(),
    }
}
