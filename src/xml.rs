//! Minimal XML element tree on top of quick-xml.
//!
//! Only what the console needs: parse one well-formed element, serialize it
//! back compactly (for the wire) or with two-space indentation (for display).

use std::fmt;
use std::str::FromStr;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XmlError {
    #[error("{0}")]
    Syntax(String),
    #[error("no root element")]
    Empty,
    #[error("unclosed element <{0}>")]
    Unclosed(String),
    #[error("mismatched end tag </{found}>, expected </{expected}>")]
    Mismatched { expected: String, found: String },
    #[error("content after the root element")]
    TrailingContent,
    #[error("text outside of the root element")]
    StrayText,
    #[error("failed to serialize element: {0}")]
    Write(String),
}

/// A child of an [`Element`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with its attributes and children in document order.
///
/// Names are kept qualified (`stream:features`), namespaces are plain
/// `xmlns` attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Name without its prefix: `stream:features` -> `features`.
    pub fn local_name(&self) -> &str {
        self.name
            .rsplit_once(':')
            .map(|(_, local)| local)
            .unwrap_or(&self.name)
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given local name.
    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.elements().find(|e| e.local_name() == local_name)
    }

    /// Concatenated text of the direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Parse exactly one root element.
    ///
    /// XML declarations, comments and processing instructions around the root
    /// are skipped. Whitespace-only text nodes are dropped.
    pub fn parse(input: &str) -> Result<Element, XmlError> {
        let mut reader = Reader::from_str(input);
        reader.config_mut().check_end_names = true;

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    if root.is_some() {
                        return Err(XmlError::TrailingContent);
                    }
                    stack.push(start_element(&e)?);
                }
                Ok(Event::Empty(e)) => {
                    if root.is_some() {
                        return Err(XmlError::TrailingContent);
                    }
                    let element = start_element(&e)?;
                    attach(&mut stack, &mut root, element);
                }
                Ok(Event::End(e)) => {
                    let found = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let element = stack.pop().ok_or_else(|| {
                        XmlError::Syntax(format!("unexpected end tag </{}>", found))
                    })?;
                    if element.name != found {
                        return Err(XmlError::Mismatched {
                            expected: element.name,
                            found,
                        });
                    }
                    attach(&mut stack, &mut root, element);
                }
                Ok(Event::Text(e)) => {
                    let text = e
                        .unescape()
                        .map_err(|err| XmlError::Syntax(err.to_string()))?;
                    push_text(&mut stack, text.into_owned())?;
                }
                Ok(Event::CData(e)) => {
                    push_text(&mut stack, String::from_utf8_lossy(&e).into_owned())?;
                }
                Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {}
                Ok(Event::Eof) => break,
                Err(e) => return Err(XmlError::Syntax(e.to_string())),
            }
        }

        if let Some(open) = stack.pop() {
            return Err(XmlError::Unclosed(open.name));
        }
        root.ok_or(XmlError::Empty)
    }

    /// Serialize with two-space indentation.
    pub fn to_pretty_string(&self) -> Result<String, XmlError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        write_element(&mut writer, self)?;
        String::from_utf8(writer.into_inner()).map_err(|e| XmlError::Write(e.to_string()))
    }

    fn to_compact_string(&self) -> Result<String, XmlError> {
        let mut writer = Writer::new(Vec::new());
        write_element(&mut writer, self)?;
        String::from_utf8(writer.into_inner()).map_err(|e| XmlError::Write(e.to_string()))
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let compact = self.to_compact_string().map_err(|_| fmt::Error)?;
        f.write_str(&compact)
    }
}

impl FromStr for Element {
    type Err = XmlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Element::parse(s)
    }
}

fn start_element(e: &BytesStart<'_>) -> Result<Element, XmlError> {
    let mut element = Element::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for attr in e.attributes() {
        let attr = attr.map_err(|err| XmlError::Syntax(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| XmlError::Syntax(err.to_string()))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None => *root = Some(element),
    }
}

fn push_text(stack: &mut [Element], text: String) -> Result<(), XmlError> {
    if text.trim().is_empty() {
        return Ok(());
    }
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Text(text));
            Ok(())
        }
        None => Err(XmlError::StrayText),
    }
}

fn write_element<W: std::io::Write>(writer: &mut Writer<W>, element: &Element) -> Result<(), XmlError> {
    let mut start = BytesStart::new(element.name.as_str());
    for (key, value) in &element.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() {
        return writer
            .write_event(Event::Empty(start))
            .map_err(|e| XmlError::Write(e.to_string()));
    }

    writer
        .write_event(Event::Start(start))
        .map_err(|e| XmlError::Write(e.to_string()))?;
    for child in &element.children {
        match child {
            Node::Element(e) => write_element(writer, e)?,
            Node::Text(t) => writer
                .write_event(Event::Text(BytesText::new(t)))
                .map_err(|e| XmlError::Write(e.to_string()))?,
        }
    }
    writer
        .write_event(Event::End(BytesEnd::new(element.name.as_str())))
        .map_err(|e| XmlError::Write(e.to_string()))
}

/// What travels through the console: a parsed element, or the raw text when
/// it could not (or has not yet) been parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stanza {
    Element(Element),
    Raw(String),
}

impl From<Element> for Stanza {
    fn from(element: Element) -> Self {
        Stanza::Element(element)
    }
}

impl From<String> for Stanza {
    fn from(text: String) -> Self {
        Stanza::Raw(text)
    }
}

impl From<&str> for Stanza {
    fn from(text: &str) -> Self {
        Stanza::Raw(text.to_string())
    }
}

/// Wire form: compact for elements, verbatim for raw text.
impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stanza::Element(element) => element.fmt(f),
            Stanza::Raw(text) => f.write_str(text),
        }
    }
}
