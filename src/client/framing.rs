//! XML stream framing: stanza boundaries on byte streams, stream headers, and
//! the RFC 7395 WebSocket variants of both.

use std::borrow::Cow;

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

pub const STREAM_NS: &str = "http://etherx.jabber.org/streams";
pub const FRAMING_NS: &str = "urn:ietf:params:xml:ns:xmpp-framing";

const STREAM_CLOSE: &str = "</stream:stream>";

/// How one inbound frame relates to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `<stream:stream ...>` or `<open/>`, with its attributes.
    Header(Vec<(String, String)>),
    /// `</stream:stream>` or `<close/>`.
    Close,
    /// A top-level element inside the stream.
    Element,
}

/// Opening tag for an outbound stream in TCP framing.
pub fn stream_header(namespace: &str, domain: &str, versioned: bool) -> String {
    let version = if versioned { " version='1.0'" } else { "" };
    format!(
        "<?xml version='1.0'?><stream:stream to='{}'{} xmlns='{}' xmlns:stream='{}'>",
        quick_xml::escape::escape(domain),
        version,
        namespace,
        STREAM_NS
    )
}

pub fn stream_close() -> &'static str {
    STREAM_CLOSE
}

fn skip_declaration(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return trimmed[end + 2..].trim_start();
        }
    }
    trimmed
}

fn is_stream_tag(tag: &BytesStart<'_>) -> bool {
    tag.name().as_ref() == b"stream:stream" || tag.local_name().as_ref() == b"stream"
}

fn tag_attributes(tag: &BytesStart<'_>) -> Vec<(String, String)> {
    tag.attributes()
        .flatten()
        .map(|attr| {
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map(Cow::into_owned)
                .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
            (key, value)
        })
        .collect()
}

/// Classify an inbound frame from either transport.
pub fn classify(text: &str) -> Frame {
    let body = skip_declaration(text);
    if body.starts_with("</stream:stream") || body.starts_with("<close") {
        return Frame::Close;
    }
    if !(body.starts_with("<stream:stream") || body.starts_with("<open")) {
        return Frame::Element;
    }

    let mut reader = Reader::from_str(body);
    reader.config_mut().check_end_names = false;
    match reader.read_event() {
        Ok(Event::Start(tag)) | Ok(Event::Empty(tag))
            if is_stream_tag(&tag) || tag.name().as_ref() == b"open" =>
        {
            Frame::Header(tag_attributes(&tag))
        }
        _ => Frame::Element,
    }
}

/// Rewrite a TCP-framed outbound frame for a WebSocket peer.
///
/// Stream headers become `<open/>`, the closing tag becomes `<close/>`, and
/// `stream:`-prefixed elements get an explicit namespace since a WebSocket
/// message has no enclosing `<stream:stream>` to declare the prefix.
/// Everything else is passed through untouched.
pub fn to_websocket_framing(text: &str) -> Cow<'_, str> {
    let body = skip_declaration(text);

    if body == STREAM_CLOSE {
        return Cow::Owned(format!(r#"<close xmlns="{}"/>"#, FRAMING_NS));
    }

    if body.starts_with("<stream:stream") {
        let mut reader = Reader::from_str(body);
        reader.config_mut().check_end_names = false;
        if let Ok(Event::Start(tag)) | Ok(Event::Empty(tag)) = reader.read_event() {
            let mut open = format!(r#"<open xmlns="{}""#, FRAMING_NS);
            for (key, value) in tag_attributes(&tag) {
                if key == "xmlns" || key.starts_with("xmlns:") {
                    continue;
                }
                open.push_str(&format!(r#" {}="{}""#, key, quick_xml::escape::escape(&value)));
            }
            open.push_str("/>");
            return Cow::Owned(open);
        }
        return Cow::Borrowed(text);
    }

    if body.starts_with("<stream:") {
        let unprefixed = body.replace("</stream:", "</").replace("<stream:", "<");
        let root_end = unprefixed.find('>').unwrap_or(unprefixed.len());
        if unprefixed[..root_end].contains("xmlns=") {
            return Cow::Owned(unprefixed);
        }
        let name_end = unprefixed
            .find([' ', '>', '/'])
            .unwrap_or(unprefixed.len());
        let mut rewritten = String::with_capacity(unprefixed.len() + STREAM_NS.len() + 10);
        rewritten.push_str(&unprefixed[..name_end]);
        rewritten.push_str(&format!(r#" xmlns="{}""#, STREAM_NS));
        rewritten.push_str(&unprefixed[name_end..]);
        return Cow::Owned(rewritten);
    }

    Cow::Borrowed(text)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// `<!` markup cut short by the end of the buffer, e.g. `<![CDA`.
fn ends_in_partial_bang(buffer: &[u8]) -> bool {
    const BANG_OPENERS: [&[u8]; 3] = [b"<!--", b"<![CDATA[", b"<!DOCTYPE"];
    let Some(at) = buffer.windows(2).rposition(|w| w == b"<!") else {
        return false;
    };
    let tail = &buffer[at..];
    BANG_OPENERS
        .iter()
        .any(|opener| tail.len() < opener.len() && opener.starts_with(tail))
}

/// Cut the next complete frame off the front of `buffer`.
///
/// Returns the frame text and the number of bytes it used (leading whitespace
/// included), or `None` until more bytes arrive. The stream header is a frame
/// of its own even though its element never closes. Bytes that can never
/// become well-formed are an error.
pub fn extract_stanza(buffer: &[u8]) -> Result<Option<(String, usize)>, String> {
    let Some(start) = buffer.iter().position(|b| !b.is_ascii_whitespace()) else {
        return Ok(None);
    };
    if buffer[start..].starts_with(STREAM_CLOSE.as_bytes()) {
        return Ok(Some((STREAM_CLOSE.to_string(), start + STREAM_CLOSE.len())));
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut stanza_start: Option<usize> = None;

    loop {
        let offset = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(tag)) => {
                if stanza_start.is_none() && is_stream_tag(&tag) {
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((lossy(&buffer[..end]), end)));
                }
                if stanza_start.is_none() {
                    stanza_start = Some(offset);
                }
                depth += 1;
            }
            Ok(Event::Empty(tag)) => {
                if stanza_start.is_none() {
                    let end = reader.buffer_position() as usize;
                    let from = if is_stream_tag(&tag) { 0 } else { offset };
                    return Ok(Some((lossy(&buffer[from..end]), end)));
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    // stray end tag: only the stream's own can appear here
                    let end = reader.buffer_position() as usize;
                    return Ok(Some((STREAM_CLOSE.to_string(), end)));
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(begin) = stanza_start {
                        let end = reader.buffer_position() as usize;
                        return Ok(Some((lossy(&buffer[begin..end]), end)));
                    }
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(quick_xml::Error::Syntax(
                SyntaxError::UnclosedTag
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedDoctype
                | SyntaxError::UnclosedPIOrXmlDecl,
            )) => return Ok(None),
            Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup)) if ends_in_partial_bang(buffer) => {
                return Ok(None)
            }
            Err(e) => {
                debug!(error = ?e, offset, "Inbound XML is not well-formed");
                return Err(format!("Inbound XML is not well-formed: {}", e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_stream_header_with_declaration() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s1' version='1.0'>";
        let (frame, used) = extract_stanza(buf).unwrap().unwrap();
        assert!(frame.starts_with("<?xml"));
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_extract_header_then_features() {
        let buf = b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' id='x'><stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>";
        let (header, used) = extract_stanza(buf).unwrap().unwrap();
        assert!(header.contains("id='x'"));
        let (features, rest) = extract_stanza(&buf[used..]).unwrap().unwrap();
        assert!(features.starts_with("<stream:features>"));
        assert!(features.ends_with("</stream:features>"));
        assert_eq!(used + rest, buf.len());
    }

    #[test]
    fn test_extract_self_closing() {
        let (frame, used) = extract_stanza(b"  <presence/><iq/>").unwrap().unwrap();
        assert_eq!(frame, "<presence/>");
        assert_eq!(used, 13);
    }

    #[test]
    fn test_extract_incomplete() {
        assert_eq!(extract_stanza(b"<message to='a@b'><body>hel"), Ok(None));
        assert_eq!(extract_stanza(b""), Ok(None));
        assert_eq!(extract_stanza(b" \r\n "), Ok(None));
    }

    #[test]
    fn test_extract_chunk_ends_inside_markup() {
        assert_eq!(extract_stanza(b"<message><body>hi</body><!-- note"), Ok(None));
        assert_eq!(extract_stanza(b"<message><body><![CDATA[a < b"), Ok(None));
        assert_eq!(extract_stanza(b"<message><body><![CD"), Ok(None));
        assert_eq!(extract_stanza(b"<message><!"), Ok(None));
        assert_eq!(extract_stanza(b"<?xml version='1.0'"), Ok(None));

        let buf = b"<message><!-- note --><body><![CDATA[a < b]]></body></message>";
        let (frame, used) = extract_stanza(buf).unwrap().unwrap();
        assert_eq!(frame.as_bytes(), buf);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_extract_not_well_formed_is_error() {
        let err = extract_stanza(b"<message><!bogus></message>").unwrap_err();
        assert!(err.contains("not well-formed"), "{}", err);
    }

    #[test]
    fn test_extract_message_with_entities() {
        let buf = b"<message><body>a &amp; b &lt;3</body></message><presence/>";
        let (frame, used) = extract_stanza(buf).unwrap().unwrap();
        assert_eq!(frame, "<message><body>a &amp; b &lt;3</body></message>");
        assert_eq!(&buf[used..], b"<presence/>");
    }

    #[test]
    fn test_extract_stream_close() {
        let (frame, used) = extract_stanza(b"\n</stream:stream>").unwrap().unwrap();
        assert_eq!(frame, "</stream:stream>");
        assert_eq!(used, 17);
    }

    #[test]
    fn test_classify() {
        let header = "<?xml version='1.0'?><stream:stream from='example.com' id='abc' xmlns:stream='http://etherx.jabber.org/streams'>";
        match classify(header) {
            Frame::Header(attrs) => assert!(attrs.contains(&("id".to_string(), "abc".to_string()))),
            other => panic!("unexpected {:?}", other),
        }
        match classify(r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" from="example.com" id="w1" version="1.0"/>"#) {
            Frame::Header(attrs) => assert!(attrs.contains(&("id".to_string(), "w1".to_string()))),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(classify("</stream:stream>"), Frame::Close);
        assert_eq!(classify(r#"<close xmlns="urn:ietf:params:xml:ns:xmpp-framing"/>"#), Frame::Close);
        assert_eq!(classify("<presence/>"), Frame::Element);
        assert_eq!(classify("<stream:features/>"), Frame::Element);
    }

    #[test]
    fn test_stream_header() {
        assert_eq!(
            stream_header("jabber:client", "example.com", true),
            "<?xml version='1.0'?><stream:stream to='example.com' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>"
        );
        assert!(stream_header("jabber:component:accept", "a'b", false).contains("to='a&apos;b'"));
    }

    #[test]
    fn test_websocket_open_and_close() {
        let header = stream_header("jabber:client", "example.com", true);
        assert_eq!(
            to_websocket_framing(&header),
            r#"<open xmlns="urn:ietf:params:xml:ns:xmpp-framing" to="example.com" version="1.0"/>"#
        );
        assert_eq!(
            to_websocket_framing("</stream:stream>"),
            r#"<close xmlns="urn:ietf:params:xml:ns:xmpp-framing"/>"#
        );
    }

    #[test]
    fn test_websocket_prefixed_elements() {
        assert_eq!(
            to_websocket_framing("<stream:error><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>"),
            r#"<error xmlns="http://etherx.jabber.org/streams"><host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></error>"#
        );
        assert_eq!(
            to_websocket_framing("<stream:features/>"),
            r#"<features xmlns="http://etherx.jabber.org/streams"/>"#
        );
    }

    #[test]
    fn test_websocket_passthrough_is_borrowed() {
        let stanza = "<message to='a@b'><body>hi</body></message>";
        assert!(matches!(to_websocket_framing(stanza), Cow::Borrowed(s) if s == stanza));
    }
}
