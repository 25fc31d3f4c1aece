//! Stream negotiation as a state machine, free of I/O.
//!
//! The reader task feeds every inbound frame to [`Negotiator::inbound`] and
//! every credential attempt to [`Negotiator::attempt`], then carries out the
//! returned [`Step`]s in order.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::framing::{classify, stream_header, Frame};
use crate::config::AuthType;
use crate::connection::{AuthAttempt, ConnectionEvent};
use crate::error::{ConsoleError, Result};
use crate::jid::Jid;
use crate::xml::{Element, Stanza};

pub const CLIENT_NS: &str = "jabber:client";
pub const COMPONENT_NS: &str = "jabber:component:accept";
const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const BIND_ID: &str = "bind_1";

/// Mechanisms this console can run, in order of preference.
const SUPPORTED_MECHANISMS: [&str; 2] = ["PLAIN", "ANONYMOUS"];

#[derive(Debug)]
pub enum Step {
    /// Write a TCP-framed frame (stream header or element).
    Write(Stanza),
    Emit(ConnectionEvent),
    /// Offer authentication with these mechanisms (empty for components).
    Offer(Vec<String>),
    /// The stream is over.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Authenticating,
    Binding,
    Online,
}

pub struct Negotiator {
    kind: AuthType,
    domain: String,
    stream_id: Option<String>,
    phase: Phase,
    mechanisms: Vec<String>,
    pending: Option<oneshot::Sender<Result<()>>>,
}

impl Negotiator {
    pub fn new(kind: AuthType, domain: impl Into<String>) -> Self {
        Self {
            kind,
            domain: domain.into(),
            stream_id: None,
            phase: Phase::Authenticating,
            mechanisms: Vec::new(),
            pending: None,
        }
    }

    pub fn set_domain(&mut self, domain: &str) {
        self.domain = domain.to_string();
    }

    pub fn header(&self) -> Stanza {
        let namespace = match self.kind {
            AuthType::Client => CLIENT_NS,
            AuthType::Component => COMPONENT_NS,
        };
        Stanza::Raw(stream_header(namespace, &self.domain, self.kind == AuthType::Client))
    }

    fn resolve(&mut self, outcome: Result<()>) {
        if let Some(pending) = self.pending.take() {
            let _ = pending.send(outcome);
        }
    }

    /// Interpret one inbound frame.
    pub fn inbound(&mut self, raw: &str) -> Vec<Step> {
        match classify(raw) {
            Frame::Header(attributes) => self.on_header(attributes),
            Frame::Close => {
                self.resolve(Err(ConsoleError::Transport("stream closed".to_string())));
                vec![Step::Close]
            }
            Frame::Element => match Element::parse(raw) {
                Ok(element) => self.on_element(element),
                Err(e) => {
                    warn!(error = %e, "Unparseable inbound frame");
                    Vec::new()
                }
            },
        }
    }

    fn on_header(&mut self, attributes: Vec<(String, String)>) -> Vec<Step> {
        self.stream_id = attributes
            .into_iter()
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value);
        debug!(stream_id = ?self.stream_id, "Stream opened by peer");

        let mut steps = vec![Step::Emit(ConnectionEvent::Open)];
        if self.kind == AuthType::Component && self.phase == Phase::Authenticating {
            steps.push(Step::Offer(Vec::new()));
        }
        steps
    }

    fn on_element(&mut self, element: Element) -> Vec<Step> {
        match element.local_name() {
            "features" => self.on_features(&element),
            "success" if self.phase == Phase::Authenticating => {
                info!(domain = %self.domain, "SASL success, restarting stream");
                self.resolve(Ok(()));
                self.phase = Phase::Binding;
                vec![Step::Write(self.header())]
            }
            "failure" if self.phase == Phase::Authenticating => {
                let condition = element
                    .elements()
                    .map(|c| c.local_name().to_string())
                    .find(|name| name != "text")
                    .unwrap_or_else(|| "failure".to_string());
                warn!(condition = %condition, "SASL failure");
                self.resolve(Err(ConsoleError::Authentication(condition)));
                vec![Step::Offer(self.mechanisms.clone())]
            }
            "handshake" if self.kind == AuthType::Component => {
                info!(domain = %self.domain, "Component handshake accepted");
                self.resolve(Ok(()));
                self.phase = Phase::Online;
                vec![Step::Emit(ConnectionEvent::Online(Jid::domain(self.domain.clone())))]
            }
            "iq" if element.attribute("id") == Some(BIND_ID) => self.on_bind_result(&element),
            "error" => self.on_stream_error(&element),
            _ => Vec::new(),
        }
    }

    fn on_features(&mut self, features: &Element) -> Vec<Step> {
        match self.phase {
            Phase::Authenticating => {
                let Some(mechanisms) = features.child("mechanisms") else {
                    return vec![Step::Emit(ConnectionEvent::Error(
                        "server offers no SASL authentication".to_string(),
                    ))];
                };
                let offered: Vec<String> = mechanisms
                    .elements()
                    .filter(|m| m.local_name() == "mechanism")
                    .map(Element::text)
                    .collect();
                self.mechanisms = SUPPORTED_MECHANISMS
                    .iter()
                    .filter(|m| offered.iter().any(|o| o == *m))
                    .map(|m| m.to_string())
                    .collect();
                if self.mechanisms.is_empty() {
                    return vec![Step::Emit(ConnectionEvent::Error(format!(
                        "no supported SASL mechanism offered ({})",
                        offered.join(", ")
                    )))];
                }
                vec![Step::Offer(self.mechanisms.clone())]
            }
            Phase::Binding if features.child("bind").is_some() => {
                let bind = Element::new("iq")
                    .with_attribute("type", "set")
                    .with_attribute("id", BIND_ID)
                    .with_child(Element::new("bind").with_attribute("xmlns", BIND_NS));
                vec![Step::Write(bind.into())]
            }
            Phase::Binding => vec![Step::Emit(ConnectionEvent::Error(
                "server offers no resource binding".to_string(),
            ))],
            Phase::Online => Vec::new(),
        }
    }

    fn on_bind_result(&mut self, iq: &Element) -> Vec<Step> {
        if iq.attribute("type") == Some("error") {
            let condition = iq
                .child("error")
                .and_then(|e| e.elements().next())
                .map(|c| c.local_name().to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            return vec![Step::Emit(ConnectionEvent::Error(format!("resource binding failed: {}", condition)))];
        }

        let jid_text = iq
            .child("bind")
            .and_then(|bind| bind.child("jid"))
            .map(Element::text)
            .unwrap_or_default();
        match jid_text.trim().parse::<Jid>() {
            Ok(jid) => {
                info!(jid = %jid, "Resource bound");
                self.phase = Phase::Online;
                vec![Step::Emit(ConnectionEvent::Online(jid))]
            }
            Err(e) => vec![Step::Emit(ConnectionEvent::Error(format!("resource binding failed: {}", e)))],
        }
    }

    fn on_stream_error(&mut self, error: &Element) -> Vec<Step> {
        let condition = error
            .elements()
            .map(|c| c.local_name().to_string())
            .find(|name| name != "text")
            .unwrap_or_else(|| "undefined-condition".to_string());
        let text = error.child("text").map(Element::text).unwrap_or_default();
        warn!(condition = %condition, text = %text, "Stream error");

        if self.phase == Phase::Authenticating && self.pending.is_some() {
            self.resolve(Err(ConsoleError::Authentication(condition.clone())));
        }
        let message = if text.is_empty() {
            format!("stream error: {}", condition)
        } else {
            format!("stream error: {} ({})", condition, text)
        };
        vec![Step::Emit(ConnectionEvent::Error(message))]
    }

    /// Turn the operator's credentials into the authentication frame.
    pub fn attempt(&mut self, attempt: AuthAttempt) -> Vec<Step> {
        let AuthAttempt {
            mechanism,
            credentials,
            outcome,
        } = attempt;
        self.resolve(Err(ConsoleError::Protocol("superseded by a new attempt".to_string())));

        match self.kind {
            AuthType::Component => {
                let Some(id) = self.stream_id.clone() else {
                    let _ = outcome.send(Err(ConsoleError::Protocol("no stream id to hash".to_string())));
                    return Vec::new();
                };
                let secret = credentials.password.unwrap_or_default();
                self.pending = Some(outcome);
                vec![Step::Write(
                    Element::new("handshake").with_text(handshake_digest(&id, &secret)).into(),
                )]
            }
            AuthType::Client => {
                let mechanism = mechanism
                    .or_else(|| self.mechanisms.first().cloned())
                    .unwrap_or_default();
                let auth = Element::new("auth")
                    .with_attribute("xmlns", SASL_NS)
                    .with_attribute("mechanism", mechanism.as_str());
                let auth = match mechanism.as_str() {
                    "PLAIN" => auth.with_text(plain_payload(
                        credentials.username.as_deref().unwrap_or_default(),
                        credentials.password.as_deref().unwrap_or_default(),
                    )),
                    "ANONYMOUS" => auth,
                    other => {
                        let _ = outcome.send(Err(ConsoleError::Authentication(format!(
                            "unsupported mechanism {}",
                            other
                        ))));
                        return vec![Step::Offer(self.mechanisms.clone())];
                    }
                };
                self.pending = Some(outcome);
                vec![Step::Write(auth.into())]
            }
        }
    }
}

/// XEP-0114: lowercase hex SHA-1 of stream id followed by the secret.
pub fn handshake_digest(stream_id: &str, secret: &str) -> String {
    let digest = Sha1::digest(format!("{}{}", stream_id, secret).as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// RFC 4616 message with an empty authorization identity.
pub fn plain_payload(username: &str, password: &str) -> String {
    BASE64.encode(format!("\0{}\0{}", username, password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::login::Credentials;

    fn written(steps: &[Step]) -> Vec<String> {
        steps
            .iter()
            .filter_map(|s| match s {
                Step::Write(stanza) => Some(stanza.to_string()),
                _ => None,
            })
            .collect()
    }

    fn attempt(
        mechanism: Option<&str>,
        username: Option<&str>,
        password: &str,
    ) -> (AuthAttempt, oneshot::Receiver<Result<()>>) {
        let (outcome, verdict) = oneshot::channel();
        (
            AuthAttempt {
                mechanism: mechanism.map(str::to_string),
                credentials: Credentials {
                    username: username.map(str::to_string),
                    password: Some(password.to_string()),
                },
                outcome,
            },
            verdict,
        )
    }

    const FEATURES: &str = "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-1</mechanism><mechanism>ANONYMOUS</mechanism><mechanism>PLAIN</mechanism></mechanisms></stream:features>";

    #[test]
    fn test_digests() {
        assert_eq!(handshake_digest("abc", "secret"), "de0a408ef519cd62e7379039634152874895c50c");
        assert_eq!(plain_payload("alice", "secret"), "AGFsaWNlAHNlY3JldA==");
    }

    #[test]
    fn test_client_header() {
        let negotiator = Negotiator::new(AuthType::Client, "example.com");
        let header = negotiator.header().to_string();
        assert!(header.contains("xmlns='jabber:client'"));
        assert!(header.contains("version='1.0'"));
    }

    #[tokio::test]
    async fn test_client_negotiation() {
        let mut negotiator = Negotiator::new(AuthType::Client, "example.com");

        let steps = negotiator.inbound("<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='s1' version='1.0'>");
        assert!(matches!(steps.as_slice(), [Step::Emit(ConnectionEvent::Open)]));

        let steps = negotiator.inbound(FEATURES);
        match steps.as_slice() {
            [Step::Offer(mechanisms)] => assert_eq!(mechanisms, &["PLAIN", "ANONYMOUS"]),
            other => panic!("unexpected {:?}", other),
        }

        let (auth, verdict) = attempt(Some("PLAIN"), Some("alice"), "secret");
        let steps = negotiator.attempt(auth);
        assert_eq!(
            written(&steps),
            vec![r#"<auth xmlns="urn:ietf:params:xml:ns:xmpp-sasl" mechanism="PLAIN">AGFsaWNlAHNlY3JldA==</auth>"#]
        );

        let steps = negotiator.inbound("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>");
        assert!(verdict.await.unwrap().is_ok());
        assert_eq!(written(&steps), vec![negotiator.header().to_string()]);

        negotiator.inbound("<stream:stream xmlns:stream='http://etherx.jabber.org/streams' id='s2'>");
        let steps = negotiator.inbound("<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>");
        assert_eq!(
            written(&steps),
            vec![r#"<iq type="set" id="bind_1"><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"/></iq>"#]
        );

        let steps = negotiator.inbound("<iq type='result' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>alice@example.com/console</jid></bind></iq>");
        match steps.as_slice() {
            [Step::Emit(ConnectionEvent::Online(jid))] => assert_eq!(jid.to_string(), "alice@example.com/console"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_failure_reoffers() {
        let mut negotiator = Negotiator::new(AuthType::Client, "example.com");
        negotiator.inbound(FEATURES);
        let (auth, verdict) = attempt(Some("PLAIN"), Some("alice"), "wrong");
        negotiator.attempt(auth);

        let steps = negotiator.inbound("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/><text>bad</text></failure>");
        match verdict.await.unwrap() {
            Err(ConsoleError::Authentication(condition)) => assert_eq!(condition, "not-authorized"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(steps.as_slice(), [Step::Offer(m)] if m.len() == 2));
    }

    #[test]
    fn test_anonymous_has_no_payload() {
        let mut negotiator = Negotiator::new(AuthType::Client, "example.com");
        negotiator.inbound(FEATURES);
        let (auth, _verdict) = attempt(Some("ANONYMOUS"), None, "");
        assert_eq!(
            written(&negotiator.attempt(auth)),
            vec![r#"<auth xmlns="urn:ietf:params:xml:ns:xmpp-sasl" mechanism="ANONYMOUS"/>"#]
        );
    }

    #[test]
    fn test_no_supported_mechanism() {
        let mut negotiator = Negotiator::new(AuthType::Client, "example.com");
        let steps = negotiator.inbound("<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-256</mechanism></mechanisms></stream:features>");
        match steps.as_slice() {
            [Step::Emit(ConnectionEvent::Error(message))] => assert!(message.contains("SCRAM-SHA-256")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_component_handshake() {
        let mut negotiator = Negotiator::new(AuthType::Component, "muc.example.com");
        assert!(negotiator.header().to_string().contains("jabber:component:accept"));

        let steps = negotiator.inbound("<stream:stream xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:component:accept' from='muc.example.com' id='abc'>");
        assert!(matches!(
            steps.as_slice(),
            [Step::Emit(ConnectionEvent::Open), Step::Offer(m)] if m.is_empty()
        ));

        let (auth, verdict) = attempt(None, None, "secret");
        assert_eq!(
            written(&negotiator.attempt(auth)),
            vec!["<handshake>de0a408ef519cd62e7379039634152874895c50c</handshake>"]
        );

        let steps = negotiator.inbound("<handshake/>");
        assert!(verdict.await.unwrap().is_ok());
        match steps.as_slice() {
            [Step::Emit(ConnectionEvent::Online(jid))] => assert_eq!(jid.to_string(), "muc.example.com"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_component_rejected_by_stream_error() {
        let mut negotiator = Negotiator::new(AuthType::Component, "muc.example.com");
        negotiator.inbound("<stream:stream xmlns:stream='http://etherx.jabber.org/streams' id='abc'>");
        let (auth, verdict) = attempt(None, None, "wrong");
        negotiator.attempt(auth);

        let steps = negotiator.inbound("<stream:error><not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>");
        assert!(matches!(verdict.await.unwrap(), Err(ConsoleError::Authentication(_))));
        match steps.as_slice() {
            [Step::Emit(ConnectionEvent::Error(message))] => assert_eq!(message, "stream error: not-authorized"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(negotiator.inbound("</stream:stream>").as_slice(), [Step::Close]));
    }
}
