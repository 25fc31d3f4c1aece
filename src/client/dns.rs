//! Service address parsing and SRV resolution.
//!
//! Turns what the operator typed (`xmpps://host`, `ws://host/ws`, a bare
//! domain...) into either a WebSocket URL or a list of TCP endpoints to try in
//! order. SRV results follow RFC 2782 ordering with a `domain:5222` fallback.

use tracing::{info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::config::{AuthType, Transport};

pub const CLIENT_PORT: u16 = 5222;
pub const DIRECT_TLS_PORT: u16 = 5223;
pub const COMPONENT_PORT: u16 = 5347;
/// ejabberd's default WebSocket listener.
pub const WEBSOCKET_PORT: u16 = 5443;

fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain TCP; client streams upgrade with STARTTLS.
    Tcp,
    /// TLS from the first byte.
    DirectTls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmppEndpoint {
    pub host: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// XMPP domain to present for SNI when `host` is an SRV target
    /// (RFC 6120 §13.7.2).
    pub domain: Option<String>,
}

impl XmppEndpoint {
    pub fn new(host: impl Into<String>, port: u16, mode: ConnectionMode) -> Self {
        Self {
            host: host.into(),
            port,
            mode,
            domain: None,
        }
    }

    /// Name used for SNI and certificate verification.
    pub fn tls_name(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedServer {
    /// RFC 7395 endpoint, used as-is.
    WebSocket(String),
    /// Explicit endpoint, no SRV.
    Direct(XmppEndpoint),
    /// Bare domain to resolve through SRV.
    Domain(String),
}

/// Split an optional `?domain=` parameter off a `host[:port]` part.
fn split_domain_param(input: &str) -> (&str, Option<String>) {
    match input.split_once('?') {
        Some((host_port, query)) => (host_port, query.strip_prefix("domain=").map(str::to_string)),
        None => (input, None),
    }
}

/// `host:port` or `host`; `rsplit_once` keeps IPv6 literals in one piece.
fn split_port(host_port: &str) -> (&str, Option<u16>) {
    let host_port = host_port.trim_end_matches('/');
    match host_port.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (host_port, None),
        },
        None => (host_port, None),
    }
}

fn default_plain_port(kind: AuthType) -> u16 {
    match kind {
        AuthType::Client => CLIENT_PORT,
        AuthType::Component => COMPONENT_PORT,
    }
}

fn explicit(rest: &str, mode: ConnectionMode, default_port: u16) -> ParsedServer {
    let (host_port, domain) = split_domain_param(rest);
    let (host, port) = split_port(host_port);
    ParsedServer::Direct(XmppEndpoint {
        host: host.to_string(),
        port: port.unwrap_or(default_port),
        mode,
        domain,
    })
}

/// Parse a service address.
///
/// - `ws://…`, `wss://…`: WebSocket URL, untouched
/// - `xmpps://host[:port]`, `tls://host[:port]`: direct TLS, default 5223
/// - `xmpp://host[:port]`, `tcp://host[:port]`: TCP, default 5222 (5347 for components)
/// - `host:port`: 5223 means direct TLS, anything else TCP
/// - `domain`: SRV resolution for clients, `domain:5347` for components
///
/// Explicit endpoints accept `?domain=name` to set the TLS name. A
/// `transport` other than `Auto` decides how a scheme-less address is used.
pub fn parse_server_input(service: &str, kind: AuthType, transport: Transport) -> ParsedServer {
    let trimmed = service.trim();

    if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        return ParsedServer::WebSocket(trimmed.to_string());
    }
    for scheme in ["xmpps://", "tls://"] {
        if let Some(rest) = trimmed.strip_prefix(scheme) {
            return explicit(rest, ConnectionMode::DirectTls, DIRECT_TLS_PORT);
        }
    }
    for scheme in ["xmpp://", "tcp://"] {
        if let Some(rest) = trimmed.strip_prefix(scheme) {
            return explicit(rest, ConnectionMode::Tcp, default_plain_port(kind));
        }
    }

    let (host_port, domain) = split_domain_param(trimmed);
    let (host, port) = split_port(host_port);
    match transport {
        Transport::WebSocket => {
            let port = port.unwrap_or(WEBSOCKET_PORT);
            return ParsedServer::WebSocket(format!("wss://{}:{}/ws", host, port));
        }
        Transport::Tls => return explicit(trimmed, ConnectionMode::DirectTls, DIRECT_TLS_PORT),
        Transport::Tcp => return explicit(trimmed, ConnectionMode::Tcp, default_plain_port(kind)),
        Transport::Auto => {}
    }

    if let Some(port) = port {
        let mode = if port == DIRECT_TLS_PORT {
            ConnectionMode::DirectTls
        } else {
            ConnectionMode::Tcp
        };
        return ParsedServer::Direct(XmppEndpoint {
            host: host.to_string(),
            port,
            mode,
            domain,
        });
    }

    match kind {
        AuthType::Client => ParsedServer::Domain(host.to_string()),
        // components have no SRV records of their own
        AuthType::Component => ParsedServer::Direct(XmppEndpoint::new(host, COMPONENT_PORT, ConnectionMode::Tcp)),
    }
}

/// Sort SRV answers by priority ascending then weight descending, dropping
/// `.` targets (service explicitly unavailable).
fn srv_endpoints<'a>(
    records: impl Iterator<Item = &'a trust_dns_resolver::proto::rr::rdata::SRV>,
    domain: &str,
    mode: ConnectionMode,
) -> Vec<XmppEndpoint> {
    let mut records: Vec<_> = records.collect();
    records.sort_by(|a, b| a.priority().cmp(&b.priority()).then(b.weight().cmp(&a.weight())));
    records
        .into_iter()
        .filter_map(|r| {
            let target = r.target().to_string().trim_end_matches('.').to_string();
            if target.is_empty() {
                info!(domain, "SRV target '.', service not available");
                return None;
            }
            info!(domain, host = %target, port = r.port(), priority = r.priority(), weight = r.weight(), ?mode, "SRV record");
            Some(XmppEndpoint {
                host: target,
                port: r.port(),
                mode,
                domain: Some(domain.to_string()),
            })
        })
        .collect()
}

/// Resolve a client domain into endpoints, in the order to try them:
/// `_xmpps-client._tcp` records, then `_xmpp-client._tcp` records, then
/// `domain:5222` only when no record exists at all.
pub async fn resolve_xmpp_server(domain: &str) -> Result<Vec<XmppEndpoint>, String> {
    let started = std::time::Instant::now();
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to load system DNS config: {}, falling back to default resolver", e);
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    let mut endpoints = Vec::new();
    for (service, mode) in [
        ("_xmpps-client._tcp", ConnectionMode::DirectTls),
        ("_xmpp-client._tcp", ConnectionMode::Tcp),
    ] {
        let name = format!("{}.{}", service, domain);
        let lookup_started = std::time::Instant::now();
        match resolver.srv_lookup(name.as_str()).await {
            Ok(lookup) => {
                let found = srv_endpoints(lookup.iter(), domain, mode);
                info!(domain, srv = %name, count = found.len(), lookup_ms = elapsed_ms(lookup_started), "SRV lookup done");
                endpoints.extend(found);
            }
            Err(e) => {
                info!(domain, srv = %name, lookup_ms = elapsed_ms(lookup_started), error = %e, "SRV lookup failed");
            }
        }
    }

    if endpoints.is_empty() {
        warn!(domain, resolve_total_ms = elapsed_ms(started), "No SRV records, falling back to {}:{}", domain, CLIENT_PORT);
        endpoints.push(XmppEndpoint::new(domain, CLIENT_PORT, ConnectionMode::Tcp));
    } else {
        info!(domain, total = endpoints.len(), resolve_total_ms = elapsed_ms(started), "SRV resolution complete");
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(input: &str) -> ParsedServer {
        parse_server_input(input, AuthType::Client, Transport::Auto)
    }

    fn direct(host: &str, port: u16, mode: ConnectionMode, domain: Option<&str>) -> ParsedServer {
        ParsedServer::Direct(XmppEndpoint {
            host: host.to_string(),
            port,
            mode,
            domain: domain.map(str::to_string),
        })
    }

    #[test]
    fn test_parse_websocket_urls() {
        assert_eq!(
            client("ws://localhost:5280/ws"),
            ParsedServer::WebSocket("ws://localhost:5280/ws".to_string())
        );
        assert_eq!(
            client("  wss://chat.example.com/xmpp-websocket "),
            ParsedServer::WebSocket("wss://chat.example.com/xmpp-websocket".to_string())
        );
    }

    #[test]
    fn test_parse_direct_tls_schemes() {
        assert_eq!(client("xmpps://chat.example.com"), direct("chat.example.com", 5223, ConnectionMode::DirectTls, None));
        assert_eq!(client("tls://chat.example.com:5270"), direct("chat.example.com", 5270, ConnectionMode::DirectTls, None));
    }

    #[test]
    fn test_parse_tcp_schemes() {
        assert_eq!(client("xmpp://localhost"), direct("localhost", 5222, ConnectionMode::Tcp, None));
        assert_eq!(client("tcp://localhost:15222/"), direct("localhost", 15222, ConnectionMode::Tcp, None));
    }

    #[test]
    fn test_parse_component_default_port() {
        assert_eq!(
            parse_server_input("xmpp://localhost", AuthType::Component, Transport::Auto),
            direct("localhost", 5347, ConnectionMode::Tcp, None)
        );
        assert_eq!(
            parse_server_input("example.com", AuthType::Component, Transport::Auto),
            direct("example.com", 5347, ConnectionMode::Tcp, None)
        );
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(client("chat.example.com:5223"), direct("chat.example.com", 5223, ConnectionMode::DirectTls, None));
        assert_eq!(client("chat.example.com:5280"), direct("chat.example.com", 5280, ConnectionMode::Tcp, None));
        assert_eq!(client("[::1]:5222"), direct("[::1]", 5222, ConnectionMode::Tcp, None));
    }

    #[test]
    fn test_parse_bare_domain() {
        assert_eq!(client(" process-one.net "), ParsedServer::Domain("process-one.net".to_string()));
    }

    #[test]
    fn test_parse_domain_param() {
        assert_eq!(
            client("tls://v6.mdosch.de?domain=diebesban.de"),
            direct("v6.mdosch.de", 5223, ConnectionMode::DirectTls, Some("diebesban.de"))
        );
        assert_eq!(
            client("tcp://v4.mdosch.de:5222?domain=diebesban.de"),
            direct("v4.mdosch.de", 5222, ConnectionMode::Tcp, Some("diebesban.de"))
        );
        let (host_port, domain) = split_domain_param("host:5223?other=value");
        assert_eq!(host_port, "host:5223");
        assert_eq!(domain, None);
    }

    #[test]
    fn test_transport_override() {
        assert_eq!(
            parse_server_input("example.com", AuthType::Client, Transport::Tls),
            direct("example.com", 5223, ConnectionMode::DirectTls, None)
        );
        assert_eq!(
            parse_server_input("example.com", AuthType::Client, Transport::Tcp),
            direct("example.com", 5222, ConnectionMode::Tcp, None)
        );
        assert_eq!(
            parse_server_input("example.com", AuthType::Client, Transport::WebSocket),
            ParsedServer::WebSocket("wss://example.com:5443/ws".to_string())
        );
        // an explicit scheme wins over the override
        assert_eq!(
            parse_server_input("xmpps://example.com", AuthType::Client, Transport::Tcp),
            direct("example.com", 5223, ConnectionMode::DirectTls, None)
        );
    }

    #[test]
    fn test_endpoint_tls_name() {
        let mut ep = XmppEndpoint::new("v6.mdosch.de", 5223, ConnectionMode::DirectTls);
        assert_eq!(ep.tls_name(), "v6.mdosch.de");
        ep.domain = Some("diebesban.de".to_string());
        assert_eq!(ep.tls_name(), "diebesban.de");
    }

    #[tokio::test]
    async fn test_resolve_nonexistent_domain_returns_fallback() {
        let endpoints = resolve_xmpp_server("this-domain-definitely-does-not-exist-xmpp-test.example")
            .await
            .unwrap();
        assert_eq!(
            endpoints,
            vec![XmppEndpoint::new(
                "this-domain-definitely-does-not-exist-xmpp-test.example",
                5222,
                ConnectionMode::Tcp
            )]
        );
    }
}
