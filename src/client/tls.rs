//! TLS setup: connector, direct TLS handshake and in-band STARTTLS.

use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use super::framing::{classify, extract_stanza, stream_header, Frame};
use crate::connection::{ConnectionEvent, EventEmitter};
use crate::xml::Element;

const TLS_NS: &str = "urn:ietf:params:xml:ns:xmpp-tls";

/// Timeout for each STARTTLS read.
const STARTTLS_TIMEOUT: Duration = Duration::from_secs(10);

/// Install the ring provider once per process.
pub fn init_crypto_provider() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Accepts any certificate. Only reachable through `--dangerous-insecure-tls`.
#[derive(Debug)]
struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Client configuration shared by direct TLS, STARTTLS and `wss://`.
pub fn client_config(insecure: bool) -> Result<Arc<ClientConfig>, String> {
    init_crypto_provider();

    if insecure {
        warn!("TLS certificate verification DISABLED (--dangerous-insecure-tls)");
        let provider = rustls::crypto::ring::default_provider();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(Arc::new(provider))))
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }

    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    if native.certs.is_empty() {
        return Err("No system root certificates found. Install a CA bundle or use --dangerous-insecure-tls.".to_string());
    }
    for cert in native.certs {
        roots.add(cert).map_err(|e| format!("Failed to add cert: {}", e))?;
    }
    Ok(Arc::new(
        ClientConfig::builder().with_root_certificates(roots).with_no_client_auth(),
    ))
}

fn classify_tls_error(detail: &str) -> &'static str {
    if detail.contains("ertificate") {
        "certificate_error"
    } else if detail.contains("timed out") || detail.contains("timeout") {
        "timeout"
    } else if detail.contains("refused") || detail.contains("reset") {
        "connection_refused"
    } else {
        "other"
    }
}

/// TLS handshake over an established TCP stream, `tls_name` used for SNI.
pub async fn upgrade_to_tls(
    tcp: TcpStream,
    tls_name: &str,
    insecure: bool,
) -> Result<TlsStream<TcpStream>, String> {
    let connector = TlsConnector::from(client_config(insecure)?);
    let server_name =
        ServerName::try_from(tls_name.to_string()).map_err(|e| format!("Invalid server name: {}", e))?;

    connector.connect(server_name, tcp).await.map_err(|e| {
        let class = classify_tls_error(&e.to_string());
        error!(tls_name, error = %e, error_class = class, "TLS handshake failed");
        format!("TLS handshake failed with {} ({}): {}", tls_name, class, e)
    })
}

async fn write_frame(tcp: &mut TcpStream, frame: &str, events: &EventEmitter) -> Result<(), String> {
    tcp.write_all(frame.as_bytes())
        .await
        .map_err(|e| format!("STARTTLS: write failed: {}", e))?;
    tcp.flush().await.map_err(|e| format!("STARTTLS: flush failed: {}", e))?;
    events.emit(ConnectionEvent::Send(frame.into()));
    Ok(())
}

async fn read_frame(tcp: &mut TcpStream, buffer: &mut Vec<u8>, events: &EventEmitter) -> Result<String, String> {
    let mut chunk = [0u8; 8192];
    loop {
        if let Some((frame, used)) = extract_stanza(buffer).map_err(|e| format!("STARTTLS: {}", e))? {
            buffer.drain(..used);
            debug!(frame = %frame, "STARTTLS: received");
            events.emit(ConnectionEvent::Element(frame.as_str().into()));
            return Ok(frame);
        }
        let n = tokio::time::timeout(STARTTLS_TIMEOUT, tcp.read(&mut chunk))
            .await
            .map_err(|_| "STARTTLS: Timeout waiting for server response".to_string())?
            .map_err(|e| format!("STARTTLS: read failed: {}", e))?;
        if n == 0 {
            return Err("STARTTLS: Server closed connection during negotiation".to_string());
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Negotiate STARTTLS on a fresh client stream and hand back the TLS stream.
///
/// Every frame exchanged is emitted on `events` so the operator sees the
/// upgrade. The caller restarts the stream over TLS afterwards.
pub async fn perform_starttls(
    mut tcp: TcpStream,
    domain: &str,
    tls_name: &str,
    insecure: bool,
    events: &EventEmitter,
) -> Result<TlsStream<TcpStream>, String> {
    write_frame(&mut tcp, &stream_header("jabber:client", domain, true), events).await?;

    let mut buffer = Vec::new();
    let features = loop {
        let frame = read_frame(&mut tcp, &mut buffer, events).await?;
        match classify(&frame) {
            Frame::Header(_) => continue,
            Frame::Close => return Err(format!("STARTTLS: server ended the stream: {}", frame)),
            Frame::Element => {}
        }
        match Element::parse(&frame) {
            Ok(element) if element.local_name() == "features" => break element,
            Ok(element) if element.local_name() == "error" => {
                return Err(format!("STARTTLS: server ended the stream: {}", frame));
            }
            _ => warn!(frame = %frame, "STARTTLS: Unexpected frame before features"),
        }
    };

    if features.child("starttls").is_none() {
        return Err(format!("STARTTLS: Server does not offer STARTTLS. Features: {}", features));
    }

    write_frame(&mut tcp, &format!("<starttls xmlns='{}'/>", TLS_NS), events).await?;
    let answer = read_frame(&mut tcp, &mut buffer, events).await?;
    match Element::parse(&answer) {
        Ok(element) if element.local_name() == "proceed" => {}
        _ => return Err(format!("STARTTLS: Server rejected STARTTLS: {}", answer)),
    }
    info!(domain, tls_name, "STARTTLS: Received <proceed/>, upgrading to TLS");

    let tls = upgrade_to_tls(tcp, tls_name, insecure)
        .await
        .map_err(|e| format!("STARTTLS: {}", e))?;
    info!(domain, tls_name, "STARTTLS: TLS handshake complete");
    Ok(tls)
}
