//! Byte-stream and WebSocket links, split into a frame reader and writer.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{error, info};

use super::dns::{ConnectionMode, XmppEndpoint};
use super::framing::{extract_stanza, to_websocket_framing};
use super::tls::{client_config, upgrade_to_tls};

/// Applied to every outbound TCP connect.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A peer that never completes a stanza must not grow the buffer forever.
pub const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An established transport, before the stream is opened.
pub enum Link {
    /// Plain TCP; a client stream still has to go through STARTTLS.
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    WebSocket(Box<WsStream>),
}

impl Link {
    pub fn describe(&self) -> &'static str {
        match self {
            Link::Tcp(_) => "tcp",
            Link::Tls(_) => "tls",
            Link::WebSocket(_) => "websocket",
        }
    }

    pub fn split(self) -> (LinkReader, LinkWriter) {
        match self {
            Link::Tcp(stream) => {
                let (read, write) = tokio::io::split(stream);
                (LinkReader::bytes(Box::new(read)), LinkWriter::Bytes(Box::new(write)))
            }
            Link::Tls(stream) => {
                let (read, write) = tokio::io::split(*stream);
                (LinkReader::bytes(Box::new(read)), LinkWriter::Bytes(Box::new(write)))
            }
            Link::WebSocket(ws) => {
                let (sink, stream) = (*ws).split();
                (LinkReader::WebSocket(stream), LinkWriter::WebSocket(sink))
            }
        }
    }
}

async fn tcp_connect(endpoint: &XmppEndpoint) -> Result<TcpStream, String> {
    let address = format!("{}:{}", endpoint.host, endpoint.port);
    tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| {
            error!(host = %endpoint.host, port = endpoint.port, timeout_secs = TCP_CONNECT_TIMEOUT.as_secs(), "TCP connect timed out");
            format!(
                "TCP connect timed out after {}s to {}:{}",
                TCP_CONNECT_TIMEOUT.as_secs(),
                endpoint.host,
                endpoint.port
            )
        })?
        .map_err(|e| {
            error!(host = %endpoint.host, port = endpoint.port, error = %e, error_kind = ?e.kind(), "TCP connect failed");
            format!("Failed to connect to {}:{}: {}", endpoint.host, endpoint.port, e)
        })
}

/// Connect to one endpoint; direct TLS endpoints complete their handshake here.
pub async fn connect_endpoint(endpoint: &XmppEndpoint, insecure: bool) -> Result<Link, String> {
    let tcp = tcp_connect(endpoint).await?;
    match endpoint.mode {
        ConnectionMode::Tcp => {
            info!(host = %endpoint.host, port = endpoint.port, "Connected (TCP)");
            Ok(Link::Tcp(tcp))
        }
        ConnectionMode::DirectTls => {
            let tls = upgrade_to_tls(tcp, endpoint.tls_name(), insecure).await?;
            info!(host = %endpoint.host, port = endpoint.port, tls_name = endpoint.tls_name(), "Connected (direct TLS)");
            Ok(Link::Tls(Box::new(tls)))
        }
    }
}

/// Open an RFC 7395 WebSocket with the `xmpp` subprotocol.
pub async fn connect_websocket(url: &str, insecure: bool) -> Result<Link, String> {
    let mut request = url
        .into_client_request()
        .map_err(|e| format!("Invalid WebSocket URL {}: {}", url, e))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("xmpp"));

    let connector = if url.starts_with("wss://") {
        Some(Connector::Rustls(client_config(insecure)?))
    } else {
        None
    };

    let (ws, response) = tokio::time::timeout(
        TCP_CONNECT_TIMEOUT,
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector),
    )
    .await
    .map_err(|_| format!("WebSocket connect timed out after {}s to {}", TCP_CONNECT_TIMEOUT.as_secs(), url))?
    .map_err(|e| format!("WebSocket connect to {} failed: {}", url, e))?;

    info!(url, status = %response.status(), "Connected (WebSocket)");
    Ok(Link::WebSocket(Box::new(ws)))
}

pub enum LinkReader {
    Bytes {
        io: Box<dyn AsyncRead + Unpin + Send>,
        buffer: Vec<u8>,
    },
    WebSocket(SplitStream<WsStream>),
}

impl LinkReader {
    fn bytes(io: Box<dyn AsyncRead + Unpin + Send>) -> Self {
        LinkReader::Bytes {
            io,
            buffer: Vec::with_capacity(8192),
        }
    }

    /// Next inbound frame, `None` once the peer has gone away.
    ///
    /// Cancel-safe: bytes already read stay in the buffer.
    pub async fn next_frame(&mut self) -> Result<Option<String>, String> {
        match self {
            LinkReader::Bytes { io, buffer } => {
                let mut chunk = [0u8; 8192];
                loop {
                    if let Some((frame, used)) = extract_stanza(buffer)? {
                        buffer.drain(..used);
                        return Ok(Some(frame));
                    }
                    if buffer.iter().all(u8::is_ascii_whitespace) {
                        buffer.clear();
                    }
                    if buffer.len() > MAX_STANZA_BUFFER_SIZE {
                        return Err(format!(
                            "Stanza buffer exceeded {} bytes without a complete stanza",
                            MAX_STANZA_BUFFER_SIZE
                        ));
                    }
                    let n = io.read(&mut chunk).await.map_err(|e| format!("Read failed: {}", e))?;
                    if n == 0 {
                        return Ok(None);
                    }
                    buffer.extend_from_slice(&chunk[..n]);
                }
            }
            LinkReader::WebSocket(stream) => loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(format!("WebSocket read failed: {}", e)),
                }
            },
        }
    }
}

pub enum LinkWriter {
    Bytes(Box<dyn AsyncWrite + Unpin + Send>),
    WebSocket(SplitSink<WsStream, Message>),
}

impl LinkWriter {
    /// Write one TCP-framed frame and return the text that went on the wire.
    pub async fn write_frame(&mut self, frame: &str) -> Result<String, String> {
        match self {
            LinkWriter::Bytes(io) => {
                io.write_all(frame.as_bytes())
                    .await
                    .map_err(|e| format!("Write failed: {}", e))?;
                io.flush().await.map_err(|e| format!("Flush failed: {}", e))?;
                Ok(frame.to_string())
            }
            LinkWriter::WebSocket(sink) => {
                let wire = to_websocket_framing(frame).into_owned();
                sink.send(Message::Text(wire.clone()))
                    .await
                    .map_err(|e| format!("WebSocket write failed: {}", e))?;
                Ok(wire)
            }
        }
    }

    pub async fn shutdown(&mut self) {
        let _ = match self {
            LinkWriter::Bytes(io) => io.shutdown().await.map_err(|e| e.to_string()),
            LinkWriter::WebSocket(sink) => sink.close().await.map_err(|e| e.to_string()),
        };
    }
}
