//! Transport bindings: a common capability set over three wire shapes.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::{envelope::Envelope, error::McpClientError};

pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use sse::{SseTransport, SseTransportConfig};
pub use stdio::{StdioTransport, StdioTransportConfig};
pub use streamable_http::{StreamableHttpTransport, StreamableHttpTransportConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::StreamableHttp => "streamable-http",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where the handshake response is read from.
pub enum HandshakeMode {
    /// The inbound stream is attached first and the handshake response is
    /// correlated like any other call.
    Correlated,
    /// The handshake response is the direct body of the send; the inbound
    /// stream can only be attached once the session id it yields is known.
    Direct,
}

#[derive(Debug, Clone, PartialEq)]
/// One raw inbound unit: a stdout line, or the payload of an SSE `data:` line.
pub struct InboundFrame {
    pub event: Option<String>,
    pub payload: String,
}

impl InboundFrame {
    pub fn line(payload: impl Into<String>) -> Self {
        Self {
            event: None,
            payload: payload.into(),
        }
    }
}

pub type InboundFrames =
    Pin<Box<dyn Stream<Item = Result<InboundFrame, McpClientError>> + Send>>;

#[derive(Debug, Clone, Default, PartialEq)]
/// What the transport learned while delivering an envelope. `accepted` only
/// means the peer took the bytes, never that the request was processed.
pub struct SendReceipt {
    pub status: Option<u16>,
    pub session_id: Option<String>,
    pub direct_response: Option<Envelope>,
}

impl SendReceipt {
    pub fn written() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOutcome {
    /// Session id the transport settled on while connecting, if any.
    pub session_id: Option<String>,
}

#[async_trait]
/// Transport contract consumed by the client. Implementations only move
/// frames; correlation and session lifecycle live above them.
pub trait McpTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn handshake_mode(&self) -> HandshakeMode;

    /// Establishes the raw channel. `proposed_session_id` is forwarded to
    /// transports that must open a session-scoped stream up front.
    async fn connect(
        &self,
        proposed_session_id: Option<&str>,
    ) -> Result<ConnectOutcome, McpClientError>;

    async fn send(
        &self,
        envelope: &Envelope,
        session_id: Option<&str>,
    ) -> Result<SendReceipt, McpClientError>;

    /// Hands out the inbound frame sequence. It can be taken once per connection.
    async fn inbound(&self, session_id: Option<&str>) -> Result<InboundFrames, McpClientError>;

    async fn close(&self) -> Result<(), McpClientError>;
}

pub(crate) fn http_client(connect_timeout_ms: u64) -> Result<reqwest::Client, McpClientError> {
    // No overall timeout: it would also bound the long-lived stream bodies.
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_millis(connect_timeout_ms))
        .build()
        .map_err(|error| {
            McpClientError::transport(format!("failed to build mcp client http transport: {error}"))
        })
}

pub(crate) fn response_content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

pub(crate) async fn ensure_event_stream(
    response: reqwest::Response,
    label: &str,
) -> Result<reqwest::Response, McpClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable response body>".to_string());
        return Err(McpClientError::transport(format!(
            "{label} stream returned status {status} body {body}"
        )));
    }
    let content_type = response_content_type(&response);
    if !content_type.contains("text/event-stream") {
        return Err(McpClientError::transport(format!(
            "{label} stream expected content-type text/event-stream but got '{content_type}'"
        )));
    }
    Ok(response)
}
