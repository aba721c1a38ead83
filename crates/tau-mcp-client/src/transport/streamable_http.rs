//! Hybrid binding: one endpoint accepts POSTed envelopes and serves the
//! session-scoped response stream on `GET`.
//!
//! Only the handshake reads its response from the POST body; the session id
//! it yields scopes every later request and the event stream.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Url;
use serde::Deserialize;

use super::{
    ensure_event_stream, http_client, response_content_type, ConnectOutcome, HandshakeMode,
    InboundFrame, InboundFrames, McpTransport, SendReceipt, TransportKind,
};
use crate::{
    envelope::Envelope,
    error::McpClientError,
    sse::{sse_frames, SseLineDecoder},
};

pub const DEFAULT_SESSION_HEADER: &str = "Mcp-Session-Id";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

fn default_session_header() -> String {
    DEFAULT_SESSION_HEADER.to_string()
}

fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StreamableHttpTransportConfig {
    pub endpoint: String,
    #[serde(default = "default_session_header")]
    pub session_header: String,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl StreamableHttpTransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            session_header: default_session_header(),
            timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct StreamableHttpTransport {
    config: StreamableHttpTransportConfig,
    endpoint: Url,
    http: reqwest::Client,
}

impl StreamableHttpTransport {
    pub fn new(config: StreamableHttpTransportConfig) -> Result<Self, McpClientError> {
        let endpoint = Url::parse(&config.endpoint).map_err(|error| {
            McpClientError::Config(format!(
                "invalid streamable-http endpoint '{}': {error}",
                config.endpoint
            ))
        })?;
        let http = http_client(config.timeout_ms)?;
        Ok(Self {
            config,
            endpoint,
            http,
        })
    }

    fn with_headers(
        &self,
        mut request: reqwest::RequestBuilder,
        session_id: Option<&str>,
    ) -> reqwest::RequestBuilder {
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if let Some(session_id) = session_id {
            request = request.header(self.config.session_header.as_str(), session_id);
        }
        request
    }
}

/// Extracts the first decodable envelope from a direct POST response body,
/// which is either a JSON document or a short event stream.
fn decode_direct_body(body: &str, content_type: &str) -> Option<Envelope> {
    if body.trim().is_empty() {
        return None;
    }
    if content_type.contains("text/event-stream") {
        let mut decoder = SseLineDecoder::new();
        let mut frames = decoder.push(body.as_bytes());
        frames.extend(decoder.finish());
        return frames
            .into_iter()
            .find_map(|frame| Envelope::decode(&frame.data).ok());
    }
    match Envelope::decode(body) {
        Ok(envelope) => Some(envelope),
        Err(error) => {
            tracing::debug!(%error, "ignoring undecodable direct response body");
            None
        }
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    fn handshake_mode(&self) -> HandshakeMode {
        HandshakeMode::Direct
    }

    async fn connect(
        &self,
        _proposed_session_id: Option<&str>,
    ) -> Result<ConnectOutcome, McpClientError> {
        // Nothing to open ahead of the handshake POST.
        Ok(ConnectOutcome::default())
    }

    async fn send(
        &self,
        envelope: &Envelope,
        session_id: Option<&str>,
    ) -> Result<SendReceipt, McpClientError> {
        let request = self
            .http
            .post(self.endpoint.clone())
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(&envelope.to_value());
        let response = self
            .with_headers(request, session_id)
            .send()
            .await
            .map_err(|error| {
                McpClientError::transport(format!(
                    "mcp post to {} failed: {error}",
                    self.endpoint
                ))
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable response body>".to_string());
            return Err(McpClientError::transport(format!(
                "mcp post failed with status {status} body {body}"
            )));
        }
        let session_id = response
            .headers()
            .get(self.config.session_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);
        let content_type = response_content_type(&response);
        let body = response.text().await.map_err(|error| {
            McpClientError::transport(format!("failed to read mcp post response body: {error}"))
        })?;
        Ok(SendReceipt {
            status: Some(status.as_u16()),
            session_id,
            direct_response: decode_direct_body(&body, &content_type),
        })
    }

    async fn inbound(&self, session_id: Option<&str>) -> Result<InboundFrames, McpClientError> {
        let session_id = session_id.ok_or_else(|| {
            McpClientError::HandshakeFailed(
                "streamable-http event stream requires a session id".to_string(),
            )
        })?;
        let request = self
            .http
            .get(self.endpoint.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        let response = self
            .with_headers(request, Some(session_id))
            .send()
            .await
            .map_err(|error| {
                McpClientError::transport(format!(
                    "event stream request {} failed: {error}",
                    self.endpoint
                ))
            })?;
        let response = ensure_event_stream(response, "streamable-http").await?;
        tracing::debug!(endpoint = %self.endpoint, session_id, "streamable-http event stream open");
        Ok(sse_frames(response)
            .map(|frame| {
                frame.map(|frame| InboundFrame {
                    event: frame.event,
                    payload: frame.data,
                })
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), McpClientError> {
        // The event stream is owned by the listener and ends when it is dropped.
        Ok(())
    }
}
