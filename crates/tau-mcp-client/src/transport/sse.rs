//! Event-stream binding: requests are POSTed to a message endpoint and every
//! response arrives on a separate, session-scoped `GET` event stream.

use std::{collections::BTreeMap, collections::VecDeque, sync::Mutex, time::Duration};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;

use super::{
    ensure_event_stream, http_client, ConnectOutcome, HandshakeMode, InboundFrame, InboundFrames,
    McpTransport, SendReceipt, TransportKind,
};
use crate::{
    envelope::Envelope,
    error::McpClientError,
    session::session_id_from_connected_frame,
    sse::{sse_frames, SseFrame, SseFrameStream},
};

const ENDPOINT_EVENT: &str = "endpoint";
const SESSION_QUERY_PARAM: &str = "sessionId";
const DEFAULT_SSE_PATH: &str = "/sse";
const DEFAULT_MESSAGE_PATH: &str = "/message";
const DEFAULT_READY_TIMEOUT_MS: u64 = 500;
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

fn default_sse_path() -> String {
    DEFAULT_SSE_PATH.to_string()
}

fn default_message_path() -> String {
    DEFAULT_MESSAGE_PATH.to_string()
}

fn default_ready_timeout_ms() -> u64 {
    DEFAULT_READY_TIMEOUT_MS
}

fn default_http_timeout_ms() -> u64 {
    DEFAULT_HTTP_TIMEOUT_MS
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SseTransportConfig {
    pub base_url: String,
    #[serde(default = "default_sse_path")]
    pub sse_path: String,
    #[serde(default = "default_message_path")]
    pub message_path: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub health_path: Option<String>,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl SseTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            sse_path: default_sse_path(),
            message_path: default_message_path(),
            session_id: None,
            health_path: None,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            headers: BTreeMap::new(),
        }
    }

    pub(crate) fn join(&self, path: &str) -> Result<Url, McpClientError> {
        let base = Url::parse(&self.base_url).map_err(|error| {
            McpClientError::Config(format!("invalid sse base_url '{}': {error}", self.base_url))
        })?;
        base.join(path).map_err(|error| {
            McpClientError::Config(format!(
                "failed to resolve '{path}' against '{}': {error}",
                self.base_url
            ))
        })
    }
}

#[derive(Debug)]
struct Readiness {
    session_id: String,
    message_url: Url,
    replay: VecDeque<SseFrame>,
}

pub struct SseTransport {
    config: SseTransportConfig,
    http: reqwest::Client,
    message_url: Mutex<Option<Url>>,
    pending_stream: AsyncMutex<Option<InboundFrames>>,
}

impl std::fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SseTransport {
    pub fn new(config: SseTransportConfig) -> Result<Self, McpClientError> {
        let http = http_client(config.timeout_ms)?;
        Ok(Self {
            config,
            http,
            message_url: Mutex::new(None),
            pending_stream: AsyncMutex::new(None),
        })
    }

    fn message_url(&self) -> Option<Url> {
        self.message_url
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn message_url_for(&self, session_id: &str) -> Result<Url, McpClientError> {
        let mut url = self.config.join(&self.config.message_path)?;
        url.query_pairs_mut()
            .append_pair(SESSION_QUERY_PARAM, session_id);
        Ok(url)
    }

    async fn check_health(&self) -> Result<(), McpClientError> {
        let Some(health_path) = self.config.health_path.as_deref() else {
            return Ok(());
        };
        let url = self.config.join(health_path)?;
        let response = self
            .http
            .get(url.clone())
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .send()
            .await
            .map_err(|error| {
                McpClientError::transport(format!("mcp health check {url} failed: {error}"))
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpClientError::transport(format!(
                "mcp health check {url} returned status {status}"
            )));
        }
        tracing::debug!(url = %url, "mcp health check ok");
        Ok(())
    }

    /// Reads frames until the server announces the session (an `endpoint`
    /// event or a `connected` data frame), or the ready window closes.
    /// Frames that are not the announcement are kept for the listener.
    async fn await_readiness(
        &self,
        frames: &mut SseFrameStream,
        proposed_session_id: &str,
    ) -> Result<Readiness, McpClientError> {
        let mut readiness = Readiness {
            session_id: proposed_session_id.to_string(),
            message_url: self.message_url_for(proposed_session_id)?,
            replay: VecDeque::new(),
        };
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.ready_timeout_ms);
        loop {
            let next = match tokio::time::timeout_at(deadline, frames.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::debug!(
                        session_id = %readiness.session_id,
                        "event stream sent no readiness announcement; using proposed session"
                    );
                    return Ok(readiness);
                }
            };
            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(error)) => return Err(error),
                None => {
                    return Err(McpClientError::transport(
                        "event stream closed before it became ready",
                    ))
                }
            };
            if frame.event.as_deref() == Some(ENDPOINT_EVENT) {
                let announced = self.config.join(frame.data.trim())?;
                if let Some(session_id) = announced
                    .query_pairs()
                    .find(|(key, _)| key == SESSION_QUERY_PARAM)
                    .map(|(_, value)| value.into_owned())
                    .filter(|value| !value.trim().is_empty())
                {
                    readiness.session_id = session_id;
                }
                readiness.message_url = announced;
                return Ok(readiness);
            }
            if let Some(session_id) = session_id_from_connected_frame(&frame.data) {
                readiness.message_url = self.message_url_for(&session_id)?;
                readiness.session_id = session_id;
                return Ok(readiness);
            }
            readiness.replay.push_back(frame);
        }
    }
}

fn into_inbound(frame: Result<SseFrame, McpClientError>) -> Result<InboundFrame, McpClientError> {
    frame.map(|frame| InboundFrame {
        event: frame.event,
        payload: frame.data,
    })
}

#[async_trait]
impl McpTransport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn handshake_mode(&self) -> HandshakeMode {
        HandshakeMode::Correlated
    }

    async fn connect(
        &self,
        proposed_session_id: Option<&str>,
    ) -> Result<ConnectOutcome, McpClientError> {
        let proposed = self
            .config
            .session_id
            .clone()
            .or_else(|| proposed_session_id.map(str::to_string))
            .ok_or_else(|| {
                McpClientError::HandshakeFailed(
                    "event stream transport requires a session id to subscribe".to_string(),
                )
            })?;
        self.check_health().await?;

        let mut sse_url = self.config.join(&self.config.sse_path)?;
        sse_url
            .query_pairs_mut()
            .append_pair(SESSION_QUERY_PARAM, &proposed);
        let mut request = self
            .http
            .get(sse_url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        let response = request.send().await.map_err(|error| {
            McpClientError::transport(format!("event stream request {sse_url} failed: {error}"))
        })?;
        let response = ensure_event_stream(response, "sse").await?;

        let mut frames = sse_frames(response);
        let readiness = self.await_readiness(&mut frames, &proposed).await?;
        tracing::debug!(
            session_id = %readiness.session_id,
            message_url = %readiness.message_url,
            replayed = readiness.replay.len(),
            "event stream ready"
        );
        *self
            .message_url
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(readiness.message_url);
        let replay = stream::iter(readiness.replay.into_iter().map(Ok));
        *self.pending_stream.lock().await = Some(replay.chain(frames).map(into_inbound).boxed());
        Ok(ConnectOutcome {
            session_id: Some(readiness.session_id),
        })
    }

    async fn send(
        &self,
        envelope: &Envelope,
        session_id: Option<&str>,
    ) -> Result<SendReceipt, McpClientError> {
        let url = match (self.message_url(), session_id) {
            (Some(url), _) => url,
            (None, Some(session_id)) => self.message_url_for(session_id)?,
            (None, None) => {
                return Err(McpClientError::transport(
                    "event stream transport is not connected",
                ))
            }
        };
        let mut request = self
            .http
            .post(url.clone())
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .json(&envelope.to_value());
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        let response = request.send().await.map_err(|error| {
            McpClientError::transport(format!("mcp message post to {url} failed: {error}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable response body>".to_string());
            return Err(McpClientError::transport(format!(
                "mcp message post failed with status {status} body {body}"
            )));
        }
        Ok(SendReceipt {
            status: Some(status.as_u16()),
            session_id: None,
            direct_response: None,
        })
    }

    async fn inbound(&self, _session_id: Option<&str>) -> Result<InboundFrames, McpClientError> {
        self.pending_stream
            .lock()
            .await
            .take()
            .ok_or_else(|| McpClientError::transport("event stream is not open or already attached"))
    }

    async fn close(&self) -> Result<(), McpClientError> {
        self.pending_stream.lock().await.take();
        self.message_url
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        Ok(())
    }
}
