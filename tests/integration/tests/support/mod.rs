#![allow(dead_code)]

//! In-process MCP server speaking both HTTP flavours: the SSE pair
//! (`/sse` + `/message`) and the single streamable endpoint (`/mcp`).

use std::{
    cmp::Reverse,
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
/// Requests with this method are accepted but their POST never completes.
pub const STALLED_POST_METHOD: &str = "test/stall-post";

pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How the `/sse` stream tells the client where to post.
pub enum SseAnnouncement {
    /// `event: endpoint` carrying a server-chosen session id.
    Endpoint,
    /// `{"type":"connected","sessionId":..}` echoing the proposed id.
    Connected,
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where the `/mcp` handshake response carries the session id.
pub enum HybridSessionSource {
    Header,
    Body,
    Missing,
}

#[derive(Debug, Clone, Copy)]
pub struct MockBehavior {
    pub sse_announcement: SseAnnouncement,
    pub hybrid_session: HybridSessionSource,
    pub reject_initialize: bool,
    /// The `initialize` POST hangs instead of answering.
    pub stall_initialize: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            sse_announcement: SseAnnouncement::Endpoint,
            hybrid_session: HybridSessionSource::Header,
            reject_initialize: false,
            stall_initialize: false,
        }
    }
}

pub struct MockMcpState {
    behavior: MockBehavior,
    streams: Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>,
    held: Mutex<Vec<Value>>,
    next_session: AtomicU64,
    posts: AtomicU64,
}

impl MockMcpState {
    async fn stall_if_requested(&self, request: &Value) {
        let method = request["method"].as_str().unwrap_or_default();
        if method == STALLED_POST_METHOD || (self.behavior.stall_initialize && method == "initialize")
        {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
    }

    fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            streams: Mutex::new(HashMap::new()),
            held: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(1),
            posts: AtomicU64::new(0),
        }
    }

    pub fn post_count(&self) -> u64 {
        self.posts.load(Ordering::SeqCst)
    }

    pub fn open_streams(&self) -> usize {
        self.streams.lock().expect("streams lock").len()
    }

    fn next_session_id(&self, prefix: &str) -> String {
        format!(
            "{prefix}-{}",
            self.next_session.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn stream_for(&self, session_id: &str) -> Option<mpsc::UnboundedSender<Event>> {
        self.streams
            .lock()
            .expect("streams lock")
            .get(session_id)
            .cloned()
    }

    fn open_stream(&self, session_id: &str) -> UnboundedReceiverStream<Event> {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        self.streams
            .lock()
            .expect("streams lock")
            .insert(session_id.to_string(), tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Answers `request` on the session stream. `test/hold` requests are
    /// parked until two are held, then answered highest id first.
    fn dispatch(&self, session_id: &str, request: Value) {
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if method == "test/drop-stream" {
            self.streams.lock().expect("streams lock").remove(session_id);
            return;
        }
        let Some(stream) = self.stream_for(session_id) else {
            return;
        };
        if method == "test/hold" {
            let ready = {
                let mut held = self.held.lock().expect("held lock");
                held.push(request);
                if held.len() < 2 {
                    return;
                }
                std::mem::take(&mut *held)
            };
            let mut ready = ready;
            ready.sort_by_key(|request| Reverse(request["id"].as_i64().unwrap_or_default()));
            for request in ready {
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": {"held": request["id"]}
                });
                let _ = stream.send(Event::default().event("message").data(response.to_string()));
            }
            return;
        }
        if let Some(response) = response_for(&request) {
            let _ = stream.send(Event::default().event("message").data(response.to_string()));
        }
    }
}

fn initialize_result(session_id: Option<&str>) -> Value {
    let mut result = json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {"tools": {}},
        "serverInfo": {"name": "mock-http", "version": "1.0.0"}
    });
    if let Some(session_id) = session_id {
        result["sessionId"] = json!(session_id);
    }
    result
}

fn response_for(request: &Value) -> Option<Value> {
    let id = request.get("id")?.clone();
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let result = match method {
        "initialize" => initialize_result(None),
        "tools/list" => json!({
            "tools": [{
                "name": "echo",
                "description": "echo tool",
                "inputSchema": {"type": "object", "properties": {"message": {"type": "string"}}}
            }]
        }),
        "tools/call" => {
            let message = request["params"]["arguments"]["message"]
                .as_str()
                .unwrap_or_default();
            json!({"content": [{"type": "text", "text": format!("Echo: {message}")}]})
        }
        "test/never" => return None,
        _ => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "Method not found"}
            }))
        }
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

fn sse_response(frames: UnboundedReceiverStream<Event>) -> Response {
    let stream = frames.map(Ok::<Event, Infallible>);
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_sse_stream(
    State(state): State<Arc<MockMcpState>>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(proposed) = query.session_id.filter(|id| !id.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "sessionId is required").into_response();
    };
    let session_id = match state.behavior.sse_announcement {
        SseAnnouncement::Endpoint => state.next_session_id("mock-sse"),
        SseAnnouncement::Connected | SseAnnouncement::Silent => proposed,
    };
    let frames = state.open_stream(&session_id);
    if let Some(stream) = state.stream_for(&session_id) {
        let _ = stream.send(Event::default().comment("mock keep-alive"));
        let _ = stream.send(Event::default().data("mock server log line"));
        match state.behavior.sse_announcement {
            SseAnnouncement::Endpoint => {
                let _ = stream.send(
                    Event::default()
                        .event("endpoint")
                        .data(format!("/message?sessionId={session_id}")),
                );
            }
            SseAnnouncement::Connected => {
                let _ = stream.send(
                    Event::default()
                        .data(json!({"type": "connected", "sessionId": session_id}).to_string()),
                );
            }
            SseAnnouncement::Silent => {}
        }
        let _ = stream.send(
            Event::default().event("message").data(
                json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}})
                    .to_string(),
            ),
        );
    }
    sse_response(frames)
}

async fn handle_sse_message(
    State(state): State<Arc<MockMcpState>>,
    Query(query): Query<SessionQuery>,
    Json(request): Json<Value>,
) -> Response {
    state.posts.fetch_add(1, Ordering::SeqCst);
    state.stall_if_requested(&request).await;
    let Some(session_id) = query.session_id else {
        return (StatusCode::BAD_REQUEST, "sessionId is required").into_response();
    };
    if state.stream_for(&session_id).is_none() {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    }
    if state.behavior.reject_initialize && request["method"] == "initialize" {
        if let Some(stream) = state.stream_for(&session_id) {
            let response = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32602, "message": "unsupported protocol version"}
            });
            let _ = stream.send(Event::default().data(response.to_string()));
        }
        return (StatusCode::ACCEPTED, "Accepted").into_response();
    }
    state.dispatch(&session_id, request);
    (StatusCode::ACCEPTED, "Accepted").into_response()
}

fn header_session(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn handle_mcp_post(
    State(state): State<Arc<MockMcpState>>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    state.posts.fetch_add(1, Ordering::SeqCst);
    state.stall_if_requested(&request).await;
    if request["method"] == "initialize" {
        if state.behavior.reject_initialize {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32602, "message": "unsupported protocol version"}
            }))
            .into_response();
        }
        let session_id = state.next_session_id("mock-mcp");
        let body_session = match state.behavior.hybrid_session {
            HybridSessionSource::Body => Some(session_id.as_str()),
            HybridSessionSource::Header | HybridSessionSource::Missing => None,
        };
        let body = Json(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": initialize_result(body_session)
        }));
        if state.behavior.hybrid_session == HybridSessionSource::Header {
            return ([(SESSION_HEADER, session_id)], body).into_response();
        }
        return body.into_response();
    }

    let Some(session_id) = header_session(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing session header").into_response();
    };
    if state.stream_for(&session_id).is_none() {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    }
    state.dispatch(&session_id, request);
    StatusCode::ACCEPTED.into_response()
}

async fn handle_mcp_stream(State(state): State<Arc<MockMcpState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_session(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing session header").into_response();
    };
    sse_response(state.open_stream(&session_id))
}

pub fn build_mock_mcp_router(state: Arc<MockMcpState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/sse", get(handle_sse_stream))
        .route("/message", post(handle_sse_message))
        .route("/mcp", get(handle_mcp_stream).post(handle_mcp_post))
        .with_state(state)
}

pub async fn spawn_mock_mcp_server(
    behavior: MockBehavior,
) -> Result<(SocketAddr, Arc<MockMcpState>, tokio::task::JoinHandle<()>)> {
    let state = Arc::new(MockMcpState::new(behavior));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind ephemeral listener")?;
    let addr = listener.local_addr().context("resolve listener addr")?;
    let app = build_mock_mcp_router(state.clone());
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    Ok((addr, state, handle))
}

/// An address nothing listens on.
pub async fn unused_local_addr() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind ephemeral listener")?;
    let addr = listener.local_addr().context("resolve listener addr")?;
    drop(listener);
    Ok(addr)
}
