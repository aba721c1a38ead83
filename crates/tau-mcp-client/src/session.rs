//! Transport-scoped handshake state owned by the client.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde_json::Value;

use crate::error::McpClientError;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unestablished,
    Handshaking,
    Active,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Unestablished => "unestablished",
            SessionState::Handshaking => "handshaking",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone)]
/// Handshake state for one connection. A session moves strictly forward
/// through its states and is never reused once closed.
pub struct Session {
    id: Option<String>,
    state: SessionState,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: None,
            state: SessionState::Unestablished,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn begin_handshake(&mut self) -> Result<(), McpClientError> {
        match self.state {
            SessionState::Unestablished => {
                self.state = SessionState::Handshaking;
                Ok(())
            }
            SessionState::Closed => Err(McpClientError::ClientClosed),
            other => Err(McpClientError::HandshakeFailed(format!(
                "session handshake already started (state={})",
                other.as_str()
            ))),
        }
    }

    /// Records the server-assigned session id. Only valid while handshaking.
    pub fn assign_id(&mut self, id: impl Into<String>) -> Result<(), McpClientError> {
        if self.state != SessionState::Handshaking {
            return Err(McpClientError::HandshakeFailed(format!(
                "cannot assign session id in state {}",
                self.state.as_str()
            )));
        }
        let id = id.into();
        if id.trim().is_empty() {
            return Err(McpClientError::HandshakeFailed(
                "server returned an empty session id".to_string(),
            ));
        }
        self.id = Some(id);
        Ok(())
    }

    pub fn activate(&mut self) -> Result<(), McpClientError> {
        if self.state != SessionState::Handshaking {
            return Err(McpClientError::HandshakeFailed(format!(
                "cannot activate session in state {}",
                self.state.as_str()
            )));
        }
        self.state = SessionState::Active;
        Ok(())
    }

    /// Returns true when this call performed the transition.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        true
    }
}

/// Proposes a session id for transports where the client opens the stream
/// before the server has issued one.
pub fn generate_session_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let count = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("tau-session-{nanos}-{count}")
}

/// Session id embedded in a handshake result body (`result.sessionId`).
pub fn session_id_from_result(result: &Value) -> Option<String> {
    result
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

/// Session id announced on an event stream as `{"type":"connected","sessionId":..}`.
pub fn session_id_from_connected_frame(data: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(data).ok()?;
    if value.get("type").and_then(Value::as_str) != Some("connected") {
        return None;
    }
    session_id_from_result(&value)
}
