use serde_json::Value;
use thiserror::Error;

use crate::envelope::RequestId;

#[derive(Debug, Clone, Error, PartialEq)]
/// Outcome taxonomy surfaced to callers of the MCP client.
///
/// `Timeout` and `Protocol` leave the client usable; `HandshakeFailed` and
/// `ClientClosed` are terminal for the client instance.
pub enum McpClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("request {id} timed out after {timeout_ms}ms")]
    Timeout { id: RequestId, timeout_ms: u64 },
    #[error("json-rpc error code={code} message={message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("request id {0} is already in flight")]
    DuplicateId(RequestId),
    #[error("client closed")]
    ClientClosed,
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl McpClientError {
    pub fn transport(detail: impl Into<String>) -> Self {
        McpClientError::Transport(detail.into())
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            McpClientError::Transport(_) => "mcp_client_transport_failed",
            McpClientError::HandshakeFailed(_) => "mcp_client_handshake_failed",
            McpClientError::Timeout { .. } => "mcp_client_request_timeout",
            McpClientError::Protocol { .. } => "mcp_client_jsonrpc_error",
            McpClientError::DuplicateId(_) => "mcp_client_duplicate_request_id",
            McpClientError::ClientClosed => "mcp_client_closed",
            McpClientError::Config(_) => "mcp_client_invalid_config",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            McpClientError::Timeout { .. } | McpClientError::Protocol { .. }
        )
    }
}

impl From<reqwest::Error> for McpClientError {
    fn from(error: reqwest::Error) -> Self {
        McpClientError::Transport(error.to_string())
    }
}

impl From<std::io::Error> for McpClientError {
    fn from(error: std::io::Error) -> Self {
        McpClientError::Transport(error.to_string())
    }
}
