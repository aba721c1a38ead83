//! Multi-transport MCP client for Tau.
//!
//! Speaks JSON-RPC over a spawned process pipe, an SSE stream paired with a
//! message endpoint, or a single streamable-HTTP endpoint, and correlates
//! every response back to the caller that asked for it.

pub mod client;
pub mod config;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod session;
pub mod sse;
pub mod transport;

pub use client::{
    Connection, McpClient, McpClientOptions, DEFAULT_INITIALIZED_METHOD, DEFAULT_PROTOCOL_VERSION,
};
pub use config::{
    load_mcp_client_servers, normalize_mcp_client_server_name, McpClientConfigFile,
    McpServerConfig, McpTaggedTransportConfig, McpTransportConfig,
    MCP_CLIENT_CONFIG_SCHEMA_VERSION,
};
pub use correlator::{RequestCorrelator, ResolveOutcome, ResponseWaiter};
pub use envelope::{
    Envelope, EnvelopeDecodeError, JsonRpcErrorObject, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, ResponsePayload, JSONRPC_VERSION,
};
pub use error::McpClientError;
pub use listener::{InboundListener, ListenerExit, ListenerStats};
pub use session::{Session, SessionState};
pub use transport::{
    ConnectOutcome, HandshakeMode, InboundFrame, InboundFrames, McpTransport, SendReceipt,
    SseTransport, SseTransportConfig, StdioTransport, StdioTransportConfig,
    StreamableHttpTransport, StreamableHttpTransportConfig, TransportKind,
};
