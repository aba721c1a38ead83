//! Client facade: one transport, one session, one listener and one correlator
//! composed into `open`, `call`, `notify` and `close`.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::{
    config::McpServerConfig,
    correlator::RequestCorrelator,
    envelope::{Envelope, JsonRpcRequest, JsonRpcResponse},
    error::McpClientError,
    listener::{InboundListener, ListenerStats},
    session::{generate_session_id, session_id_from_result, Session, SessionState},
    transport::{HandshakeMode, McpTransport, SendReceipt, TransportKind},
};

pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
pub const DEFAULT_INITIALIZED_METHOD: &str = "notifications/initialized";
const INITIALIZE_METHOD: &str = "initialize";
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct McpClientOptions {
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
    pub capabilities: Value,
    pub handshake_timeout: Duration,
    /// Used by [`McpClient::call`] when the caller passes no timeout.
    pub call_timeout: Duration,
    /// Upper bound on waiting for the listener task during close.
    pub shutdown_timeout: Duration,
    pub initialized_method: String,
    pub first_request_id: i64,
    pub notification_capacity: usize,
}

impl Default for McpClientOptions {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: json!({}),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            initialized_method: DEFAULT_INITIALIZED_METHOD.to_string(),
            first_request_id: 1,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl McpClientOptions {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_name = name.into();
        self.client_version = version.into();
        self
    }

    fn initialize_params(&self) -> Value {
        json!({
            "protocolVersion": self.protocol_version,
            "capabilities": self.capabilities,
            "clientInfo": {
                "name": self.client_name,
                "version": self.client_version,
            }
        })
    }
}

/// Raw transport plus the listener draining it. The listener never outlives
/// the connection: it is stopped on close and aborted on drop. Whether it is
/// still draining is the listener's own state, see [`InboundListener::is_running`].
pub struct Connection {
    transport: Box<dyn McpTransport>,
    released: AtomicBool,
    listener: AsyncMutex<Option<InboundListener>>,
}

impl Connection {
    fn new(transport: Box<dyn McpTransport>) -> Self {
        Self {
            transport,
            released: AtomicBool::new(false),
            listener: AsyncMutex::new(None),
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

pub struct McpClient {
    connection: Connection,
    correlator: Arc<RequestCorrelator>,
    session: Mutex<Session>,
    notifications: broadcast::Sender<Envelope>,
    server_info: Mutex<Option<Value>>,
    options: McpClientOptions,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("transport", &self.connection.transport_kind())
            .field("session", &*self.lock_session())
            .field("pending_calls", &self.pending_calls())
            .finish_non_exhaustive()
    }
}

impl McpClient {
    pub fn new(transport: Box<dyn McpTransport>, options: McpClientOptions) -> Self {
        let (notifications, _) = broadcast::channel(options.notification_capacity.max(1));
        Self {
            connection: Connection::new(transport),
            correlator: Arc::new(RequestCorrelator::starting_at(options.first_request_id)),
            session: Mutex::new(Session::new()),
            notifications,
            server_info: Mutex::new(None),
            options,
        }
    }

    pub fn from_server_config(
        server: &McpServerConfig,
        options: McpClientOptions,
    ) -> Result<Self, McpClientError> {
        if !server.enabled {
            return Err(McpClientError::Config(format!(
                "mcp server '{}' is disabled",
                server.name
            )));
        }
        Ok(Self::new(server.build_transport()?, options))
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &McpClientOptions {
        &self.options
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.connection.transport_kind()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock_session().id().map(ToString::to_string)
    }

    /// Current session state. A connection whose inbound stream died is
    /// reported as closed.
    pub fn session_state(&self) -> SessionState {
        let mut session = self.lock_session();
        if session.state() != SessionState::Closed && self.correlator.terminal_error().is_some() {
            session.close();
        }
        session.state()
    }

    pub fn pending_calls(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Result of the `initialize` exchange, once the client is open.
    pub fn server_info(&self) -> Option<Value> {
        self.server_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receives notifications and server-initiated requests seen by the listener.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.notifications.subscribe()
    }

    pub async fn listener_stats(&self) -> Option<ListenerStats> {
        self.connection
            .listener
            .lock()
            .await
            .as_ref()
            .map(InboundListener::stats)
    }

    /// Builds a request carrying a fresh correlation id.
    pub fn new_request(&self, method: impl Into<String>, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            id: self.correlator.next_id(),
            method: method.into(),
            params,
        }
    }

    /// Connects the transport and performs the handshake. Any failure leaves
    /// the client closed; it must be discarded and rebuilt.
    pub async fn open(&self) -> Result<(), McpClientError> {
        self.lock_session().begin_handshake()?;
        tracing::debug!(transport = self.transport_kind().as_str(), "opening mcp client");
        let error = match self.handshake().await {
            Ok(()) => {
                tracing::debug!(
                    transport = self.transport_kind().as_str(),
                    session_id = %self.session_id().unwrap_or_default(),
                    "mcp client open"
                );
                return Ok(());
            }
            Err(error) => error,
        };

        let closed_concurrently = !self.lock_session().close();
        let error = match error {
            _ if closed_concurrently => McpClientError::ClientClosed,
            fatal @ (McpClientError::Transport(_)
            | McpClientError::HandshakeFailed(_)
            | McpClientError::ClientClosed) => fatal,
            other => McpClientError::HandshakeFailed(other.to_string()),
        };
        tracing::warn!(
            transport = self.transport_kind().as_str(),
            reason_code = error.reason_code(),
            %error,
            "mcp client handshake failed"
        );
        if let Err(close_error) = self.shutdown(error.clone()).await {
            tracing::warn!(%close_error, "failed to release transport after handshake failure");
        }
        Err(error)
    }

    async fn handshake(&self) -> Result<(), McpClientError> {
        let transport = self.connection.transport.as_ref();
        let initialize_id = self.correlator.next_id();
        let initialize = Envelope::request(
            initialize_id.clone(),
            INITIALIZE_METHOD,
            Some(self.options.initialize_params()),
        );

        let result = match transport.handshake_mode() {
            HandshakeMode::Direct => {
                transport.connect(None).await?;
                self.ensure_not_released().await?;
                let handshake_timeout = self.options.handshake_timeout;
                let send = transport.send(&initialize, None);
                let receipt = tokio::time::timeout(handshake_timeout, send)
                    .await
                    .map_err(|_| {
                        McpClientError::HandshakeFailed(format!(
                            "initialize got no response within {}ms",
                            handshake_timeout.as_millis()
                        ))
                    })??;
                let response = match receipt.direct_response {
                    Some(Envelope::Response(response)) if response.id == initialize_id => response,
                    Some(other) => {
                        return Err(McpClientError::HandshakeFailed(format!(
                            "unexpected {} in handshake response body",
                            other.kind()
                        )))
                    }
                    None => {
                        return Err(McpClientError::HandshakeFailed(
                            "handshake response body carried no envelope".to_string(),
                        ))
                    }
                };
                let result = response.into_result().map_err(|error| {
                    McpClientError::HandshakeFailed(format!("initialize rejected: {error}"))
                })?;
                let session_id = receipt
                    .session_id
                    .or_else(|| session_id_from_result(&result))
                    .ok_or_else(|| {
                        McpClientError::HandshakeFailed(
                            "server issued no session id in header or body".to_string(),
                        )
                    })?;
                self.lock_session().assign_id(session_id.as_str())?;
                self.attach_listener(Some(&session_id)).await?;
                result
            }
            HandshakeMode::Correlated => {
                let proposed = generate_session_id();
                let outcome = transport.connect(Some(&proposed)).await?;
                self.ensure_not_released().await?;
                if let Some(session_id) = outcome.session_id.as_deref() {
                    self.lock_session().assign_id(session_id)?;
                }
                let session_id = outcome.session_id.as_deref();
                self.attach_listener(session_id).await?;
                let response = self
                    .exchange(initialize, session_id, self.options.handshake_timeout)
                    .await?;
                response.into_result().map_err(|error| {
                    McpClientError::HandshakeFailed(format!("initialize rejected: {error}"))
                })?
            }
        };

        *self
            .server_info
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(result);
        let session_id = self.session_id();
        let initialized = Envelope::notification(self.options.initialized_method.as_str(), None);
        transport.send(&initialized, session_id.as_deref()).await?;
        self.lock_session().activate()
    }

    /// A close that lands while `connect` is in flight finds nothing to
    /// release, so whatever `connect` set up is released here instead.
    async fn ensure_not_released(&self) -> Result<(), McpClientError> {
        if !self.connection.released.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(error) = self.connection.transport.close().await {
            tracing::warn!(%error, "failed to release transport connected after close");
        }
        Err(McpClientError::ClientClosed)
    }

    async fn attach_listener(&self, session_id: Option<&str>) -> Result<(), McpClientError> {
        let frames = self.connection.transport.inbound(session_id).await?;
        let mut listener =
            InboundListener::spawn(frames, self.correlator.clone(), self.notifications.clone());
        // `shutdown` flips `released` before taking this lock, so checking
        // under it means either shutdown sees the listener or we stop it.
        let mut slot = self.connection.listener.lock().await;
        if self.connection.released.load(Ordering::SeqCst) {
            drop(slot);
            let exit = listener.stop(self.options.shutdown_timeout).await;
            tracing::debug!(?exit, "inbound listener stopped: client closed during open");
            return self.ensure_not_released().await;
        }
        *slot = Some(listener);
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), McpClientError> {
        if let Some(error) = self.correlator.terminal_error() {
            return Err(error);
        }
        match self.lock_session().state() {
            SessionState::Active => Ok(()),
            SessionState::Closed => Err(McpClientError::ClientClosed),
            other => Err(McpClientError::transport(format!(
                "mcp client is not open (session {})",
                other.as_str()
            ))),
        }
    }

    /// Registers, sends and waits, all within `timeout`. A send failure
    /// withdraws the registration and surfaces immediately.
    async fn exchange(
        &self,
        envelope: Envelope,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpClientError> {
        let id = envelope
            .id()
            .cloned()
            .ok_or_else(|| McpClientError::Config("only requests can be awaited".to_string()))?;
        let waiter = self.correlator.register(id)?;
        let send = self.connection.transport.send(&envelope, session_id);
        match tokio::time::timeout(timeout, send).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                self.correlator.cancel(waiter.id());
                return Err(self.correlator.terminal_error().unwrap_or(error));
            }
            Err(_) => {
                self.correlator.cancel(waiter.id());
                return Err(McpClientError::Timeout {
                    id: waiter.id().clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        // The waiter's clock started at registration, so the send's share of
        // the budget is already spent.
        self.correlator.await_response(waiter, timeout).await
    }

    /// Sends a caller-built request and returns the raw response envelope,
    /// including error responses.
    pub async fn call_envelope(
        &self,
        request: JsonRpcRequest,
        timeout: Option<Duration>,
    ) -> Result<JsonRpcResponse, McpClientError> {
        self.ensure_active()?;
        let session_id = self.session_id();
        let timeout = timeout.unwrap_or(self.options.call_timeout);
        self.exchange(Envelope::Request(request), session_id.as_deref(), timeout)
            .await
    }

    /// Calls `method` and returns its `result`. A response carrying `error`
    /// becomes [`McpClientError::Protocol`].
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, McpClientError> {
        self.ensure_active()?;
        let request = self.new_request(method, params);
        tracing::debug!(id = %request.id, method, "mcp call");
        self.call_envelope(request, timeout).await?.into_result()
    }

    /// Fire-and-forget. Success only means the transport accepted the bytes.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<SendReceipt, McpClientError> {
        self.ensure_active()?;
        let session_id = self.session_id();
        self.connection
            .transport
            .send(&Envelope::notification(method, params), session_id.as_deref())
            .await
    }

    /// Stops the listener, fails every blocked caller with
    /// [`McpClientError::ClientClosed`] and releases the transport. Idempotent.
    pub async fn close(&self) -> Result<(), McpClientError> {
        self.lock_session().close();
        self.shutdown(McpClientError::ClientClosed).await
    }

    /// Runs at most once per client, whichever of close or a failed open
    /// gets here first.
    async fn shutdown(&self, reason: McpClientError) -> Result<(), McpClientError> {
        if self.connection.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(
            transport = self.transport_kind().as_str(),
            reason_code = reason.reason_code(),
            "releasing mcp client connection"
        );
        let listener = self.connection.listener.lock().await.take();
        if let Some(mut listener) = listener {
            let exit = listener.stop(self.options.shutdown_timeout).await;
            tracing::debug!(?exit, "inbound listener joined");
        }
        let failed = self.correlator.fail_all(reason);
        if failed > 0 {
            tracing::debug!(failed, "released blocked callers on shutdown");
        }
        self.connection.transport.close().await
    }
}
