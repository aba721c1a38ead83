mod support;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::json;
use support::{
    init_tracing, spawn_mock_mcp_server, unused_local_addr, MockBehavior, SseAnnouncement,
    STALLED_POST_METHOD,
};
use tau_mcp_client::{
    McpClient, McpClientError, McpClientOptions, RequestId, SessionState, SseTransport,
    SseTransportConfig, TransportKind,
};

fn sse_client(base_url: String, configure: impl FnOnce(&mut SseTransportConfig)) -> McpClient {
    let mut config = SseTransportConfig::new(base_url);
    config.health_path = Some("/health".to_string());
    configure(&mut config);
    let transport = SseTransport::new(config).expect("sse transport");
    McpClient::new(Box::new(transport), McpClientOptions::default())
}

#[tokio::test]
async fn integration_sse_handshake_then_echo_tool_call() {
    init_tracing();
    let (addr, state, server) = spawn_mock_mcp_server(MockBehavior::default())
        .await
        .expect("spawn mock server");
    let client = sse_client(format!("http://{addr}"), |_| {});
    let mut notifications = client.subscribe();

    client.open().await.expect("open");
    assert_eq!(client.transport_kind(), TransportKind::Sse);
    assert_eq!(client.session_state(), SessionState::Active);
    let session_id = client.session_id().expect("session id");
    assert!(
        session_id.starts_with("mock-sse-"),
        "server-announced session wins: {session_id}"
    );
    assert_eq!(
        client.server_info().expect("server info")["serverInfo"]["name"],
        "mock-http"
    );

    let tools = client.call("tools/list", None, None).await.expect("tools/list");
    assert_eq!(tools["tools"][0]["name"], "echo");

    let request = client.new_request(
        "tools/call",
        Some(json!({"name": "echo", "arguments": {"message": "hi"}})),
    );
    assert_eq!(request.id, RequestId::Number(3));
    let result = client
        .call_envelope(request, Some(Duration::from_secs(5)))
        .await
        .expect("tools/call")
        .into_result()
        .expect("result");
    assert_eq!(result["content"][0]["text"], "Echo: hi");

    let notification = tokio::time::timeout(Duration::from_secs(5), notifications.recv())
        .await
        .expect("notification in time")
        .expect("notification");
    assert_eq!(notification.method(), Some("notifications/message"));
    // initialize, initialized, tools/list, tools/call
    assert_eq!(state.post_count(), 4);

    client.close().await.expect("close");
    server.abort();
}

#[tokio::test]
async fn integration_sse_connected_frame_keeps_proposed_session() {
    let behavior = MockBehavior {
        sse_announcement: SseAnnouncement::Connected,
        ..MockBehavior::default()
    };
    let (addr, _state, server) = spawn_mock_mcp_server(behavior).await.expect("spawn");
    let client = sse_client(format!("http://{addr}"), |config| {
        config.session_id = Some("fixed-session-7".to_string());
    });

    client.open().await.expect("open");
    assert_eq!(client.session_id().as_deref(), Some("fixed-session-7"));
    let result = client
        .call(
            "tools/call",
            Some(json!({"name": "echo", "arguments": {"message": "connected"}})),
            None,
        )
        .await
        .expect("tools/call");
    assert_eq!(result["content"][0]["text"], "Echo: connected");
    client.close().await.expect("close");
    server.abort();
}

#[tokio::test]
async fn integration_sse_silent_stream_falls_back_after_ready_window() {
    let behavior = MockBehavior {
        sse_announcement: SseAnnouncement::Silent,
        ..MockBehavior::default()
    };
    let (addr, _state, server) = spawn_mock_mcp_server(behavior).await.expect("spawn");
    let client = sse_client(format!("http://{addr}"), |config| {
        config.ready_timeout_ms = 100;
    });

    client.open().await.expect("open");
    let session_id = client.session_id().expect("session id");
    assert!(session_id.starts_with("tau-session-"));
    let tools = client.call("tools/list", None, None).await.expect("tools/list");
    assert!(tools["tools"].is_array());
    client.close().await.expect("close");
    server.abort();
}

#[tokio::test]
async fn integration_sse_out_of_order_responses_reach_their_callers() {
    let (addr, _state, server) = spawn_mock_mcp_server(MockBehavior::default())
        .await
        .expect("spawn");
    let client = sse_client(format!("http://{addr}"), |_| {});
    client.open().await.expect("open");

    let hold = |id: i64| tau_mcp_client::JsonRpcRequest {
        id: RequestId::Number(id),
        method: "test/hold".to_string(),
        params: None,
    };
    let (ten, eleven) = tokio::join!(
        client.call_envelope(hold(10), Some(Duration::from_secs(5))),
        client.call_envelope(hold(11), Some(Duration::from_secs(5))),
    );
    let ten = ten.expect("response 10");
    let eleven = eleven.expect("response 11");
    assert_eq!(ten.id, RequestId::Number(10));
    assert_eq!(ten.into_result().expect("result 10")["held"], 10);
    assert_eq!(eleven.into_result().expect("result 11")["held"], 11);
    assert_eq!(client.pending_calls(), 0);

    client.close().await.expect("close");
    server.abort();
}

#[tokio::test]
async fn integration_sse_close_unblocks_callers_and_timeouts_are_recoverable() {
    let (addr, _state, server) = spawn_mock_mcp_server(MockBehavior::default())
        .await
        .expect("spawn");
    let client = Arc::new(sse_client(format!("http://{addr}"), |_| {}));
    client.open().await.expect("open");

    let error = client
        .call("test/never", None, Some(Duration::from_millis(150)))
        .await
        .expect_err("timeout");
    assert!(matches!(error, McpClientError::Timeout { .. }));
    client
        .call("tools/list", None, None)
        .await
        .expect("usable after timeout");

    let blocked = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call("test/never", None, Some(Duration::from_secs(60)))
                .await
        })
    };
    while client.pending_calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    client.close().await.expect("close");
    let outcome = tokio::time::timeout(Duration::from_secs(5), blocked)
        .await
        .expect("bounded")
        .expect("join");
    assert_eq!(outcome.expect_err("closed"), McpClientError::ClientClosed);
    client.close().await.expect("idempotent close");
    server.abort();
}

#[tokio::test]
async fn regression_sse_stream_drop_fails_pending_calls_with_transport_error() {
    let (addr, _state, server) = spawn_mock_mcp_server(MockBehavior::default())
        .await
        .expect("spawn");
    let client = sse_client(format!("http://{addr}"), |_| {});
    client.open().await.expect("open");

    let error = client
        .call("test/drop-stream", None, Some(Duration::from_secs(5)))
        .await
        .expect_err("stream dropped");
    assert!(matches!(error, McpClientError::Transport(_)), "{error:?}");
    assert_eq!(client.session_state(), SessionState::Closed);
    client.close().await.expect("close");
    server.abort();
}

#[tokio::test]
async fn regression_sse_handshake_error_and_refused_connection() {
    let behavior = MockBehavior {
        reject_initialize: true,
        ..MockBehavior::default()
    };
    let (addr, _state, server) = spawn_mock_mcp_server(behavior).await.expect("spawn");
    let client = sse_client(format!("http://{addr}"), |_| {});
    let error = client.open().await.expect_err("initialize rejected");
    assert!(matches!(error, McpClientError::HandshakeFailed(_)), "{error:?}");
    assert_eq!(client.session_state(), SessionState::Closed);
    assert!(client.call("tools/list", None, None).await.is_err());
    server.abort();

    let addr = unused_local_addr().await.expect("unused addr");
    let client = sse_client(format!("http://{addr}"), |_| {});
    let error = client.open().await.expect_err("refused");
    assert!(matches!(error, McpClientError::Transport(_)), "{error:?}");
}

#[tokio::test]
async fn regression_sse_stalled_message_post_times_out_within_call_budget() {
    let (addr, _state, server) = spawn_mock_mcp_server(MockBehavior::default())
        .await
        .expect("spawn");
    let client = sse_client(format!("http://{addr}"), |config| {
        config.timeout_ms = 3_000;
    });
    client.open().await.expect("open");

    let started = Instant::now();
    let error = client
        .call(STALLED_POST_METHOD, None, Some(Duration::from_millis(200)))
        .await
        .expect_err("post never completes");
    assert!(
        matches!(error, McpClientError::Timeout { timeout_ms: 200, .. }),
        "{error:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    assert_eq!(client.pending_calls(), 0);
    client
        .call("tools/list", None, None)
        .await
        .expect("usable after stalled post");
    client.close().await.expect("close");
    server.abort();
}

#[tokio::test]
async fn regression_sse_stalled_initialize_post_fails_within_handshake_timeout() {
    let behavior = MockBehavior {
        stall_initialize: true,
        ..MockBehavior::default()
    };
    let (addr, _state, server) = spawn_mock_mcp_server(behavior).await.expect("spawn");
    let mut config = SseTransportConfig::new(format!("http://{addr}"));
    config.timeout_ms = 3_000;
    let client = McpClient::new(
        Box::new(SseTransport::new(config).expect("sse transport")),
        McpClientOptions::default().with_handshake_timeout(Duration::from_millis(200)),
    );

    let started = Instant::now();
    let error = client.open().await.expect_err("handshake stalls");
    assert!(matches!(error, McpClientError::HandshakeFailed(_)), "{error:?}");
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    assert_eq!(client.session_state(), SessionState::Closed);
    server.abort();
}
