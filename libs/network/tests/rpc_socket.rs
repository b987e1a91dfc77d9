//! RPC socket protocol over real TCP connections on localhost

use async_trait::async_trait;
use codec::{CorrelationId, RpcMessage, SessionRequest};
use network::rpc::{FrameReader, FrameWriter, RpcNotification, SessionInfo};
use network::{RpcClient, RpcHandler, RpcOptions, RpcServer, RpcSocket, RpcStatus, TransportError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

const HUB: &str = "orders";

fn fast_options() -> RpcOptions {
    RpcOptions {
        invoke_timeout_ms: 2_000,
        handshake_timeout_ms: 1_000,
        reconnect_delay_ms: 50,
        ..RpcOptions::new(HUB, "test-client")
    }
}

/// Echoes payloads, fails on `fail`, never answers `hang`
#[derive(Default)]
struct TestHandler {
    calls: AtomicUsize,
    sessions: Mutex<HashSet<CorrelationId>>,
}

#[async_trait]
impl RpcHandler for TestHandler {
    async fn handle(
        &self,
        session: &SessionInfo,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().insert(session.session_id);
        match method {
            "echo" => Ok(payload),
            "fail" => Err("boom".to_string()),
            "hang" => std::future::pending().await,
            other => Err(format!("unknown method {}", other)),
        }
    }
}

async fn start_server(handler: Arc<TestHandler>) -> RpcServer {
    RpcServer::bind("127.0.0.1:0", RpcOptions::new(HUB, "server"), handler)
        .await
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn test_handshake_and_echo() {
    let handler = Arc::new(TestHandler::default());
    let server = start_server(handler.clone()).await;

    let socket = RpcSocket::new(server.local_addr().to_string(), fast_options());
    socket.start();
    socket.wait_connected(Duration::from_secs(2)).await.unwrap();

    let session = socket.session().unwrap();
    assert_eq!(session.hub, HUB);
    assert!(!session.session_id.is_nil());

    let reply = socket.invoke_method("echo", b"hello".to_vec()).await.unwrap();
    assert_eq!(reply, b"hello");
    assert_eq!(server.session_count(), 1);

    socket.close().await;
    server.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_hub_is_matched_case_insensitively() {
    let server = start_server(Arc::new(TestHandler::default())).await;

    let socket = RpcSocket::new(
        server.local_addr().to_string(),
        RpcOptions {
            hub: "ORDERS".to_string(),
            ..fast_options()
        },
    );
    socket.start();

    socket.wait_connected(Duration::from_secs(2)).await.unwrap();
    socket.close().await;
}

#[test_log::test(tokio::test)]
async fn test_unknown_hub_never_connects() {
    let server = start_server(Arc::new(TestHandler::default())).await;

    let socket = RpcSocket::new(
        server.local_addr().to_string(),
        RpcOptions {
            hub: "billing".to_string(),
            ..fast_options()
        },
    );
    socket.start();

    let result = socket.wait_connected(Duration::from_millis(300)).await;
    assert!(matches!(result, Err(TransportError::Timeout { .. })));
    assert_eq!(server.sessions_opened(), 0);
    socket.close().await;
}

#[test_log::test(tokio::test)]
async fn test_remote_error_is_surfaced() {
    let server = start_server(Arc::new(TestHandler::default())).await;
    let socket = RpcSocket::new(server.local_addr().to_string(), fast_options());
    socket.start();
    socket.wait_connected(Duration::from_secs(2)).await.unwrap();

    let result = socket.invoke_method("fail", Vec::new()).await;
    match result {
        Err(TransportError::Remote { method, message }) => {
            assert_eq!(method, "fail");
            assert_eq!(message, "boom");
        }
        other => panic!("expected a remote error, got {:?}", other),
    }
    socket.close().await;
}

#[test_log::test(tokio::test)]
async fn test_timeout_resets_socket_and_retries_exactly_once() {
    let handler = Arc::new(TestHandler::default());
    let server = start_server(handler.clone()).await;

    let socket = RpcSocket::new(
        server.local_addr().to_string(),
        RpcOptions {
            invoke_timeout_ms: 200,
            ..fast_options()
        },
    );
    socket.start();
    socket.wait_connected(Duration::from_secs(2)).await.unwrap();

    let result = socket.invoke_method("hang", Vec::new()).await;

    assert!(matches!(result, Err(TransportError::Timeout { .. })));
    assert_eq!(socket.reset_count(), 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    assert_eq!(server.sessions_opened(), 2);
    socket.close().await;
}

#[test_log::test(tokio::test)]
async fn test_socket_reconnects_after_server_restart() {
    let server = start_server(Arc::new(TestHandler::default())).await;
    let address = server.local_addr();

    let socket = RpcSocket::new(address.to_string(), fast_options());
    socket.start();
    socket.wait_connected(Duration::from_secs(2)).await.unwrap();
    let first = socket.session().unwrap();

    server.shutdown().await;
    let mut status = socket.watch_status();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| *s != RpcStatus::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    // The old accept loop releases the port asynchronously
    let mut restarted = None;
    for _ in 0..50 {
        match RpcServer::bind(
            address,
            RpcOptions::new(HUB, "server"),
            Arc::new(TestHandler::default()),
        )
        .await
        {
            Ok(server) => {
                restarted = Some(server);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let restarted = restarted.expect("port was not released");
    socket.wait_connected(Duration::from_secs(3)).await.unwrap();

    assert_ne!(socket.session().unwrap().session_id, first.session_id);
    assert_eq!(restarted.sessions_opened(), 1);
    socket.close().await;
}

#[test_log::test(tokio::test)]
async fn test_idle_socket_sends_keepalive_pings() {
    let server = start_server(Arc::new(TestHandler::default())).await;
    let socket = RpcSocket::new(
        server.local_addr().to_string(),
        RpcOptions {
            keepalive_idle_ms: 40,
            keepalive_check_ms: 20,
            ..fast_options()
        },
    );
    socket.start();
    socket.wait_connected(Duration::from_secs(2)).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.pings_received() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "no keepalive pings arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Pings keep the session alive without resetting it
    assert_eq!(socket.status(), RpcStatus::Connected);
    assert_eq!(socket.reset_count(), 0);
    assert_eq!(server.sessions_opened(), 1);
    socket.close().await;
}

#[test_log::test(tokio::test)]
async fn test_busy_socket_does_not_ping() {
    let server = start_server(Arc::new(TestHandler::default())).await;
    let socket = RpcSocket::new(
        server.local_addr().to_string(),
        RpcOptions {
            keepalive_idle_ms: 200,
            keepalive_check_ms: 20,
            ..fast_options()
        },
    );
    socket.start();
    socket.wait_connected(Duration::from_secs(2)).await.unwrap();

    for _ in 0..10 {
        socket.invoke_method("echo", vec![1]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(server.pings_received(), 0);
    socket.close().await;
}

#[test_log::test(tokio::test)]
async fn test_client_round_robins_across_sockets() {
    let handler = Arc::new(TestHandler::default());
    let server = start_server(handler.clone()).await;

    let client = RpcClient::connect(server.local_addr().to_string(), fast_options());
    for socket in client.sockets() {
        socket.wait_connected(Duration::from_secs(2)).await.unwrap();
    }
    assert_eq!(client.connected_count(), 2);

    for i in 0..4u8 {
        assert_eq!(client.invoke_method("echo", vec![i]).await.unwrap(), vec![i]);
    }

    assert_eq!(handler.sessions.lock().len(), 2);
    client.close().await;
}

#[test_log::test(tokio::test)]
async fn test_client_times_out_when_nothing_connects() {
    // Bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let client = RpcClient::connect(
        address.to_string(),
        RpcOptions {
            invoke_timeout_ms: 150,
            ..fast_options()
        },
    );

    let result = client.invoke_method("echo", Vec::new()).await;
    assert!(matches!(result, Err(TransportError::Timeout { .. })));
    client.close().await;
}

#[test_log::test(tokio::test)]
async fn test_broadcast_event_is_delivered_once_per_client() {
    let server = start_server(Arc::new(TestHandler::default())).await;
    let client = RpcClient::connect(server.local_addr().to_string(), fast_options());
    for socket in client.sockets() {
        socket.wait_connected(Duration::from_secs(2)).await.unwrap();
    }
    let mut notifications = client.notifications();

    // Both sessions receive the same message id
    assert_eq!(server.broadcast_event("price", b"42".to_vec()).await, 2);

    let first = tokio::time::timeout(Duration::from_secs(1), notifications.recv())
        .await
        .unwrap()
        .unwrap();
    match first {
        RpcNotification::Event(event) => {
            assert_eq!(event.name, "price");
            assert_eq!(event.payload, b"42");
        }
        other => panic!("expected an event, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(notifications.try_recv().is_err());
    client.close().await;
}

#[test_log::test(tokio::test)]
async fn test_server_answers_ping_with_pong() {
    let server = start_server(Arc::new(TestHandler::default())).await;

    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, codec::DEFAULT_MAX_RPC_MESSAGE_SIZE);
    let mut writer = FrameWriter::new(write_half);

    let message_id = CorrelationId::new();
    writer
        .write_message(&RpcMessage::SessionRequest(SessionRequest {
            message_id,
            hub: HUB.to_string(),
            client_name: "raw".to_string(),
        }))
        .await
        .unwrap();
    match reader.read_message().await.unwrap() {
        Some(RpcMessage::SessionResponse(response)) => {
            assert!(response.accepted);
            assert_eq!(response.message_id, message_id);
        }
        other => panic!("expected a session response, got {:?}", other),
    }

    writer.write_message(&RpcMessage::Ping).await.unwrap();
    assert_eq!(reader.read_message().await.unwrap(), Some(RpcMessage::Pong));
}
