// tests/integration/lifecycle_test.rs

//! Session lifecycle invariants: registry membership, close idempotence,
//! error paths, dispatch interception, and server shutdown.

use super::fixtures::*;
use async_trait::async_trait;
use bytes::Bytes;
use portico::command::RequestInterceptor;
use portico::config::ServerConfig;
use portico::errors::{CloseReason, PorticoError};
use portico::protocol::Request;
use portico::session::Session;
use std::sync::Arc;
use std::time::Duration;

fn live_registry_config(name: &str) -> ServerConfig {
    let mut config = test_config(name);
    config.disable_session_snapshot = true;
    config
}

#[tokio::test]
async fn registered_sessions_are_connected_and_lookup_is_case_insensitive() {
    let (server, _handler, addr) = start_echo_server(live_registry_config("Lifecycle")).await;
    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;

    assert_eq!(server.session_count(), 1);
    let session = server.all_sessions().pop().unwrap();
    assert!(session.connected());
    assert!(server.session(&session.id().to_uppercase()).is_some());

    drop(client);
    let gone = {
        let server = server.clone();
        wait_until(Duration::from_secs(3), move || server.session_count() == 0).await
    };
    assert!(gone);
    let disconnected = {
        let session = session.clone();
        wait_until(Duration::from_secs(3), move || !session.connected()).await
    };
    assert!(disconnected);
    assert_eq!(session.close_reason(), Some(CloseReason::ClientClosing));
    server.stop().await;
}

#[tokio::test]
async fn close_fires_exactly_once_with_the_first_reason() {
    let (server, handler, addr) = start_echo_server(live_registry_config("CloseOnce")).await;
    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;

    let session = server.all_sessions().pop().unwrap();
    session.close(CloseReason::TimeOut);
    session.close(CloseReason::SocketError);
    session.close(CloseReason::TimeOut);

    assert_eq!(client.read_line_within(Duration::from_secs(3)).await, None);
    let recorded = {
        let handler = handler.clone();
        wait_until(Duration::from_secs(3), move || {
            handler.closed_reasons() == vec![CloseReason::TimeOut]
        })
        .await
    };
    assert!(recorded, "expected exactly one close with the first reason");

    // Operations on the closed session fail cleanly.
    assert!(matches!(
        session.try_send(Bytes::from_static(b"late")),
        Err(PorticoError::SessionNotConnected)
    ));
    server.stop().await;
}

#[tokio::test]
async fn failing_command_closes_with_application_error() {
    let (server, handler, addr) = start_echo_server(live_registry_config("Faulty")).await;
    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;

    client.send_command("BOOM now").await;
    assert_eq!(client.read_line_within(Duration::from_secs(3)).await, None);
    let recorded = {
        let handler = handler.clone();
        wait_until(Duration::from_secs(3), move || {
            handler.closed_reasons() == vec![CloseReason::ApplicationError]
        })
        .await
    };
    assert!(recorded);
    assert_eq!(server.stats().handled_requests(), 1);
    server.stop().await;
}

#[tokio::test]
async fn unframeable_bytes_close_with_protocol_error() {
    let (server, handler, addr) = start_echo_server(live_registry_config("BadBytes")).await;
    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;

    client.send_raw(&[0xff, 0xfe, b'\r', b'\n']).await;
    assert_eq!(client.read_line_within(Duration::from_secs(3)).await, None);
    let recorded = {
        let handler = handler.clone();
        wait_until(Duration::from_secs(3), move || {
            handler.closed_reasons() == vec![CloseReason::ProtocolError]
        })
        .await
    };
    assert!(recorded);
    server.stop().await;
}

#[tokio::test]
async fn oversize_request_closes_the_session() {
    let mut config = live_registry_config("Oversize");
    config.max_request_length = 16;
    let (server, handler, addr) = start_echo_server(config).await;
    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;

    // One unterminated 64-byte line: retained bytes cross the limit.
    client.send_raw(&[b'x'; 64]).await;
    assert_eq!(client.read_line_within(Duration::from_secs(3)).await, None);
    let recorded = {
        let handler = handler.clone();
        wait_until(Duration::from_secs(3), move || {
            handler.closed_reasons() == vec![CloseReason::ServerClosing]
        })
        .await
    };
    assert!(recorded);
    server.stop().await;
}

#[tokio::test]
async fn global_filter_can_cancel_dispatch() {
    init_tracing();
    let handler = Arc::new(TrackingHandler::default());
    let server = echo_builder(live_registry_config("Filtered"), handler.clone())
        .add_global_filter(Arc::new(CancelFilter))
        .build()
        .unwrap();
    server.clone().start().await.unwrap();
    let addr = server.listen_addrs()[0];

    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;
    client.send_command("ECHO block").await;
    client.send_command("ECHO ok").await;
    // The cancelled command produced no reply; the next one did.
    assert_eq!(client.read_line().await.as_deref(), Some("ok"));
    let counted = {
        let server = server.clone();
        wait_until(Duration::from_secs(2), move || {
            server.stats().handled_requests() == 2
        })
        .await
    };
    assert!(counted, "both dispatches count, including the cancelled one");
    server.stop().await;
}

struct KeyEchoInterceptor;

#[async_trait]
impl RequestInterceptor for KeyEchoInterceptor {
    async fn handle(&self, session: &Arc<Session>, request: &Request) -> Result<(), PorticoError> {
        session.send_line(&format!("INT:{}", request.key())).await
    }
}

#[tokio::test]
async fn request_interceptor_replaces_registry_dispatch() {
    init_tracing();
    let handler = Arc::new(TrackingHandler::default());
    let server = echo_builder(live_registry_config("Intercepted"), handler.clone())
        .request_interceptor(Arc::new(KeyEchoInterceptor))
        .build()
        .unwrap();
    server.clone().start().await.unwrap();
    let addr = server.listen_addrs()[0];

    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;
    // ECHO is registered, but the interceptor owns dispatch now.
    client.send_command("ECHO hello").await;
    assert_eq!(client.read_line().await.as_deref(), Some("INT:ECHO"));
    server.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_every_session() {
    let (server, _handler, addr) = start_echo_server(live_registry_config("Broadcast")).await;
    let mut first = TestClient::connect(addr).await.unwrap();
    first.read_line().await;
    let mut second = TestClient::connect(addr).await.unwrap();
    second.read_line().await;

    let reached = server.broadcast(Bytes::from_static(b"PUSH\r\n"));
    assert_eq!(reached, 2);
    assert_eq!(first.read_line().await.as_deref(), Some("PUSH"));
    assert_eq!(second.read_line().await.as_deref(), Some("PUSH"));
    server.stop().await;
}

#[tokio::test]
async fn stop_closes_every_session_with_server_shutdown() {
    let (server, handler, addr) = start_echo_server(live_registry_config("Stopping")).await;
    let mut first = TestClient::connect(addr).await.unwrap();
    first.read_line().await;
    let mut second = TestClient::connect(addr).await.unwrap();
    second.read_line().await;
    assert_eq!(server.session_count(), 2);

    server.stop().await;
    assert!(!server.is_running());
    assert_eq!(server.session_count(), 0);
    assert_eq!(first.read_line_within(Duration::from_secs(2)).await, None);
    assert_eq!(second.read_line_within(Duration::from_secs(2)).await, None);

    let recorded = {
        let handler = handler.clone();
        wait_until(Duration::from_secs(3), move || {
            let reasons = handler.closed_reasons();
            reasons.len() == 2 && reasons.iter().all(|r| *r == CloseReason::ServerShutdown)
        })
        .await
    };
    assert!(recorded, "both sessions must close with ServerShutdown");

    // New connections are refused once stopped.
    match TestClient::connect(addr).await {
        Ok(mut late) => {
            assert_eq!(late.read_line_within(Duration::from_secs(1)).await, None);
        }
        Err(_) => {}
    }
}

#[tokio::test]
async fn start_refuses_a_running_server() {
    let (server, _handler, _addr) = start_echo_server(test_config("DoubleStart")).await;
    let second = server.clone().start().await;
    assert!(matches!(second, Err(PorticoError::InvalidState(_))));
    server.stop().await;
}
