// tests/integration/scenarios_test.rs

//! The literal end-to-end scenarios: welcome, echo, unknown command, split
//! and pipelined writes, idle sweep, connection cap, and client concurrency.

use super::fixtures::*;
use std::time::Duration;

#[tokio::test]
async fn welcome_is_sent_on_connect() {
    let (server, _handler, addr) = start_echo_server(test_config("EchoServer")).await;
    let mut client = TestClient::connect(addr).await.unwrap();
    assert_eq!(
        client.read_line().await.as_deref(),
        Some("Welcome to EchoServer")
    );
    server.stop().await;
}

#[tokio::test]
async fn echo_replies_with_the_body() {
    let (server, _handler, addr) = start_echo_server(test_config("EchoServer")).await;
    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;

    client.send_command("ECHO hello").await;
    assert_eq!(client.read_line().await.as_deref(), Some("hello"));
    server.stop().await;
}

#[tokio::test]
async fn unknown_command_gets_the_default_reply() {
    let (server, _handler, addr) = start_echo_server(test_config("EchoServer")).await;
    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;

    client.send_command("XYZ 1 2 3").await;
    assert_eq!(
        client.read_line().await.as_deref(),
        Some("Unknown request: XYZ")
    );
    server.stop().await;
}

#[tokio::test]
async fn command_split_across_writes_is_reassembled() {
    let (server, _handler, addr) = start_echo_server(test_config("EchoServer")).await;
    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;

    client.send_raw(b"EC").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.send_raw(b"HO hi").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.send_raw(b"\r\n").await;

    assert_eq!(client.read_line().await.as_deref(), Some("hi"));
    server.stop().await;
}

#[tokio::test]
async fn pipelined_commands_reply_in_order() {
    let (server, _handler, addr) = start_echo_server(test_config("EchoServer")).await;
    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;

    client.send_raw(b"ECHO a\r\nECHO b\r\nECHO c\r\n").await;
    assert_eq!(client.read_line().await.as_deref(), Some("a"));
    assert_eq!(client.read_line().await.as_deref(), Some("b"));
    assert_eq!(client.read_line().await.as_deref(), Some("c"));
    server.stop().await;
}

#[tokio::test]
async fn idle_sessions_are_swept() {
    let mut config = test_config("IdleServer");
    config.clear_idle_session = true;
    config.idle_session_timeout_secs = 2;
    config.clear_idle_session_interval_secs = 1;
    config.session_snapshot_interval_secs = 1;
    let (server, handler, addr) = start_echo_server(config).await;

    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;
    assert_eq!(server.session_count(), 1);

    let swept = {
        let server = server.clone();
        wait_until(Duration::from_secs(8), move || server.session_count() == 0).await
    };
    assert!(swept, "idle session was not swept");
    assert_eq!(
        client.read_line_within(Duration::from_secs(2)).await,
        None,
        "swept session should read EOF"
    );
    let recorded = {
        let handler = handler.clone();
        wait_until(Duration::from_secs(2), move || {
            handler.closed_reasons() == vec![portico::errors::CloseReason::TimeOut]
        })
        .await
    };
    assert!(recorded, "close callback did not record the timeout");
    server.stop().await;
}

#[tokio::test]
async fn connections_past_the_cap_are_dropped_without_welcome() {
    let mut config = test_config("CappedServer");
    config.max_connections = 2;
    let (server, _handler, addr) = start_echo_server(config).await;

    let mut first = TestClient::connect(addr).await.unwrap();
    assert!(first.read_line().await.is_some());
    let mut second = TestClient::connect(addr).await.unwrap();
    assert!(second.read_line().await.is_some());

    match TestClient::connect(addr).await {
        Ok(mut third) => {
            assert_eq!(
                third.read_line_within(Duration::from_secs(2)).await,
                None,
                "third connection must not receive a welcome"
            );
        }
        Err(_) => {
            // A refused connect satisfies the cap just as well.
        }
    }
    assert_eq!(server.session_count(), 2);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_clients_see_their_own_tokens_in_order() {
    let mut config = test_config("BusyServer");
    config.max_connections = 150;
    let (server, _handler, addr) = start_echo_server(config).await;

    let mut tasks = Vec::new();
    for client_id in 0..100u32 {
        tasks.push(tokio::spawn(async move {
            let mut client = TestClient::connect(addr).await.unwrap();
            client.read_line().await;
            for i in 0..10u32 {
                let token = format!("tok-{client_id}-{i}");
                client.send_command(&format!("ECHO {token}")).await;
                assert_eq!(client.read_line().await.as_deref(), Some(token.as_str()));
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let counted = {
        let server = server.clone();
        wait_until(Duration::from_secs(3), move || {
            server.stats().handled_requests() == 1000
        })
        .await
    };
    assert!(counted, "every dispatch is counted exactly once");
    server.stop().await;
}
