// tests/integration/udp_test.rs

//! Datagram-mode coverage: peer admission, per-peer framing, and replies
//! without the line terminator.

use super::fixtures::*;
use portico::config::SocketMode;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[tokio::test]
async fn datagram_echo_round_trip() {
    let mut config = test_config("UdpEcho");
    config.mode = SocketMode::Udp;
    config.disable_session_snapshot = true;
    let (server, _handler, addr) = start_echo_server(config).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ECHO ping\r\n", addr).await.unwrap();

    // The welcome datagram precedes the echo reply; neither carries the line
    // terminator in datagram mode.
    let mut buf = [0u8; 128];
    let (len, from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, addr);
    assert_eq!(&buf[..len], b"Welcome to UdpEcho");

    let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..len], b"ping");

    assert_eq!(server.session_count(), 1);
    server.stop().await;
}

#[tokio::test]
async fn repeated_datagrams_reuse_the_peer_session() {
    let mut config = test_config("UdpReuse");
    config.mode = SocketMode::Udp;
    config.disable_session_snapshot = true;
    let (server, handler, addr) = start_echo_server(config).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 128];
    for i in 0..3 {
        client
            .send_to(format!("ECHO n{i}\r\n").as_bytes(), addr)
            .await
            .unwrap();
        if i == 0 {
            // The first datagram admits the peer, so the welcome comes first.
            let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..len], b"Welcome to UdpReuse");
        }
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], format!("n{i}").as_bytes());
    }

    assert_eq!(server.session_count(), 1);
    assert_eq!(
        handler
            .connected_count
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    let counted = {
        let server = server.clone();
        wait_until(Duration::from_secs(2), move || {
            server.stats().handled_requests() == 3
        })
        .await
    };
    assert!(counted);
    server.stop().await;
}

#[tokio::test]
async fn closing_a_datagram_session_deregisters_the_peer() {
    let mut config = test_config("UdpClose");
    config.mode = SocketMode::Udp;
    config.disable_session_snapshot = true;
    let (server, handler, addr) = start_echo_server(config).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ECHO one\r\n", addr).await.unwrap();
    let mut buf = [0u8; 128];
    // Welcome, then the echo reply.
    for expected in [&b"Welcome to UdpClose"[..], b"one"] {
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], expected);
    }

    let session = server.all_sessions().pop().unwrap();
    session.close(portico::errors::CloseReason::ServerClosing);

    let gone = {
        let server = server.clone();
        wait_until(Duration::from_secs(3), move || server.session_count() == 0).await
    };
    assert!(gone);
    let recorded = {
        let handler = handler.clone();
        wait_until(Duration::from_secs(3), move || {
            handler.closed_reasons() == vec![portico::errors::CloseReason::ServerClosing]
        })
        .await
    };
    assert!(recorded);

    // The next datagram from the same peer is admitted as a fresh session,
    // so it is welcomed again before the reply.
    client.send_to(b"ECHO two\r\n", addr).await.unwrap();
    for expected in [&b"Welcome to UdpClose"[..], b"two"] {
        let (len, _) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], expected);
    }
    assert_eq!(server.session_count(), 1);
    server.stop().await;
}
