// tests/integration/bootstrap_test.rs

//! Multi-server composition through the bootstrap.

use super::fixtures::*;
use portico::bootstrap::{Bootstrap, ServerDescriptor, StartResult};
use portico::errors::PorticoError;
use std::sync::Arc;

fn echo_descriptor(config: portico::config::ServerConfig) -> ServerDescriptor {
    ServerDescriptor::new(config, move |builder| {
        builder
            .handler(Arc::new(TrackingHandler::default()))
            .framer_factory(command_line_factory())
            .add_command_loader(Arc::new(portico::StaticCommandLoader::new(vec![
                Arc::new(EchoCommand) as Arc<dyn portico::command::Command>,
            ])))
            .build()
    })
}

#[tokio::test]
async fn empty_bootstrap_starts_nothing() {
    init_tracing();
    let mut bootstrap = Bootstrap::new();
    assert_eq!(bootstrap.start().await, StartResult::None);
    bootstrap.stop().await;
}

#[tokio::test]
async fn all_servers_starting_is_success() {
    init_tracing();
    let mut bootstrap = Bootstrap::new();
    bootstrap
        .initialize(vec![
            echo_descriptor(test_config("Alpha")),
            echo_descriptor(test_config("Beta")),
        ])
        .unwrap();
    assert_eq!(bootstrap.start().await, StartResult::Success);
    assert_eq!(bootstrap.servers().len(), 2);
    assert!(bootstrap.server("Alpha").is_some());
    assert!(bootstrap.servers().iter().all(|s| s.is_running()));

    // The two servers answer independently.
    for server in bootstrap.servers() {
        let addr = server.listen_addrs()[0];
        let mut client = TestClient::connect(addr).await.unwrap();
        client.read_line().await;
        client.send_command("ECHO here").await;
        assert_eq!(client.read_line().await.as_deref(), Some("here"));
    }

    bootstrap.stop().await;
    assert!(bootstrap.servers().iter().all(|s| !s.is_running()));
}

#[tokio::test]
async fn invalid_configuration_fails_initialization() {
    init_tracing();
    let mut config = test_config("Broken");
    config.ip = None;
    config.port = None;
    let mut bootstrap = Bootstrap::new();
    let result = bootstrap.initialize(vec![echo_descriptor(config)]);
    assert!(matches!(result, Err(PorticoError::Config(_))));
}

#[tokio::test]
async fn a_failing_bind_yields_partial_success() {
    init_tracing();
    // Occupy a port so the second server cannot bind it.
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap();

    let mut conflicting = test_config("Conflicting");
    conflicting.port = Some(taken.port());

    let mut bootstrap = Bootstrap::new();
    bootstrap
        .initialize(vec![
            echo_descriptor(test_config("Healthy")),
            echo_descriptor(conflicting),
        ])
        .unwrap();
    assert_eq!(bootstrap.start().await, StartResult::PartialSuccess);
    assert!(bootstrap.server("Healthy").unwrap().is_running());
    assert!(!bootstrap.server("Conflicting").unwrap().is_running());
    bootstrap.stop().await;
}

#[tokio::test]
async fn every_bind_failing_is_failed() {
    init_tracing();
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap();

    let mut config = test_config("Blocked");
    config.port = Some(taken.port());

    let mut bootstrap = Bootstrap::new();
    bootstrap.initialize(vec![echo_descriptor(config)]).unwrap();
    assert_eq!(bootstrap.start().await, StartResult::Failed);
    bootstrap.stop().await;
}

#[tokio::test]
async fn listener_endpoints_can_be_overridden() {
    init_tracing();
    let mut config = test_config("Redirected");
    config.port = Some(6000);

    let mut bootstrap = Bootstrap::new();
    bootstrap.override_listener("Redirected", 6000, "127.0.0.1", 0);
    bootstrap.initialize(vec![echo_descriptor(config)]).unwrap();
    assert_eq!(bootstrap.start().await, StartResult::Success);

    let addr = bootstrap.server("Redirected").unwrap().listen_addrs()[0];
    assert_ne!(addr.port(), 6000);

    let mut client = TestClient::connect(addr).await.unwrap();
    client.read_line().await;
    client.send_command("ECHO moved").await;
    assert_eq!(client.read_line().await.as_deref(), Some("moved"));
    bootstrap.stop().await;
}
