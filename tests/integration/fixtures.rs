// tests/integration/fixtures.rs

//! Shared fixtures: an echo application, a tracking lifecycle handler, and a
//! line-oriented test client.

use async_trait::async_trait;
use parking_lot::Mutex;
use portico::command::{Command, CommandFilter, FilterContext, StaticCommandLoader};
use portico::config::ServerConfig;
use portico::errors::{CloseReason, PorticoError};
use portico::protocol::{CommandLineFramer, Framer, Request};
use portico::server::{Server, ServerBuilder, ServerHandler};
use portico::session::Session;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init();
}

/// Replies with the request body.
pub struct EchoCommand;

#[async_trait]
impl Command for EchoCommand {
    fn name(&self) -> &str {
        "ECHO"
    }

    async fn execute(&self, session: &Arc<Session>, request: &Request) -> Result<(), PorticoError> {
        session.send_line(&request.body_text()).await
    }
}

/// Fails on purpose, to drive the application-error close path.
pub struct FaultyCommand;

#[async_trait]
impl Command for FaultyCommand {
    fn name(&self) -> &str {
        "BOOM"
    }

    async fn execute(&self, _session: &Arc<Session>, _request: &Request) -> Result<(), PorticoError> {
        Err(PorticoError::Application("boom".into()))
    }
}

/// Cancels dispatch when the first parameter is `block`.
pub struct CancelFilter;

#[async_trait]
impl CommandFilter for CancelFilter {
    fn name(&self) -> &str {
        "cancel-on-block"
    }

    async fn on_executing(&self, ctx: &mut FilterContext<'_>) {
        if ctx.request.parameter(0) == Some("block") {
            ctx.cancel = true;
        }
    }

    async fn on_executed(&self, _ctx: &mut FilterContext<'_>) {}
}

/// Sends a welcome line on connect and records every close.
#[derive(Default)]
pub struct TrackingHandler {
    pub connected_count: AtomicUsize,
    pub closed: Mutex<Vec<(String, CloseReason)>>,
}

#[async_trait]
impl ServerHandler for TrackingHandler {
    async fn on_session_connected(&self, session: &Arc<Session>) {
        self.connected_count.fetch_add(1, Ordering::SeqCst);
        let _ = session
            .send_line(&format!("Welcome to {}", session.server_name()))
            .await;
    }

    async fn on_session_closed(&self, session: &Arc<Session>, reason: CloseReason) {
        self.closed.lock().push((session.id().to_string(), reason));
    }
}

impl TrackingHandler {
    pub fn closed_reasons(&self) -> Vec<CloseReason> {
        self.closed.lock().iter().map(|(_, r)| *r).collect()
    }
}

pub fn test_config(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        ip: Some("127.0.0.1".to_string()),
        port: Some(0),
        ..ServerConfig::default()
    }
}

pub fn command_line_factory() -> Arc<dyn portico::protocol::FramerFactory> {
    Arc::new(|_addr: SocketAddr| Box::new(CommandLineFramer::new()) as Box<dyn Framer>)
}

pub fn echo_builder(config: ServerConfig, handler: Arc<TrackingHandler>) -> ServerBuilder {
    ServerBuilder::new(config)
        .handler(handler)
        .framer_factory(command_line_factory())
        .add_command_loader(Arc::new(StaticCommandLoader::new(vec![
            Arc::new(EchoCommand) as Arc<dyn Command>,
            Arc::new(FaultyCommand) as Arc<dyn Command>,
        ])))
}

/// Builds and starts an echo server, returning it with its bound address.
pub async fn start_echo_server(
    config: ServerConfig,
) -> (Arc<Server>, Arc<TrackingHandler>, SocketAddr) {
    init_tracing();
    let handler = Arc::new(TrackingHandler::default());
    let server = echo_builder(config, handler.clone()).build().unwrap();
    server.clone().start().await.unwrap();
    let addr = server.listen_addrs()[0];
    (server, handler, addr)
}

/// A line-oriented client for the scenario tests.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        self.writer.write_all(data).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn send_command(&mut self, line: &str) {
        self.send_raw(format!("{line}\r\n").as_bytes()).await;
    }

    /// Reads one CRLF-terminated line, stripped. `None` on EOF or timeout.
    pub async fn read_line(&mut self) -> Option<String> {
        self.read_line_within(Duration::from_secs(5)).await
    }

    pub async fn read_line_within(&mut self, wait: Duration) -> Option<String> {
        let mut line = String::new();
        match timeout(wait, self.reader.read_line(&mut line)).await {
            Ok(Ok(0)) => None,
            Ok(Ok(_)) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
            _ => None,
        }
    }
}

/// Polls until `predicate` holds or the deadline passes.
pub async fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}
