// src/bootstrap.rs

//! Composes one or more servers, wires their factories, and starts and stops
//! them together.

use crate::config::ServerConfig;
use crate::errors::PorticoError;
use crate::server::{Server, ServerBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// The aggregate outcome of starting every configured server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartResult {
    /// No servers are configured.
    None,
    /// Every server started.
    Success,
    /// Some servers started, some failed.
    PartialSuccess,
    /// No server started.
    Failed,
}

/// Describes one server to set up: its configuration plus the factory that
/// attaches the application's framer, handlers, and commands to the builder.
pub struct ServerDescriptor {
    config: ServerConfig,
    factory: Box<dyn FnOnce(ServerBuilder) -> Result<Arc<Server>, PorticoError> + Send>,
}

impl ServerDescriptor {
    pub fn new(
        config: ServerConfig,
        factory: impl FnOnce(ServerBuilder) -> Result<Arc<Server>, PorticoError> + Send + 'static,
    ) -> Self {
        Self {
            config,
            factory: Box::new(factory),
        }
    }
}

/// The composition root. Servers are created by `initialize`, started and
/// stopped as a group, and observed by one shared performance monitor.
#[derive(Default)]
pub struct Bootstrap {
    servers: Vec<Arc<Server>>,
    /// `(server name, configured port)` replaced by a new `(ip, port)` at
    /// initialization; used to redirect configured endpoints per environment.
    endpoint_overrides: HashMap<(String, u16), (String, u16)>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirects a configured listener endpoint of `server_name` at startup.
    pub fn override_listener(
        &mut self,
        server_name: impl Into<String>,
        configured_port: u16,
        ip: impl Into<String>,
        port: u16,
    ) {
        self.endpoint_overrides.insert(
            (server_name.into(), configured_port),
            (ip.into(), port),
        );
    }

    /// Creates every described server through its factory, applying endpoint
    /// overrides first. Any factory failure aborts initialization.
    pub fn initialize(
        &mut self,
        descriptors: Vec<ServerDescriptor>,
    ) -> Result<(), PorticoError> {
        for descriptor in descriptors {
            let mut config = descriptor.config;
            self.apply_endpoint_overrides(&mut config);
            let builder = ServerBuilder::new(config);
            let server = (descriptor.factory)(builder)?;
            info!(server = server.name(), "server initialized");
            self.servers.push(server);
        }
        Ok(())
    }

    fn apply_endpoint_overrides(&self, config: &mut ServerConfig) {
        if let Some(port) = config.port
            && let Some((new_ip, new_port)) =
                self.endpoint_overrides.get(&(config.name.clone(), port))
        {
            info!(
                server = %config.name,
                from = port,
                to = new_port,
                "listener endpoint overridden"
            );
            config.ip = Some(new_ip.clone());
            config.port = Some(*new_port);
        }
        for listener in &mut config.listeners {
            if let Some((new_ip, new_port)) = self
                .endpoint_overrides
                .get(&(config.name.clone(), listener.port))
            {
                info!(
                    server = %config.name,
                    from = listener.port,
                    to = new_port,
                    "listener endpoint overridden"
                );
                listener.ip = new_ip.clone();
                listener.port = *new_port;
            }
        }
    }

    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    pub fn server(&self, name: &str) -> Option<&Arc<Server>> {
        self.servers.iter().find(|s| s.name() == name)
    }

    /// Starts every initialized server, then the performance monitor.
    pub async fn start(&mut self) -> StartResult {
        if self.servers.is_empty() {
            warn!("bootstrap has no servers to start");
            return StartResult::None;
        }

        let mut started = 0usize;
        for server in &self.servers {
            match server.clone().start().await {
                Ok(()) => started += 1,
                Err(e) => {
                    error!(server = server.name(), error = %e, "server failed to start");
                }
            }
        }

        if started > 0 {
            self.spawn_performance_monitor();
        }

        if started == self.servers.len() {
            StartResult::Success
        } else if started > 0 {
            StartResult::PartialSuccess
        } else {
            StartResult::Failed
        }
    }

    /// Stops every running server and the performance monitor.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        for server in &self.servers {
            if server.is_running() {
                server.stop().await;
            }
        }
        info!("bootstrap stopped");
    }

    /// One monitor serves all servers, ticking at the shortest configured
    /// collection interval and logging each server's state record.
    fn spawn_performance_monitor(&mut self) {
        let interval_secs = self
            .servers
            .iter()
            .map(|s| s.config().performance_collect_interval_secs)
            .filter(|&secs| secs > 0)
            .min();
        let Some(interval_secs) = interval_secs else {
            return;
        };

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        let servers = self.servers.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for server in &servers {
                            if !server.is_running() {
                                continue;
                            }
                            let state = server.collect_state();
                            info!(
                                server = %state.name,
                                sessions = state.total_connections,
                                handled = state.total_handled_requests,
                                speed = format!("{:.2}/s", state.requests_per_second),
                                "server state collected"
                            );
                        }
                    }
                    _ = shutdown_rx.recv() => return,
                }
            }
        });
    }
}
