// src/tasks/idle_sweep.rs

//! The idle-session sweeper.

use crate::server::Server;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Periodically closes sessions that sat idle past the configured timeout.
/// A tick that finds the previous sweep still running is skipped, so sweeps
/// never back up.
pub struct IdleSweeper {
    server: Arc<Server>,
}

impl IdleSweeper {
    pub(crate) fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    pub(crate) async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = Duration::from_secs(
            self.server
                .config()
                .clear_idle_session_interval_secs
                .max(1),
        );
        let mut interval = tokio::time::interval(period);
        // The first tick of a tokio interval fires immediately; skip it so a
        // freshly started server does not sweep at once.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.server.sweep_idle_sessions();
                }
                _ = shutdown_rx.recv() => {
                    info!(server = %self.server.name(), "idle sweeper shutting down");
                    return;
                }
            }
        }
    }
}
