// src/tasks/snapshot.rs

//! The session snapshot builder.

use crate::server::Server;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// Periodically copies the session registry into an immutable array published
/// by an atomic reference swap. Read-only consumers (idle sweep, enumeration,
/// stats) trade seconds-scale staleness for never locking the registry.
pub struct SnapshotBuilder {
    server: Arc<Server>,
}

impl SnapshotBuilder {
    pub(crate) fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    pub(crate) async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = Duration::from_secs(
            self.server
                .config()
                .session_snapshot_interval_secs
                .max(crate::config::MIN_SNAPSHOT_INTERVAL_SECS),
        );
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.server.rebuild_snapshot();
                }
                _ = shutdown_rx.recv() => {
                    info!(server = %self.server.name(), "snapshot builder shutting down");
                    return;
                }
            }
        }
    }
}
