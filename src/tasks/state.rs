// src/tasks/state.rs

//! Periodic server state collection.

use crate::config::Security;
use serde::Serialize;
use std::time::SystemTime;

/// One point-in-time reading of a server, produced by
/// [`Server::collect_state`](crate::server::Server::collect_state) and
/// reported by the bootstrap's performance monitor.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStateRecord {
    pub collected_at: SystemTime,
    pub name: String,
    pub started_at: Option<SystemTime>,
    pub is_running: bool,
    /// Currently registered sessions.
    pub total_connections: usize,
    pub max_connections: usize,
    pub total_handled_requests: u64,
    /// Requests handled per second since the previous collection; the first
    /// sample is baselined at server start.
    pub requests_per_second: f64,
    pub listeners: Vec<ListenerStateRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerStateRecord {
    pub endpoint: String,
    pub backlog: u32,
    pub security: Security,
}
