// src/server/handler.rs

//! The lifecycle hook surface an application plugs into a server.

use super::Server;
use crate::errors::{CloseReason, PorticoError};
use crate::protocol::Request;
use crate::session::Session;
use async_trait::async_trait;
use std::sync::Arc;

/// Application hooks around the server and session lifecycle. Every method
/// has a usable default, so implementors only override the events they care
/// about.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// Runs once after the server started listening.
    async fn on_started(&self, _server: &Arc<Server>) {}

    /// Runs on the new session's own task, after registration succeeded.
    async fn on_session_connected(&self, _session: &Arc<Session>) {}

    /// Runs exactly once per session, with the first recorded close reason.
    /// The session is already out of the registry when this fires.
    async fn on_session_closed(&self, _session: &Arc<Session>, _reason: CloseReason) {}

    /// Inspects raw received bytes before framing. Returning `false` discards
    /// the chunk.
    fn on_raw_data(&self, _session: &Arc<Session>, _data: &[u8]) -> bool {
        true
    }

    /// Runs for requests whose key matches no registered command. The default
    /// sends a text reply naming the unknown key.
    async fn on_unknown_request(&self, session: &Arc<Session>, request: &Request) {
        let _ = session
            .send_line(&format!("Unknown request: {}", request.key()))
            .await;
    }

    /// Observes an error on the session's dispatch path, just before the
    /// framework logs it and closes the session.
    async fn on_error(&self, _session: &Arc<Session>, _error: &PorticoError) {}
}

/// The no-op handler for servers that need no lifecycle hooks.
pub struct DefaultServerHandler;

#[async_trait]
impl ServerHandler for DefaultServerHandler {}
