// src/server/connect_filter.rs

//! Pre-accept admission: an ordered filter chain consulted before a remote
//! endpoint becomes a session.

use std::net::SocketAddr;

/// Answers whether a remote endpoint may connect. Filters run in the order
/// they were added; the first denial drops the connection.
pub trait ConnectFilter: Send + Sync {
    fn name(&self) -> &str;

    fn allow_connect(&self, remote_addr: SocketAddr) -> bool;
}
