// src/errors.rs

//! Defines the primary error type for the framework and the session close reasons.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all failures the framework can surface.
#[derive(Error, Debug)]
pub enum PorticoError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Session is not connected")]
    SessionNotConnected,

    #[error("Duplicate command name '{0}'")]
    DuplicateCommand(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request length {len} reached the limit of {max} bytes")]
    RequestTooLarge { max: usize, len: usize },

    #[error("Application error: {0}")]
    Application(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual Clone because `std::io::Error` is not cloneable; the Arc makes the
// variant cheaply shareable instead.
impl Clone for PorticoError {
    fn clone(&self) -> Self {
        match self {
            PorticoError::Io(e) => PorticoError::Io(Arc::clone(e)),
            PorticoError::Config(s) => PorticoError::Config(s.clone()),
            PorticoError::Setup(s) => PorticoError::Setup(s.clone()),
            PorticoError::InvalidState(s) => PorticoError::InvalidState(s.clone()),
            PorticoError::SessionNotConnected => PorticoError::SessionNotConnected,
            PorticoError::DuplicateCommand(s) => PorticoError::DuplicateCommand(s.clone()),
            PorticoError::Protocol(s) => PorticoError::Protocol(s.clone()),
            PorticoError::RequestTooLarge { max, len } => PorticoError::RequestTooLarge {
                max: *max,
                len: *len,
            },
            PorticoError::Application(s) => PorticoError::Application(s.clone()),
            PorticoError::Internal(s) => PorticoError::Internal(s.clone()),
        }
    }
}

impl From<std::io::Error> for PorticoError {
    fn from(e: std::io::Error) -> Self {
        PorticoError::Io(Arc::new(e))
    }
}

impl From<std::str::Utf8Error> for PorticoError {
    fn from(e: std::str::Utf8Error) -> Self {
        PorticoError::Protocol(format!("invalid UTF-8 in request: {e}"))
    }
}

/// Why a session was closed. Recorded exactly once per session; the first
/// close call wins and later calls are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No reason was recorded.
    Unknown,
    /// The server is shutting down.
    ServerShutdown,
    /// The remote endpoint closed the connection.
    ClientClosing,
    /// The server closed the connection (e.g. oversized request).
    ServerClosing,
    /// The command pipeline raised an unhandled error.
    ApplicationError,
    /// A socket read or write failed.
    SocketError,
    /// The session sat idle past the configured timeout.
    TimeOut,
    /// The framer rejected the byte stream.
    ProtocolError,
}

impl CloseReason {
    /// Reasons that describe an orderly close rather than a failure.
    pub fn is_orderly(self) -> bool {
        matches!(
            self,
            CloseReason::ClientClosing | CloseReason::ServerClosing | CloseReason::ServerShutdown
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CloseReason::Unknown => "Unknown",
            CloseReason::ServerShutdown => "ServerShutdown",
            CloseReason::ClientClosing => "ClientClosing",
            CloseReason::ServerClosing => "ServerClosing",
            CloseReason::ApplicationError => "ApplicationError",
            CloseReason::SocketError => "SocketError",
            CloseReason::TimeOut => "TimeOut",
            CloseReason::ProtocolError => "ProtocolError",
        };
        f.write_str(name)
    }
}
