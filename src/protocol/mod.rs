// src/protocol/mod.rs

//! The receive pipeline's parsing layer: the [`Request`] type produced by
//! framers, the [`Framer`] trait itself, and the per-session factory.

pub mod begin_end;
pub mod command_line;
pub mod fixed_header;
pub mod fixed_size;
pub mod terminator;

pub use begin_end::BeginEndMarkFramer;
pub use command_line::CommandLineFramer;
pub use fixed_header::FixedHeaderFramer;
pub use fixed_size::FixedSizeFramer;
pub use terminator::TerminatorFramer;

use crate::errors::PorticoError;
use crate::session::Session;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::codec::Decoder;

/// One parsed application request.
///
/// `key` routes the request to a command handler (matched case-insensitively);
/// `parameters` and `body` carry whatever the framer extracted. Binary framers
/// typically leave the key empty and put the whole frame in `body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    key: String,
    parameters: Vec<String>,
    body: Bytes,
}

impl Request {
    pub fn new(key: impl Into<String>, parameters: Vec<String>, body: Bytes) -> Self {
        Self {
            key: key.into(),
            parameters,
            body,
        }
    }

    /// A request with no key: the whole frame is the body.
    pub fn raw(body: Bytes) -> Self {
        Self {
            key: String::new(),
            parameters: Vec::new(),
            body,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn parameter(&self, index: usize) -> Option<&str> {
        self.parameters.get(index).map(String::as_str)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body decoded as UTF-8, lossily.
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Maps a complete frame's payload to a [`Request`].
pub type FrameMapper = Box<dyn Fn(Bytes) -> Result<Request, PorticoError> + Send + Sync>;

/// An incremental, stateful stream-to-request parser.
///
/// A framer is a [`Decoder`] over the session's receive buffer: `decode`
/// either consumes exactly one complete frame and returns the parsed request,
/// or consumes nothing and returns `Ok(None)`, leaving the partial bytes in
/// the buffer until the next receive. The session measures those retained
/// bytes against the configured maximum request length.
pub trait Framer: Decoder<Item = Request, Error = PorticoError> + Send {
    /// After a protocol upgrade, the framer that replaces this one. Called by
    /// the receive loop after every produced request; buffered residue is
    /// handed to the successor untouched.
    fn take_successor(&mut self) -> Option<Box<dyn Framer>> {
        None
    }
}

/// Creates one framer per new session.
pub trait FramerFactory: Send + Sync {
    fn create_framer(&self, session: &Arc<Session>, remote_addr: SocketAddr) -> Box<dyn Framer>;
}

/// Factories that only care about the remote endpoint can be plain closures.
impl<F> FramerFactory for F
where
    F: Fn(SocketAddr) -> Box<dyn Framer> + Send + Sync,
{
    fn create_framer(&self, _session: &Arc<Session>, remote_addr: SocketAddr) -> Box<dyn Framer> {
        self(remote_addr)
    }
}
