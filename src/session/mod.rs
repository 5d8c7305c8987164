// src/session/mod.rs

//! The application-visible session: identity, activity timestamps, the user
//! item map, and the send API.

pub mod handler;
pub mod send_queue;
pub mod socket;

pub use send_queue::SendQueue;
pub use socket::{BoxedStream, SessionStream, SocketSession};

use crate::config::{ServerConfig, SocketMode};
use crate::errors::{CloseReason, PorticoError};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Upper bound on entries in a session's user item map.
pub const MAX_SESSION_ITEMS: usize = 10;

/// Ceiling for the blocking-send backoff between enqueue attempts.
const SEND_BACKOFF_CAP: Duration = Duration::from_millis(50);

/// One client session.
///
/// Created by the server at accept time, registered under a server-unique,
/// case-insensitive id, and destroyed when the underlying socket closes.
/// While registered the connected bit is `true`; the last-active time only
/// moves forward (it advances on every receive and every successful enqueue).
pub struct Session {
    id: String,
    server_name: String,
    remote_addr: SocketAddr,
    start_time: SystemTime,
    last_active_ms: AtomicI64,
    connected: AtomicBool,
    current_command: Mutex<Option<String>>,
    previous_command: Mutex<Option<String>>,
    items: DashMap<String, serde_json::Value>,
    socket: SocketSession,
    datagram: bool,
}

impl Session {
    pub(crate) fn new(config: &ServerConfig, remote_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            server_name: config.name.clone(),
            remote_addr,
            start_time: SystemTime::now(),
            last_active_ms: AtomicI64::new(now_ms()),
            connected: AtomicBool::new(true),
            current_command: Mutex::new(None),
            previous_command: Mutex::new(None),
            items: DashMap::new(),
            socket: SocketSession::new(
                config.sending_queue_size,
                config.sync_send,
                config.log_all_socket_exceptions,
            ),
            datagram: config.mode == SocketMode::Udp,
        })
    }

    /// The server-unique session id (lowercase UUID; compared case-insensitively).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The name of the server this session belongs to.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Advances the last-active time to now. Monotone: a stale clock reading
    /// never moves the timestamp backwards.
    pub(crate) fn touch(&self) {
        self.last_active_ms.fetch_max(now_ms(), Ordering::AcqRel);
    }

    pub fn last_active_time(&self) -> SystemTime {
        let ms = self.last_active_ms.load(Ordering::Acquire);
        UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
    }

    /// The command currently being dispatched on this session, if any.
    pub fn current_command(&self) -> Option<String> {
        self.current_command.lock().clone()
    }

    /// The last command that completed on this session.
    pub fn previous_command(&self) -> Option<String> {
        self.previous_command.lock().clone()
    }

    pub(crate) fn set_current_command(&self, key: &str) {
        *self.current_command.lock() = Some(key.to_string());
    }

    pub(crate) fn set_previous_command(&self, key: &str) {
        *self.previous_command.lock() = Some(key.to_string());
    }

    /// Stores a user item. Fails once the map holds [`MAX_SESSION_ITEMS`]
    /// entries, unless the key already exists.
    pub fn set_item(&self, key: impl Into<String>, value: serde_json::Value) -> bool {
        let key = key.into();
        if self.items.len() >= MAX_SESSION_ITEMS && !self.items.contains_key(&key) {
            return false;
        }
        self.items.insert(key, value);
        true
    }

    pub fn item(&self, key: &str) -> Option<serde_json::Value> {
        self.items.get(key).map(|v| v.clone())
    }

    pub fn remove_item(&self, key: &str) -> Option<serde_json::Value> {
        self.items.remove(key).map(|(_, v)| v)
    }

    pub(crate) fn socket(&self) -> &SocketSession {
        &self.socket
    }

    /// Enqueues one segment without blocking. `Ok(false)` means the queue is
    /// full; a disconnected session fails outright.
    pub fn try_send(&self, segment: Bytes) -> Result<bool, PorticoError> {
        if !self.connected() || !self.socket.is_open() {
            return Err(PorticoError::SessionNotConnected);
        }
        if self.socket.queue.enqueue(segment) {
            self.touch();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Enqueues a list of segments atomically; the segments stay contiguous
    /// in the outbound byte order.
    pub fn try_send_all(&self, segments: Vec<Bytes>) -> Result<bool, PorticoError> {
        if !self.connected() || !self.socket.is_open() {
            return Err(PorticoError::SessionNotConnected);
        }
        if self.socket.queue.enqueue_all(segments) {
            self.touch();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Enqueues one segment, waiting out queue backpressure with a capped
    /// exponential backoff. Returns silently once the session disconnects.
    pub async fn send(&self, segment: Bytes) -> Result<(), PorticoError> {
        let mut delay = Duration::from_micros(50);
        loop {
            match self.try_send(segment.clone()) {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(SEND_BACKOFF_CAP);
                }
                Err(PorticoError::SessionNotConnected) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends a string as UTF-8 bytes.
    pub async fn send_text(&self, text: &str) -> Result<(), PorticoError> {
        self.send(Bytes::copy_from_slice(text.as_bytes())).await
    }

    /// Sends a string followed by CRLF. Datagram sessions never get the line
    /// terminator appended.
    pub async fn send_line(&self, text: &str) -> Result<(), PorticoError> {
        if self.datagram {
            return self.send_text(text).await;
        }
        let mut data = Vec::with_capacity(text.len() + 2);
        data.extend_from_slice(text.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.send(Bytes::from(data)).await
    }

    /// Begins closing the session. Idempotent: the first caller's reason is
    /// recorded, later calls are no-ops. The actual teardown (deregistration,
    /// the closed callback) happens on the session's own task.
    pub fn close(&self, reason: CloseReason) {
        self.socket.begin_close(reason);
    }

    /// The reason recorded by the close call that won, once closing began.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.socket.close_reason()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("connected", &self.connected())
            .finish()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
