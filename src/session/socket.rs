// src/session/socket.rs

//! The socket-facing half of a session: close-state machine and the send
//! pump that drains the send queue to the wire.

use super::Session;
use super::send_queue::SendQueue;
use crate::errors::CloseReason;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error};

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// A byte stream a session can run over. Blanket-implemented, so plain TCP
/// and TLS-wrapped streams both qualify; the session machinery holds them
/// boxed and never learns which it got.
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionStream for T {}

/// The erased stream type the receive loop and send pump operate on.
pub type BoxedStream = Box<dyn SessionStream>;

/// Where the send pump writes: a stream write-half, or a shared datagram
/// socket addressed at the session's peer.
pub(crate) enum TransportWriter {
    Stream(WriteHalf<BoxedStream>),
    Datagram {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

/// Owns the per-session socket state: the send queue, the forward-only close
/// state machine, and the close reason recorded exactly once.
pub struct SocketSession {
    pub(crate) queue: SendQueue,
    close_state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    closed_tx: broadcast::Sender<()>,
    sync_send: bool,
    log_all_socket_exceptions: bool,
}

impl SocketSession {
    pub(crate) fn new(
        queue_capacity: usize,
        sync_send: bool,
        log_all_socket_exceptions: bool,
    ) -> Self {
        let (closed_tx, _) = broadcast::channel(1);
        Self {
            queue: SendQueue::new(queue_capacity),
            close_state: AtomicU8::new(STATE_OPEN),
            close_reason: OnceLock::new(),
            closed_tx,
            sync_send,
            log_all_socket_exceptions,
        }
    }

    pub fn is_open(&self) -> bool {
        self.close_state.load(Ordering::Acquire) == STATE_OPEN
    }

    /// The recorded close reason, once a close has begun.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Moves `Open -> Closing` and records the reason. Only the first caller
    /// wins; later calls are no-ops and return `false`.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        if self
            .close_state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.close_reason.set(reason);
        let _ = self.closed_tx.send(());
        true
    }

    /// Moves `Closing -> Closed` once teardown finished. Forward-only.
    pub(crate) fn mark_closed(&self) {
        self.close_state.store(STATE_CLOSED, Ordering::Release);
    }

    pub(crate) fn subscribe_close(&self) -> broadcast::Receiver<()> {
        self.closed_tx.subscribe()
    }
}

/// Drains the session's send queue to the transport until the session closes.
///
/// The pump is the queue's single consumer. After a close is observed it
/// drains whatever is already queued, then shuts the write side down.
pub(crate) async fn run_send_pump(session: Arc<Session>, mut writer: TransportWriter) {
    let socket = session.socket();
    let mut closed_rx = socket.subscribe_close();
    let mut batch: Vec<bytes::Bytes> = Vec::with_capacity(socket.queue.capacity());

    loop {
        batch.clear();
        if socket.queue.try_dequeue(&mut batch) {
            if let Err(e) = write_batch(&mut writer, &batch, socket.sync_send).await {
                handle_write_error(&session, &e, socket.log_all_socket_exceptions);
                break;
            }
            continue;
        }

        if !socket.is_open() {
            break;
        }

        tokio::select! {
            _ = socket.queue.ready() => {}
            _ = closed_rx.recv() => {
                // Final drain of anything enqueued before the close won.
                batch.clear();
                while socket.queue.try_dequeue(&mut batch) {
                    if write_batch(&mut writer, &batch, socket.sync_send).await.is_err() {
                        break;
                    }
                    batch.clear();
                }
                break;
            }
        }
    }

    if let TransportWriter::Stream(w) = &mut writer {
        let _ = w.shutdown().await;
    }
}

async fn write_batch(
    writer: &mut TransportWriter,
    batch: &[bytes::Bytes],
    sync_send: bool,
) -> std::io::Result<()> {
    match writer {
        TransportWriter::Stream(w) => {
            if sync_send {
                for segment in batch {
                    w.write_all(segment).await?;
                }
            } else {
                write_vectored_all(w, batch).await?;
            }
            w.flush().await
        }
        TransportWriter::Datagram { socket, peer } => {
            for segment in batch {
                socket.send_to(segment, *peer).await?;
            }
            Ok(())
        }
    }
}

/// Scatter-gather write of a whole batch, resubmitting while residue remains.
async fn write_vectored_all(
    w: &mut WriteHalf<BoxedStream>,
    batch: &[bytes::Bytes],
) -> std::io::Result<()> {
    use bytes::Buf;

    // Zero-length segments would make a successful writev look like a
    // write-zero failure; they carry no bytes, so skip them.
    let mut pending: std::collections::VecDeque<bytes::Bytes> =
        batch.iter().filter(|b| !b.is_empty()).cloned().collect();
    while !pending.is_empty() {
        let mut written = {
            let slices: Vec<IoSlice<'_>> = pending.iter().map(|b| IoSlice::new(b)).collect();
            w.write_vectored(&slices).await?
        };
        if written == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        while written > 0 {
            let front = pending
                .front_mut()
                .expect("written bytes imply a pending segment");
            if front.len() <= written {
                written -= front.len();
                pending.pop_front();
            } else {
                front.advance(written);
                written = 0;
            }
        }
    }
    Ok(())
}

/// Errors that mean the peer went away mid-write; closed without noise unless
/// the server is configured to log every socket exception.
pub(crate) fn is_ignorable_socket_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof
    )
}

fn handle_write_error(session: &Arc<Session>, e: &std::io::Error, log_all: bool) {
    if is_ignorable_socket_error(e) && !log_all {
        debug!(session = session.id(), error = %e, "send failed, peer gone");
    } else {
        error!(session = session.id(), error = %e, "send failed");
    }
    session.close(CloseReason::SocketError);
}
