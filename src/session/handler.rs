// src/session/handler.rs

//! Drives one connection: reads socket bytes, runs them through the framer,
//! and submits every produced request to the dispatcher. Also owns session
//! teardown, so a session is deregistered exactly once on every exit path.

use super::Session;
use super::socket::{BoxedStream, is_ignorable_socket_error};
use crate::command::dispatcher;
use crate::errors::{CloseReason, PorticoError};
use crate::protocol::Framer;
use crate::server::Server;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::broadcast;
use tokio_util::codec::Decoder;
use tracing::{debug, error, warn};

/// An RAII backstop: whatever happens to the handler task, the session leaves
/// the registry and drops its connected bit.
struct SessionGuard {
    server: Arc<Server>,
    session: Arc<Session>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.server.unregister_session(&self.session);
    }
}

pub(crate) struct ConnectionHandler {
    server: Arc<Server>,
    session: Arc<Session>,
    framer: Box<dyn Framer>,
    reader: ReadHalf<BoxedStream>,
    buffer: BytesMut,
}

impl ConnectionHandler {
    pub(crate) fn new(
        server: Arc<Server>,
        session: Arc<Session>,
        framer: Box<dyn Framer>,
        reader: ReadHalf<BoxedStream>,
    ) -> Self {
        let receive_buffer_size = server.config().receive_buffer_size;
        Self {
            server,
            session,
            framer,
            reader,
            buffer: BytesMut::with_capacity(receive_buffer_size),
        }
    }

    /// The session's receive loop. Framing and dispatch happen inline here,
    /// which is what guarantees strict per-session receive ordering.
    pub(crate) async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let guard = SessionGuard {
            server: self.server.clone(),
            session: self.session.clone(),
        };
        let mut closed_rx = self.session.socket().subscribe_close();

        self.server
            .handler()
            .on_session_connected(&self.session)
            .await;

        let receive_buffer_size = self.server.config().receive_buffer_size;
        let max_request_length = self.server.config().max_request_length;

        loop {
            // A close that raced ahead of the subscription above is only
            // visible through the state machine.
            if !self.session.socket().is_open() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    self.session.close(CloseReason::ServerShutdown);
                    break;
                }
                _ = closed_rx.recv() => {
                    break;
                }
                result = read_chunk(&mut self.reader, &mut self.buffer, receive_buffer_size) => {
                    match result {
                        Ok(0) => {
                            self.session.close(CloseReason::ClientClosing);
                            break;
                        }
                        Ok(n) => {
                            let received_at = self.buffer.len() - n;
                            let accepted = self
                                .server
                                .handler()
                                .on_raw_data(&self.session, &self.buffer[received_at..]);
                            if !accepted {
                                self.buffer.truncate(received_at);
                                continue;
                            }
                            self.session.touch();
                            if let Err(reason) = self.drain_requests(max_request_length).await {
                                self.session.close(reason);
                                break;
                            }
                        }
                        Err(e) => {
                            if is_ignorable_socket_error(&e)
                                && !self.server.config().log_all_socket_exceptions
                            {
                                debug!(session = self.session.id(), error = %e, "receive failed, peer gone");
                            } else {
                                error!(session = self.session.id(), error = %e, "receive failed");
                            }
                            self.session.close(CloseReason::SocketError);
                            break;
                        }
                    }
                }
            }
        }

        let reason = self
            .session
            .socket()
            .close_reason()
            .unwrap_or(CloseReason::Unknown);
        drop(guard);
        self.server.finish_session_close(&self.session, reason).await;
        self.session.socket().mark_closed();
    }

    /// Runs the framer over the buffered bytes until it needs more input,
    /// dispatching every complete request in order and swapping in a
    /// successor framer after a protocol upgrade.
    async fn drain_requests(&mut self, max_request_length: usize) -> Result<(), CloseReason> {
        loop {
            match self.framer.decode(&mut self.buffer) {
                Ok(Some(request)) => {
                    dispatcher::dispatch(&self.server, &self.session, request).await;
                    if let Some(next) = self.framer.take_successor() {
                        self.framer = next;
                    }
                }
                Ok(None) => {
                    if self.buffer.len() >= max_request_length {
                        let oversize = PorticoError::RequestTooLarge {
                            max: max_request_length,
                            len: self.buffer.len(),
                        };
                        warn!(session = self.session.id(), error = %oversize, "closing session");
                        return Err(CloseReason::ServerClosing);
                    }
                    return Ok(());
                }
                Err(e) => {
                    error!(session = self.session.id(), error = %e, "framing failed");
                    return Err(CloseReason::ProtocolError);
                }
            }
        }
    }
}

async fn read_chunk(
    reader: &mut ReadHalf<BoxedStream>,
    buffer: &mut BytesMut,
    receive_buffer_size: usize,
) -> std::io::Result<usize> {
    buffer.reserve(receive_buffer_size);
    reader.read_buf(buffer).await
}
