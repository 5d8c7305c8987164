// src/server/connection_loop.rs

//! The per-listener accept loop: admission filtering, the connection cap,
//! the optional TLS handshake, and spawning the session task.

use super::Server;
use crate::session::handler::ConnectionHandler;
use crate::session::socket::{BoxedStream, TransportWriter, run_send_pump};
use crate::session::Session;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// How long a stopping listener waits for its connection tasks to wind down
/// before aborting them.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts connections on one listener until shutdown.
pub(crate) async fn run_listener(
    server: Arc<Server>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut connection_tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            result = listener.accept() => match result {
                Ok((socket, addr)) => {
                    accept_connection(&server, &mut connection_tasks, socket, addr, acceptor.clone());
                }
                Err(e) => {
                    error!(server = %server.name(), error = %e, "failed to accept connection");
                }
            },
            Some(finished) = connection_tasks.join_next() => {
                if let Err(e) = finished
                    && e.is_panic()
                {
                    error!(server = %server.name(), "a connection task panicked: {e:?}");
                }
            }
        }
    }

    // Sessions were told to close through the same shutdown broadcast; give
    // them a window to drain before aborting stragglers.
    let deadline = Instant::now() + CONNECTION_DRAIN_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, connection_tasks.join_next()).await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => break,
        }
    }
    connection_tasks.shutdown().await;
}

fn accept_connection(
    server: &Arc<Server>,
    connection_tasks: &mut JoinSet<()>,
    socket: TcpStream,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) {
    // Admission chain: the first denial drops the connection.
    for filter in server.connect_filters() {
        if !filter.allow_connect(addr) {
            info!(
                server = %server.name(),
                remote = %addr,
                filter = filter.name(),
                "connection denied by filter"
            );
            return;
        }
    }

    let permit = match Arc::clone(server.connection_permits()).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!(
                server = %server.name(),
                remote = %addr,
                max = server.config().max_connections,
                "connection limit reached, dropping connection"
            );
            return;
        }
    };

    if server.config().log_basic_session_activity {
        info!(server = %server.name(), remote = %addr, "accepted new connection");
    }

    let server = server.clone();
    connection_tasks.spawn(async move {
        let _permit = permit;
        let stream: BoxedStream = match acceptor {
            Some(acceptor) => match acceptor.accept(socket).await {
                Ok(tls_stream) => {
                    debug!(remote = %addr, "TLS handshake successful");
                    Box::new(tls_stream)
                }
                Err(e) => {
                    warn!(remote = %addr, error = %e, "TLS handshake failed");
                    return;
                }
            },
            None => Box::new(socket),
        };
        serve_connection(server, stream, addr).await;
    });
}

/// Builds the session for an admitted connection and runs its receive loop
/// to completion.
async fn serve_connection(server: Arc<Server>, stream: BoxedStream, addr: SocketAddr) {
    let session = Session::new(server.config(), addr);
    if !server.register_session(session.clone()) {
        return;
    }

    let framer = server.framer_factory().create_framer(&session, addr);
    let (reader, writer) = tokio::io::split(stream);
    tokio::spawn(run_send_pump(
        session.clone(),
        TransportWriter::Stream(writer),
    ));

    ConnectionHandler::new(server.clone(), session, framer, reader)
        .run(server.subscribe_shutdown())
        .await;
}
