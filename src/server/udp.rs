// src/server/udp.rs

//! The datagram engine. One bound socket serves every peer; sessions are
//! keyed by remote address, admitted through the same filter chain and
//! connection cap as stream sessions, and each peer's datagrams run through
//! that peer's own framer in arrival order.

use super::Server;
use crate::command::dispatcher;
use crate::errors::CloseReason;
use crate::protocol::Framer;
use crate::session::Session;
use crate::session::socket::{TransportWriter, run_send_pump};
use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::broadcast;
use tokio_util::codec::Decoder;
use tracing::{error, info, warn};

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

struct PeerState {
    session: Arc<Session>,
    framer: Box<dyn Framer>,
    buffer: BytesMut,
}

/// Receives datagrams until shutdown. Peers are processed sequentially on
/// this task, which is what keeps per-session ordering strict.
pub(crate) async fn run_datagram_listener(
    server: Arc<Server>,
    socket: Arc<UdpSocket>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut peers: HashMap<SocketAddr, PeerState> = HashMap::new();
    let mut datagram = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            result = socket.recv_from(&mut datagram) => match result {
                Ok((len, peer)) => {
                    handle_datagram(&server, &socket, &mut peers, &datagram[..len], peer).await;
                }
                Err(e) => {
                    error!(server = %server.name(), error = %e, "datagram receive failed");
                }
            }
        }
    }
}

async fn handle_datagram(
    server: &Arc<Server>,
    socket: &Arc<UdpSocket>,
    peers: &mut HashMap<SocketAddr, PeerState>,
    data: &[u8],
    peer: SocketAddr,
) {
    // Reap an entry whose session closed since the last datagram from this peer.
    let stale = peers
        .get(&peer)
        .is_some_and(|state| !state.session.socket().is_open());
    if stale {
        peers.remove(&peer);
    }

    if !peers.contains_key(&peer) {
        let Some(state) = admit_peer(server, socket, peer).await else {
            return;
        };
        peers.insert(peer, state);
    }

    let state = peers
        .get_mut(&peer)
        .expect("peer state exists after admission");

    if !server.handler().on_raw_data(&state.session, data) {
        return;
    }
    state.session.touch();
    state.buffer.extend_from_slice(data);

    loop {
        match state.framer.decode(&mut state.buffer) {
            Ok(Some(request)) => {
                dispatcher::dispatch(server, &state.session, request).await;
                if let Some(next) = state.framer.take_successor() {
                    state.framer = next;
                }
            }
            Ok(None) => {
                if state.buffer.len() >= server.config().max_request_length {
                    let oversize = crate::errors::PorticoError::RequestTooLarge {
                        max: server.config().max_request_length,
                        len: state.buffer.len(),
                    };
                    warn!(session = state.session.id(), error = %oversize, "closing session");
                    state.session.close(CloseReason::ServerClosing);
                    peers.remove(&peer);
                }
                return;
            }
            Err(e) => {
                error!(session = state.session.id(), error = %e, "framing failed");
                state.session.close(CloseReason::ProtocolError);
                peers.remove(&peer);
                return;
            }
        }
    }
}

/// Runs admission for a first-seen peer: the connect-filter chain, then the
/// connection cap, then session registration and pump/watcher spawn.
async fn admit_peer(
    server: &Arc<Server>,
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
) -> Option<PeerState> {
    for filter in server.connect_filters() {
        if !filter.allow_connect(peer) {
            info!(
                server = %server.name(),
                remote = %peer,
                filter = filter.name(),
                "datagram peer denied by filter"
            );
            return None;
        }
    }

    let permit = match Arc::clone(server.connection_permits()).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!(
                server = %server.name(),
                remote = %peer,
                max = server.config().max_connections,
                "connection limit reached, dropping datagram peer"
            );
            return None;
        }
    };

    let session = Session::new(server.config(), peer);
    if !server.register_session(session.clone()) {
        return None;
    }
    if server.config().log_basic_session_activity {
        info!(server = %server.name(), remote = %peer, "accepted new datagram peer");
    }

    tokio::spawn(run_send_pump(
        session.clone(),
        TransportWriter::Datagram {
            socket: socket.clone(),
            peer,
        },
    ));
    tokio::spawn(watch_session_close(server.clone(), session.clone(), permit));

    server.handler().on_session_connected(&session).await;

    let framer = server.framer_factory().create_framer(&session, peer);
    Some(PeerState {
        session,
        framer,
        buffer: BytesMut::new(),
    })
}

/// Performs the teardown a stream session gets from its handler task: on
/// close, deregister, fire the closed callback once, and free the
/// connection permit.
async fn watch_session_close(
    server: Arc<Server>,
    session: Arc<Session>,
    permit: OwnedSemaphorePermit,
) {
    let mut closed_rx = session.socket().subscribe_close();
    if session.socket().is_open() {
        let _ = closed_rx.recv().await;
    }
    let reason = session
        .socket()
        .close_reason()
        .unwrap_or(CloseReason::Unknown);
    server.unregister_session(&session);
    server.finish_session_close(&session, reason).await;
    session.socket().mark_closed();
    drop(permit);
}
