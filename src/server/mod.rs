// src/server/mod.rs

//! The server core: session registry, listener lifecycle, lookup and
//! broadcast, and the start/stop sequence.

pub mod builder;
pub mod connect_filter;
pub mod connection_loop;
pub mod handler;
pub mod udp;
pub(crate) mod worker_pool;

pub use builder::ServerBuilder;
pub use connect_filter::ConnectFilter;
pub use handler::{DefaultServerHandler, ServerHandler};

use crate::command::{CommandContainer, CommandFilter, CommandUpdate, RequestInterceptor};
use crate::config::{Security, ServerConfig, SocketMode};
use crate::errors::{CloseReason, PorticoError};
use crate::protocol::FramerFactory;
use crate::session::Session;
use crate::tasks::state::{ListenerStateRecord, ServerStateRecord};
use crate::tasks::{IdleSweeper, SnapshotBuilder};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tokio::net::{TcpListener, TcpSocket, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for sessions to finish closing before giving up.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A listener with its endpoint resolved and TLS material loaded.
pub(crate) struct BoundListener {
    pub(crate) addr: SocketAddr,
    pub(crate) backlog: u32,
    pub(crate) security: Security,
    pub(crate) acceptor: Option<tokio_rustls::TlsAcceptor>,
}

/// Server-wide counters, all lock-free.
#[derive(Debug, Default)]
pub struct ServerStats {
    total_accepted: AtomicU64,
    handled_requests: AtomicU64,
}

impl ServerStats {
    pub(crate) fn increment_total_accepted(&self) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_handled_requests(&self) {
        self.handled_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handled_requests(&self) -> u64 {
        self.handled_requests.load(Ordering::Relaxed)
    }
}

/// One server instance: a set of listeners, the session registry, the
/// published command container, and the maintenance timers.
///
/// Constructed through [`ServerBuilder`], which runs the strict setup
/// sequence; a `Server` value only exists fully initialized.
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn ServerHandler>,
    framer_factory: Arc<dyn FramerFactory>,
    connect_filters: Vec<Arc<dyn ConnectFilter>>,
    global_filters: Vec<Arc<dyn CommandFilter>>,
    request_interceptor: Option<Arc<dyn RequestInterceptor>>,
    commands: RwLock<Arc<CommandContainer>>,
    sessions: DashMap<String, Arc<Session>>,
    snapshot: RwLock<Arc<Vec<Arc<Session>>>>,
    listeners: Vec<BoundListener>,
    bound_addrs: Mutex<Vec<SocketAddr>>,
    running: AtomicBool,
    started_at: Mutex<Option<SystemTime>>,
    speed_baseline: Mutex<(SystemTime, u64)>,
    stats: ServerStats,
    connection_permits: Arc<tokio::sync::Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
    background: tokio::sync::Mutex<JoinSet<()>>,
    command_updates: tokio::sync::Mutex<Option<mpsc::Receiver<Vec<CommandUpdate>>>>,
    sweep_sentinel: Mutex<()>,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ServerConfig,
        handler: Arc<dyn ServerHandler>,
        framer_factory: Arc<dyn FramerFactory>,
        connect_filters: Vec<Arc<dyn ConnectFilter>>,
        global_filters: Vec<Arc<dyn CommandFilter>>,
        request_interceptor: Option<Arc<dyn RequestInterceptor>>,
        commands: CommandContainer,
        listeners: Vec<BoundListener>,
        command_updates: mpsc::Receiver<Vec<CommandUpdate>>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let max_connections = config.max_connections;
        Arc::new(Self {
            config,
            handler,
            framer_factory,
            connect_filters,
            global_filters,
            request_interceptor,
            commands: RwLock::new(Arc::new(commands)),
            sessions: DashMap::new(),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            listeners,
            bound_addrs: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            speed_baseline: Mutex::new((SystemTime::now(), 0)),
            stats: ServerStats::default(),
            connection_permits: Arc::new(tokio::sync::Semaphore::new(max_connections)),
            shutdown_tx,
            background: tokio::sync::Mutex::new(JoinSet::new()),
            command_updates: tokio::sync::Mutex::new(Some(command_updates)),
            sweep_sentinel: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        *self.started_at.lock()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ServerHandler> {
        &self.handler
    }

    pub(crate) fn framer_factory(&self) -> &Arc<dyn FramerFactory> {
        &self.framer_factory
    }

    pub(crate) fn connect_filters(&self) -> &[Arc<dyn ConnectFilter>] {
        &self.connect_filters
    }

    pub(crate) fn request_interceptor(&self) -> Option<&Arc<dyn RequestInterceptor>> {
        self.request_interceptor.as_ref()
    }

    pub(crate) fn connection_permits(&self) -> &Arc<tokio::sync::Semaphore> {
        &self.connection_permits
    }

    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// The current command container. Readers dereference the published
    /// `Arc` once per dispatch and never observe a half-built mapping.
    pub fn commands(&self) -> Arc<CommandContainer> {
        self.commands.read().clone()
    }

    pub(crate) fn publish_commands(&self, container: CommandContainer) {
        *self.commands.write() = Arc::new(container);
    }

    /// The endpoints actually bound after `start` (resolves port 0 binds).
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.bound_addrs.lock().clone()
    }

    /// Starts the listeners and the maintenance timers. Refuses to start a
    /// server that is already running; a bind failure leaves the server
    /// stopped with every already-acquired listener released.
    pub async fn start(self: Arc<Self>) -> Result<(), PorticoError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PorticoError::InvalidState(
                "server is already running".into(),
            ));
        }

        let mut background = self.background.lock().await;
        match Self::bind_and_spawn(&self, &mut background).await {
            Ok(bound) => {
                *self.bound_addrs.lock() = bound;
            }
            Err(e) => {
                drop(background);
                self.running.store(false, Ordering::SeqCst);
                error!(server = %self.config.name, error = %e, "failed to start");
                return Err(e);
            }
        }

        let now = SystemTime::now();
        *self.started_at.lock() = Some(now);
        *self.speed_baseline.lock() = (now, 0);

        info!(
            server = %self.config.name,
            addrs = ?self.listen_addrs(),
            "server started"
        );
        drop(background);
        self.handler.on_started(&self).await;

        let mut background = self.background.lock().await;
        if !self.config.disable_session_snapshot {
            let task = SnapshotBuilder::new(self.clone());
            let shutdown_rx = self.shutdown_tx.subscribe();
            background.spawn(async move { task.run(shutdown_rx).await });
        }

        if self.config.clear_idle_session && self.config.idle_session_timeout_secs > 0 {
            let task = IdleSweeper::new(self.clone());
            let shutdown_rx = self.shutdown_tx.subscribe();
            background.spawn(async move { task.run(shutdown_rx).await });
        }

        if let Some(updates_rx) = self.command_updates.lock().await.take() {
            let server = self.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            background.spawn(run_command_updates(server, updates_rx, shutdown_rx));
        }

        Ok(())
    }

    async fn bind_and_spawn(
        server: &Arc<Self>,
        background: &mut JoinSet<()>,
    ) -> Result<Vec<SocketAddr>, PorticoError> {
        let mut bound = Vec::with_capacity(server.listeners.len());
        match server.config.mode {
            SocketMode::Tcp => {
                let mut tcp_listeners = Vec::with_capacity(server.listeners.len());
                for listener in &server.listeners {
                    let tcp = bind_tcp(listener.addr, listener.backlog)?;
                    bound.push(tcp.local_addr()?);
                    tcp_listeners.push((tcp, listener.acceptor.clone()));
                }
                for (tcp, acceptor) in tcp_listeners {
                    background.spawn(connection_loop::run_listener(
                        server.clone(),
                        tcp,
                        acceptor,
                        server.shutdown_tx.subscribe(),
                    ));
                }
            }
            SocketMode::Udp => {
                let mut udp_sockets = Vec::with_capacity(server.listeners.len());
                for listener in &server.listeners {
                    let socket = std::net::UdpSocket::bind(listener.addr)?;
                    socket.set_nonblocking(true)?;
                    let socket = UdpSocket::from_std(socket)?;
                    bound.push(socket.local_addr()?);
                    udp_sockets.push(Arc::new(socket));
                }
                for socket in udp_sockets {
                    background.spawn(udp::run_datagram_listener(
                        server.clone(),
                        socket,
                        server.shutdown_tx.subscribe(),
                    ));
                }
            }
        }
        Ok(bound)
    }

    /// Stops accepting, closes every registered session with `ServerShutdown`,
    /// waits for them to drain, then stops the maintenance timers.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(server = %self.config.name, "server stopping");
        let _ = self.shutdown_tx.send(());

        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        futures::future::join_all(sessions.iter().map(|session| async move {
            session.close(CloseReason::ServerShutdown);
        }))
        .await;

        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while !self.sessions.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !self.sessions.is_empty() {
            warn!(
                server = %self.config.name,
                remaining = self.sessions.len(),
                "timed out waiting for sessions to close"
            );
        }

        self.background.lock().await.shutdown().await;
        info!(server = %self.config.name, "server stopped");
    }

    /// Registers a freshly accepted session under its id. A collision (which
    /// the uuid scheme makes vanishingly unlikely) rejects the session.
    pub(crate) fn register_session(&self, session: Arc<Session>) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(session.id().to_ascii_lowercase()) {
            Entry::Occupied(_) => {
                error!(
                    server = %self.config.name,
                    session = session.id(),
                    "session id collision, rejecting session"
                );
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(session);
                self.stats.increment_total_accepted();
                true
            }
        }
    }

    /// Removes a session from the registry and clears its connected bit.
    /// Idempotent; also runs from the handler's RAII guard.
    pub(crate) fn unregister_session(&self, session: &Arc<Session>) {
        self.sessions.remove(&session.id().to_ascii_lowercase());
        session.set_disconnected();
    }

    /// Fires the close notification exactly once per session, after
    /// deregistration. Orderly closes are only logged when basic session
    /// activity logging is on.
    pub(crate) async fn finish_session_close(&self, session: &Arc<Session>, reason: CloseReason) {
        if self.config.log_basic_session_activity || !reason.is_orderly() {
            info!(
                server = %self.config.name,
                session = session.id(),
                %reason,
                "session closed"
            );
        }
        self.handler.on_session_closed(session, reason).await;
    }

    /// Looks up a session by id, case-insensitively.
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(&id.to_ascii_lowercase())
            .map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// All sessions: the published snapshot when snapshots are enabled (a
    /// few seconds stale, no locking of the registry), otherwise a live walk.
    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        if self.config.disable_session_snapshot {
            self.sessions
                .iter()
                .map(|entry| entry.value().clone())
                .collect()
        } else {
            let snapshot = self.snapshot.read().clone();
            snapshot.as_ref().clone()
        }
    }

    pub fn sessions_where(&self, predicate: impl Fn(&Session) -> bool) -> Vec<Arc<Session>> {
        self.all_sessions()
            .into_iter()
            .filter(|session| predicate(session))
            .collect()
    }

    /// Try-sends one segment to every session. Full queues and disconnected
    /// sessions are skipped. Returns how many sessions accepted the segment.
    pub fn broadcast(&self, segment: Bytes) -> usize {
        let mut sent = 0;
        for session in self.all_sessions() {
            if session.try_send(segment.clone()).unwrap_or(false) {
                sent += 1;
            }
        }
        sent
    }

    /// Publishes a fresh immutable copy of the registry.
    pub(crate) fn rebuild_snapshot(&self) {
        let snapshot: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        *self.snapshot.write() = Arc::new(snapshot);
    }

    /// One idle sweep: closes every session idle past the configured timeout
    /// with `TimeOut`. If a previous sweep is still running the call is
    /// skipped rather than queued.
    pub fn sweep_idle_sessions(&self) -> usize {
        let Some(_sentinel) = self.sweep_sentinel.try_lock() else {
            debug!(server = %self.config.name, "previous idle sweep still running, skipping");
            return 0;
        };
        let timeout = Duration::from_secs(self.config.idle_session_timeout_secs);
        if timeout.is_zero() {
            return 0;
        }
        let now = SystemTime::now();
        let mut closed = 0;
        for session in self.all_sessions() {
            let idle = now
                .duration_since(session.last_active_time())
                .unwrap_or_default();
            if idle >= timeout {
                debug!(
                    session = session.id(),
                    idle_secs = idle.as_secs(),
                    "closing idle session"
                );
                session.close(CloseReason::TimeOut);
                closed += 1;
            }
        }
        if closed > 0 {
            info!(server = %self.config.name, closed, "idle sweep closed sessions");
        }
        closed
    }

    /// Produces the periodic state record. The request-handling speed covers
    /// the window since the previous collection (or since start for the
    /// first sample).
    pub fn collect_state(&self) -> ServerStateRecord {
        let now = SystemTime::now();
        let handled = self.stats.handled_requests();
        let speed = {
            let mut baseline = self.speed_baseline.lock();
            let (prev_time, prev_handled) = *baseline;
            let secs = now
                .duration_since(prev_time)
                .unwrap_or_default()
                .as_secs_f64();
            *baseline = (now, handled);
            if secs > 0.0 {
                (handled.saturating_sub(prev_handled)) as f64 / secs
            } else {
                0.0
            }
        };
        ServerStateRecord {
            collected_at: now,
            name: self.config.name.clone(),
            started_at: self.started_at(),
            is_running: self.is_running(),
            total_connections: self.session_count(),
            max_connections: self.config.max_connections,
            total_handled_requests: handled,
            requests_per_second: speed,
            listeners: self
                .listeners
                .iter()
                .map(|l| ListenerStateRecord {
                    endpoint: l.addr.to_string(),
                    backlog: l.backlog,
                    security: l.security,
                })
                .collect(),
        }
    }
}

fn bind_tcp(addr: SocketAddr, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Applies loader update batches copy-on-write and republishes the container.
async fn run_command_updates(
    server: Arc<Server>,
    mut updates_rx: mpsc::Receiver<Vec<CommandUpdate>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            batch = updates_rx.recv() => {
                let Some(updates) = batch else { return };
                let next = server.commands().with_updates(updates, &server.global_filters);
                let count = next.len();
                server.publish_commands(next);
                info!(server = %server.config.name, commands = count, "command container republished");
            }
        }
    }
}
