// src/server/builder.rs

//! The strict setup sequence that produces a [`Server`]: validate the
//! configuration, apply the process-wide worker tuning, resolve TLS, resolve
//! the listeners, discover commands, and build the command container. Any
//! failing step aborts setup and nothing half-initialized escapes.

use super::{BoundListener, ConnectFilter, DefaultServerHandler, Server, ServerHandler, worker_pool};
use crate::command::{CommandContainer, CommandFilter, CommandLoader, RequestInterceptor};
use crate::config::{CertificateConfig, Security, ServerConfig, parse_bind_ip};
use crate::errors::PorticoError;
use crate::protocol::FramerFactory;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::info;

const COMMAND_UPDATE_CHANNEL_CAPACITY: usize = 16;

pub struct ServerBuilder {
    config: ServerConfig,
    handler: Option<Arc<dyn ServerHandler>>,
    framer_factory: Option<Arc<dyn FramerFactory>>,
    connect_filters: Vec<Arc<dyn ConnectFilter>>,
    loaders: Vec<Arc<dyn CommandLoader>>,
    global_filters: Vec<Arc<dyn CommandFilter>>,
    request_interceptor: Option<Arc<dyn RequestInterceptor>>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            handler: None,
            framer_factory: None,
            connect_filters: Vec::new(),
            loaders: Vec::new(),
            global_filters: Vec::new(),
            request_interceptor: None,
        }
    }

    /// The application's lifecycle hooks. Defaults to the no-op handler.
    pub fn handler(mut self, handler: Arc<dyn ServerHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// The per-session framer factory. Required.
    pub fn framer_factory(mut self, factory: Arc<dyn FramerFactory>) -> Self {
        self.framer_factory = Some(factory);
        self
    }

    pub fn add_connect_filter(mut self, filter: Arc<dyn ConnectFilter>) -> Self {
        self.connect_filters.push(filter);
        self
    }

    pub fn add_command_loader(mut self, loader: Arc<dyn CommandLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    /// A filter applied to every command, ahead of the command's own filters.
    pub fn add_global_filter(mut self, filter: Arc<dyn CommandFilter>) -> Self {
        self.global_filters.push(filter);
        self
    }

    /// Replaces registry dispatch with a raw request handler.
    pub fn request_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.request_interceptor = Some(interceptor);
        self
    }

    /// Runs the setup sequence. The returned server is fully initialized and
    /// ready to `start`.
    pub fn build(self) -> Result<Arc<Server>, PorticoError> {
        let mut config = self.config;
        config.validate()?;

        worker_pool::configure(&config.thread_pool);

        let framer_factory = self.framer_factory.ok_or_else(|| {
            PorticoError::Setup("a framer factory is required and none was provided".into())
        })?;

        let listeners = resolve_listeners(&config)?;

        let (updates_tx, updates_rx) = mpsc::channel(COMMAND_UPDATE_CHANNEL_CAPACITY);
        for loader in &self.loaders {
            loader.attach_update_channel(updates_tx.clone());
        }
        let commands = CommandContainer::build(&self.loaders, &self.global_filters)?;
        info!(
            server = %config.name,
            commands = commands.len(),
            "command container built"
        );

        let handler = self
            .handler
            .unwrap_or_else(|| Arc::new(DefaultServerHandler));

        Ok(Server::new(
            config,
            handler,
            framer_factory,
            self.connect_filters,
            self.global_filters,
            self.request_interceptor,
            commands,
            listeners,
            updates_rx,
        ))
    }
}

fn resolve_listeners(config: &ServerConfig) -> Result<Vec<BoundListener>, PorticoError> {
    let effective = config.effective_listeners();
    if effective.is_empty() {
        return Err(PorticoError::Setup("no listeners to resolve".into()));
    }

    // One acceptor serves every secure listener; the certificate is loaded once.
    let needs_tls = effective
        .iter()
        .any(|l| l.security == Some(Security::Tls));
    let acceptor = if needs_tls {
        let certificate = config.certificate.as_ref().ok_or_else(|| {
            PorticoError::Setup("secure listener configured without a certificate".into())
        })?;
        Some(build_tls_acceptor(certificate)?)
    } else {
        None
    };

    let mut listeners = Vec::with_capacity(effective.len());
    for listener in effective {
        let security = listener.security.unwrap_or(config.security);
        let addr = SocketAddr::new(parse_bind_ip(&listener.ip)?, listener.port);
        listeners.push(BoundListener {
            addr,
            backlog: listener.backlog,
            security,
            acceptor: (security == Security::Tls).then(|| {
                acceptor
                    .clone()
                    .expect("acceptor exists when a secure listener does")
            }),
        });
    }
    Ok(listeners)
}

fn build_tls_acceptor(certificate: &CertificateConfig) -> Result<TlsAcceptor, PorticoError> {
    let cert_path = certificate
        .cert_path
        .as_deref()
        .ok_or_else(|| PorticoError::Setup("certificate cert_path is missing".into()))?;
    let key_path = certificate
        .key_path
        .as_deref()
        .ok_or_else(|| PorticoError::Setup("certificate key_path is missing".into()))?;

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| PorticoError::Setup(format!("invalid certificate material: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, PorticoError> {
    let cert_file = File::open(path)
        .map_err(|e| PorticoError::Setup(format!("failed to open certificate file '{path}': {e}")))?;
    let mut reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| PorticoError::Setup(format!("failed to parse certificates in '{path}': {e}")))?;
    if certs.is_empty() {
        return Err(PorticoError::Setup(format!(
            "no certificates found in '{path}'"
        )));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>, PorticoError> {
    let key_file = File::open(path)
        .map_err(|e| PorticoError::Setup(format!("failed to open private key file '{path}': {e}")))?;
    let mut reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| PorticoError::Setup(format!("failed to parse private key in '{path}': {e}")))?
        .ok_or_else(|| PorticoError::Setup(format!("no private key found in '{path}'")))
}
