// src/config.rs

//! Server configuration: loading, validation, and clamping of out-of-range values.

use crate::errors::PorticoError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::warn;

/// Lower bound for the per-session sending queue capacity, in segments.
pub const MIN_SENDING_QUEUE_SIZE: usize = 3;

/// Lower bound for the session snapshot interval, in seconds.
pub const MIN_SNAPSHOT_INTERVAL_SECS: u64 = 1;

/// The socket mode a server runs in.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SocketMode {
    /// Stream sockets (TCP).
    #[default]
    Tcp,
    /// Datagram sockets (UDP).
    Udp,
}

/// Transport security for a listener.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
}

/// One listening endpoint of a server.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListenerConfig {
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// When absent, the server-level `security` applies.
    #[serde(default)]
    pub security: Option<Security>,
}

fn default_backlog() -> u32 {
    128
}

/// TLS certificate material for secure listeners.
///
/// Only PEM file paths are supported; certificate-store thumbprints are a
/// platform-specific lookup this framework does not perform.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CertificateConfig {
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub thumbprint: Option<String>,
    #[serde(default)]
    pub store_name: Option<String>,
}

/// Process-wide worker tuning, applied once by the first server that sets up.
/// Negative values mean "leave the default".
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct ThreadPoolConfig {
    #[serde(default = "default_thread_setting")]
    pub max_working_threads: i32,
    #[serde(default = "default_thread_setting")]
    pub min_working_threads: i32,
    #[serde(default = "default_thread_setting")]
    pub max_completion_port_threads: i32,
    #[serde(default = "default_thread_setting")]
    pub min_completion_port_threads: i32,
}

fn default_thread_setting() -> i32 {
    -1
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            max_working_threads: -1,
            min_working_threads: -1,
            max_completion_port_threads: -1,
            min_completion_port_threads: -1,
        }
    }
}

/// The immutable per-server configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Server-level bind address. Mutually exclusive with `listeners`.
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub mode: SocketMode,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    /// Capacity of the per-session send queue, in segments. Clamped up to
    /// [`MIN_SENDING_QUEUE_SIZE`].
    #[serde(default = "default_sending_queue_size")]
    pub sending_queue_size: usize,
    /// A session accumulating this many unparsed bytes is closed.
    #[serde(default = "default_max_request_length")]
    pub max_request_length: usize,
    #[serde(default)]
    pub clear_idle_session: bool,
    /// Idle timeout in seconds; 0 disables the sweep even when
    /// `clear_idle_session` is set.
    #[serde(default = "default_idle_session_timeout")]
    pub idle_session_timeout_secs: u64,
    #[serde(default = "default_clear_idle_session_interval")]
    pub clear_idle_session_interval_secs: u64,
    #[serde(default)]
    pub disable_session_snapshot: bool,
    /// Clamped up to [`MIN_SNAPSHOT_INTERVAL_SECS`].
    #[serde(default = "default_session_snapshot_interval")]
    pub session_snapshot_interval_secs: u64,
    #[serde(default)]
    pub log_command: bool,
    #[serde(default = "default_true")]
    pub log_basic_session_activity: bool,
    #[serde(default)]
    pub log_all_socket_exceptions: bool,
    /// `true` drains the send queue with sequential writes; `false` uses
    /// scatter-gather vectored writes.
    #[serde(default)]
    pub sync_send: bool,
    /// Server-level security, inherited by listeners that do not set their own.
    #[serde(default)]
    pub security: Security,
    #[serde(default)]
    pub certificate: Option<CertificateConfig>,
    #[serde(default)]
    pub thread_pool: ThreadPoolConfig,
    #[serde(default = "default_performance_collect_interval")]
    pub performance_collect_interval_secs: u64,
}

fn default_name() -> String {
    "portico-server".to_string()
}
fn default_max_connections() -> usize {
    100
}
fn default_receive_buffer_size() -> usize {
    4096
}
fn default_sending_queue_size() -> usize {
    5
}
fn default_max_request_length() -> usize {
    1024
}
fn default_idle_session_timeout() -> u64 {
    300
}
fn default_clear_idle_session_interval() -> u64 {
    120
}
fn default_session_snapshot_interval() -> u64 {
    5
}
fn default_performance_collect_interval() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            ip: Some("127.0.0.1".to_string()),
            port: Some(2020),
            listeners: Vec::new(),
            mode: SocketMode::default(),
            max_connections: default_max_connections(),
            receive_buffer_size: default_receive_buffer_size(),
            sending_queue_size: default_sending_queue_size(),
            max_request_length: default_max_request_length(),
            clear_idle_session: false,
            idle_session_timeout_secs: default_idle_session_timeout(),
            clear_idle_session_interval_secs: default_clear_idle_session_interval(),
            disable_session_snapshot: false,
            session_snapshot_interval_secs: default_session_snapshot_interval(),
            log_command: false,
            log_basic_session_activity: true,
            log_all_socket_exceptions: false,
            sync_send: false,
            security: Security::None,
            certificate: None,
            thread_pool: ThreadPoolConfig::default(),
            performance_collect_interval_secs: default_performance_collect_interval(),
        }
    }
}

impl ServerConfig {
    /// Loads a configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{path}'"))?;
        Self::from_toml_str(&contents)
    }

    /// Parses a configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ServerConfig =
            toml::from_str(contents).context("failed to parse server configuration")?;
        Ok(config)
    }

    /// Validates the configuration, clamping out-of-range values in place.
    /// Invalid combinations (rather than out-of-range scalars) are errors.
    pub fn validate(&mut self) -> Result<(), PorticoError> {
        if self.name.trim().is_empty() {
            return Err(PorticoError::Config("server name must not be empty".into()));
        }

        let has_server_endpoint = self.ip.is_some() || self.port.is_some();
        if has_server_endpoint && !self.listeners.is_empty() {
            return Err(PorticoError::Config(
                "configure either server-level ip/port or a listeners list, not both".into(),
            ));
        }
        if !has_server_endpoint && self.listeners.is_empty() {
            return Err(PorticoError::Config(
                "no listening endpoint configured: set ip/port or a listeners list".into(),
            ));
        }
        if has_server_endpoint && (self.ip.is_none() || self.port.is_none()) {
            return Err(PorticoError::Config(
                "server-level endpoint requires both ip and port".into(),
            ));
        }

        if self.sending_queue_size < MIN_SENDING_QUEUE_SIZE {
            warn!(
                configured = self.sending_queue_size,
                minimum = MIN_SENDING_QUEUE_SIZE,
                "sending_queue_size below the minimum, clamping up"
            );
            self.sending_queue_size = MIN_SENDING_QUEUE_SIZE;
        }

        if self.session_snapshot_interval_secs < MIN_SNAPSHOT_INTERVAL_SECS {
            warn!(
                configured = self.session_snapshot_interval_secs,
                minimum = MIN_SNAPSHOT_INTERVAL_SECS,
                "session_snapshot_interval below the minimum, clamping up"
            );
            self.session_snapshot_interval_secs = MIN_SNAPSHOT_INTERVAL_SECS;
        }

        if self.receive_buffer_size == 0 {
            warn!("receive_buffer_size of 0 is not usable, falling back to the default");
            self.receive_buffer_size = default_receive_buffer_size();
        }

        if self.max_request_length == 0 {
            return Err(PorticoError::Config(
                "max_request_length must be greater than zero".into(),
            ));
        }

        if self.max_connections == 0 {
            return Err(PorticoError::Config(
                "max_connections must be greater than zero".into(),
            ));
        }

        // A secure listener is only acceptable when certificate material exists.
        let any_secure = self
            .effective_listeners()
            .iter()
            .any(|l| l.security == Some(Security::Tls));
        if any_secure {
            if self.mode == SocketMode::Udp {
                return Err(PorticoError::Config(
                    "TLS listeners are not supported in datagram mode".into(),
                ));
            }
            match &self.certificate {
                None => {
                    return Err(PorticoError::Config(
                        "a secure listener is configured but no certificate is".into(),
                    ));
                }
                Some(cert) => {
                    if cert.thumbprint.is_some() || cert.store_name.is_some() {
                        return Err(PorticoError::Config(
                            "certificate-store thumbprint resolution is not supported; \
                             provide cert_path and key_path PEM files"
                                .into(),
                        ));
                    }
                    if cert.cert_path.is_none() || cert.key_path.is_none() {
                        return Err(PorticoError::Config(
                            "certificate requires both cert_path and key_path".into(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// The listener set this server binds: the explicit list, or the single
    /// server-level endpoint. Each entry carries a resolved security value.
    pub fn effective_listeners(&self) -> Vec<ListenerConfig> {
        if !self.listeners.is_empty() {
            return self
                .listeners
                .iter()
                .map(|l| ListenerConfig {
                    ip: l.ip.clone(),
                    port: l.port,
                    backlog: l.backlog,
                    security: Some(l.security.unwrap_or(self.security)),
                })
                .collect();
        }
        match (&self.ip, self.port) {
            (Some(ip), Some(port)) => vec![ListenerConfig {
                ip: ip.clone(),
                port,
                backlog: default_backlog(),
                security: Some(self.security),
            }],
            _ => Vec::new(),
        }
    }
}

/// Parses a configured IP string, accepting the `any` / `ipv6any` aliases.
pub(crate) fn parse_bind_ip(ip: &str) -> Result<std::net::IpAddr, PorticoError> {
    match ip.to_ascii_lowercase().as_str() {
        "any" => Ok(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
        "ipv6any" => Ok(std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)),
        other => other
            .parse()
            .map_err(|_| PorticoError::Config(format!("invalid listener ip '{ip}'"))),
    }
}
