// src/lib.rs

//! Portico: an extensible session-oriented TCP server framework.
//!
//! Applications supply a request-framing strategy, a set of named command
//! handlers, and optional lifecycle hooks; the framework runs the accept
//! loop, the per-session receive and send pipelines, the command dispatcher,
//! and the session maintenance timers.

pub mod bootstrap;
pub mod command;
pub mod config;
pub mod errors;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tasks;

pub use crate::bootstrap::{Bootstrap, ServerDescriptor, StartResult};
pub use crate::command::{Command, CommandFilter, CommandLoader, StaticCommandLoader};
pub use crate::config::ServerConfig;
pub use crate::errors::{CloseReason, PorticoError};
pub use crate::protocol::{Framer, FramerFactory, Request};
pub use crate::server::{Server, ServerBuilder, ServerHandler};
pub use crate::session::Session;
