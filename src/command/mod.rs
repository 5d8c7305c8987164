// src/command/mod.rs

//! Named command handlers, the filter chain around them, and the dispatcher.

pub mod dispatcher;
pub mod registry;

pub use registry::{
    CommandContainer, CommandEntry, CommandLoader, CommandUpdate, StaticCommandLoader,
};

use crate::errors::PorticoError;
use crate::protocol::Request;
use crate::session::Session;
use async_trait::async_trait;
use std::sync::Arc;

/// A named request handler. Names are matched case-insensitively and must be
/// unique within a server.
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &str;

    /// Filters wrapping this command's execution, in order. Combined with the
    /// server-level global filters when the container is built.
    fn filters(&self) -> Vec<Arc<dyn CommandFilter>> {
        Vec::new()
    }

    async fn execute(&self, session: &Arc<Session>, request: &Request) -> Result<(), PorticoError>;
}

/// What a filter sees around one dispatch.
pub struct FilterContext<'a> {
    pub session: &'a Arc<Session>,
    pub request: &'a Request,
    /// The resolved command name.
    pub command: &'a str,
    /// Set by `on_executing` to skip the handler.
    pub cancel: bool,
}

/// An interceptor around command execution. `on_executing` runs before the
/// handler and may cancel it; `on_executed` runs after a successful handler.
#[async_trait]
pub trait CommandFilter: Send + Sync {
    fn name(&self) -> &str;

    async fn on_executing(&self, ctx: &mut FilterContext<'_>);

    async fn on_executed(&self, ctx: &mut FilterContext<'_>);
}

/// When installed on a server, replaces registry dispatch entirely: every
/// parsed request goes here instead of being routed by key.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn handle(&self, session: &Arc<Session>, request: &Request) -> Result<(), PorticoError>;
}
