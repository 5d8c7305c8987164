// src/command/dispatcher.rs

//! Routes one parsed request to its command handler, running the filter
//! chain around it and keeping the session's command bookkeeping straight.

use super::FilterContext;
use crate::errors::{CloseReason, PorticoError};
use crate::protocol::Request;
use crate::server::Server;
use crate::server::worker_pool;
use crate::session::Session;
use std::sync::Arc;
use tracing::{error, info};

/// Dispatches `request` on `session`. Errors never escape: a failing handler
/// is routed to the session's exception path, which logs and closes the
/// session with `ApplicationError`. Every dispatch, successful or not,
/// advances the session's activity time and the server's handled counter.
pub(crate) async fn dispatch(server: &Arc<Server>, session: &Arc<Session>, request: Request) {
    session.set_current_command(request.key());

    // Honor the process-wide worker cap, when one was configured.
    let _permit = match worker_pool::dispatch_permits() {
        Some(sem) => sem.acquire_owned().await.ok(),
        None => None,
    };

    let result = run_dispatch(server, session, &request).await;

    match result {
        Ok(()) => {
            session.set_previous_command(request.key());
            if server.config().log_command {
                info!(
                    session = session.id(),
                    command = request.key(),
                    "command executed"
                );
            }
        }
        Err(e) => handle_exception(server, session, &request, e).await,
    }

    session.touch();
    server.stats().increment_handled_requests();
}

async fn run_dispatch(
    server: &Arc<Server>,
    session: &Arc<Session>,
    request: &Request,
) -> Result<(), PorticoError> {
    if let Some(interceptor) = server.request_interceptor() {
        return interceptor.handle(session, request).await;
    }

    let container = server.commands();
    let Some(entry) = container.lookup(request.key()) else {
        server.handler().on_unknown_request(session, request).await;
        return Ok(());
    };

    if entry.filters.is_empty() {
        return entry.handler.execute(session, request).await;
    }

    let mut ctx = FilterContext {
        session,
        request,
        command: entry.handler.name(),
        cancel: false,
    };

    for filter in &entry.filters {
        filter.on_executing(&mut ctx).await;
        if ctx.cancel {
            info!(
                session = session.id(),
                command = request.key(),
                filter = filter.name(),
                "command execution cancelled by filter"
            );
            return Ok(());
        }
    }

    entry.handler.execute(session, request).await?;

    for filter in &entry.filters {
        filter.on_executed(&mut ctx).await;
    }
    Ok(())
}

/// The session's exception path: surface the error to the application hook,
/// log it, and close the session.
async fn handle_exception(
    server: &Arc<Server>,
    session: &Arc<Session>,
    request: &Request,
    error: PorticoError,
) {
    server.handler().on_error(session, &error).await;
    error!(
        session = session.id(),
        command = request.key(),
        error = %error,
        "command failed, closing session"
    );
    session.close(CloseReason::ApplicationError);
}
