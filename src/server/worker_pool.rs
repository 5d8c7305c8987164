// src/server/worker_pool.rs

//! Process-wide worker tuning. Applied once by the first server that sets
//! up; every later server skips it.

use crate::config::ThreadPoolConfig;
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;
use tracing::{debug, info};

struct WorkerPool {
    dispatch_permits: Option<Arc<Semaphore>>,
}

static WORKER_POOL: OnceLock<WorkerPool> = OnceLock::new();

/// Applies the thread-pool settings, once per process. A positive
/// `max_working_threads` becomes a cap on concurrently executing command
/// handlers; negative values leave the runtime defaults untouched. The
/// completion-port knobs have no equivalent here and are only recorded.
pub(crate) fn configure(config: &ThreadPoolConfig) {
    if WORKER_POOL.get().is_some() {
        debug!("worker pool already configured by an earlier server, skipping");
        return;
    }

    let dispatch_permits = (config.max_working_threads > 0)
        .then(|| Arc::new(Semaphore::new(config.max_working_threads as usize)));

    if WORKER_POOL
        .set(WorkerPool { dispatch_permits })
        .is_ok()
    {
        info!(
            max_working_threads = config.max_working_threads,
            min_working_threads = config.min_working_threads,
            max_completion_port_threads = config.max_completion_port_threads,
            min_completion_port_threads = config.min_completion_port_threads,
            "worker pool configured"
        );
    }
}

/// The global dispatch cap, when one was configured.
pub(crate) fn dispatch_permits() -> Option<Arc<Semaphore>> {
    WORKER_POOL
        .get()
        .and_then(|pool| pool.dispatch_permits.clone())
}
