//! Worker pool for concurrent granule writes.
//!
//! Workers are tasks on the multi-threaded runtime, draining a shared queue
//! of granules. Two shared signals coordinate shutdown: a worker that hits an
//! error records the first message and exits; the supervisor records a
//! crashed (panicked) worker. Peers observe either signal before dequeuing
//! their next granule and exit cleanly.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{ConvertError, ConvertResult};

/// Exit code recorded for a worker task that panicked or was aborted,
/// mirroring the process exit code of a panicking Rust binary.
const CRASH_EXIT_CODE: i32 = 101;

const SUPERVISOR_POLL: Duration = Duration::from_millis(500);

/// Number of workers: the requested count, capped by available CPUs and by
/// the number of inputs (never more workers than granules).
pub fn worker_count(requested: Option<usize>, input_count: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    requested
        .unwrap_or(cpus)
        .min(cpus)
        .min(input_count)
        .max(1)
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SharedSignals {
    exception_message: Mutex<Option<String>>,
    process_error: Mutex<Option<String>>,
}

impl SharedSignals {
    /// Record a worker error. The first message wins.
    pub fn set_exception(&self, message: String) {
        let mut slot = self.exception_message.lock().expect("signal lock");
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    pub fn exception(&self) -> Option<String> {
        self.exception_message.lock().expect("signal lock").clone()
    }

    pub fn set_process_error(&self, message: String) {
        let mut slot = self.process_error.lock().expect("signal lock");
        if slot.is_none() {
            *slot = Some(message);
        }
    }

    /// Whether any stop signal has been raised.
    pub fn any_set(&self) -> bool {
        self.exception_message.lock().expect("signal lock").is_some()
            || self.process_error.lock().expect("signal lock").is_some()
    }
}

#[derive(Debug)]
struct GranuleQueue {
    items: Mutex<VecDeque<PathBuf>>,
}

impl GranuleQueue {
    fn new(granules: Vec<PathBuf>) -> Self {
        Self {
            items: Mutex::new(granules.into()),
        }
    }

    fn try_pop(&self) -> Option<PathBuf> {
        self.items.lock().expect("queue lock").pop_front()
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Run `job` over every granule with `worker_count` concurrent workers.
///
/// Any job error surfaces as [`ConvertError::WorkerException`] carrying the
/// first recorded message; a panicked worker surfaces as
/// [`ConvertError::WorkerCrash`] carrying the per-worker exit codes.
pub async fn run_worker_pool<J, Fut>(
    granules: Vec<PathBuf>,
    worker_count: usize,
    job: J,
) -> ConvertResult<()>
where
    J: Fn(PathBuf) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ConvertResult<()>> + Send + 'static,
{
    let signals = Arc::new(SharedSignals::default());
    let queue = Arc::new(GranuleQueue::new(granules));
    info!(workers = worker_count, "starting granule workers");

    // Each worker runs under a watchdog that converts a panic into the
    // process-error signal, so peers stop promptly instead of draining the
    // queue next to a crashed sibling.
    let watchdogs: Vec<_> = (0..worker_count)
        .map(|worker_id| {
            let worker = tokio::spawn(worker_loop(
                worker_id,
                queue.clone(),
                signals.clone(),
                job.clone(),
            ));
            let signals = signals.clone();
            tokio::spawn(async move {
                match worker.await {
                    Ok(()) => 0,
                    Err(join_error) => {
                        error!(worker = worker_id, %join_error, "worker terminated abnormally");
                        signals.set_process_error(format!(
                            "worker {worker_id} terminated abnormally"
                        ));
                        CRASH_EXIT_CODE
                    }
                }
            })
        })
        .collect();

    while watchdogs.iter().any(|handle| !handle.is_finished()) {
        tokio::time::sleep(SUPERVISOR_POLL).await;
    }

    let mut exit_codes = Vec::with_capacity(worker_count);
    for watchdog in watchdogs {
        let code = watchdog
            .await
            .map_err(|e| ConvertError::Other(format!("supervisor join failed: {e}")))?;
        exit_codes.push(code);
    }

    if let Some(message) = signals.exception() {
        return Err(ConvertError::WorkerException(message));
    }
    if exit_codes.iter().any(|code| *code != 0) {
        return Err(ConvertError::WorkerCrash(exit_codes));
    }
    Ok(())
}

async fn worker_loop<J, Fut>(
    worker_id: usize,
    queue: Arc<GranuleQueue>,
    signals: Arc<SharedSignals>,
    job: J,
) where
    J: Fn(PathBuf) -> Fut + Send + Sync,
    Fut: Future<Output = ConvertResult<()>> + Send,
{
    while !signals.any_set() {
        let Some(granule) = queue.try_pop() else {
            break;
        };
        debug!(worker = worker_id, granule = %granule.display(), "processing granule");
        if let Err(err) = job(granule.clone()).await {
            warn!(
                worker = worker_id,
                granule = %granule.display(),
                error = %err,
                "granule write failed"
            );
            signals.set_exception(err.to_string());
            return;
        }
    }
}
