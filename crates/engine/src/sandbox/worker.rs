//! Long-lived evaluation threads.
//!
//! Every evaluation runs on one of a few named threads with a large stack, so deep user code
//! never grows the caller's stack. Async callers await a oneshot reply instead of blocking their
//! runtime thread; synchronous callers block on a channel. Work submitted from a worker thread
//! runs inline.

use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use once_cell::sync::Lazy;
use tokio::sync::oneshot;
use tracing::debug;

use super::SandboxError;

/// Stack of each worker; recursion in user code stops at `max_call_depth` long before this.
const WORKER_STACK_SIZE: usize = 64 * 1024 * 1024;
const MIN_WORKERS: usize = 2;
const MAX_WORKERS: usize = 8;

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

static POOL: Lazy<Result<WorkerPool, String>> = Lazy::new(WorkerPool::start);

struct WorkerPool {
    jobs: Sender<Job>,
}

impl WorkerPool {
    fn start() -> Result<Self, String> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let queue = Arc::new(Mutex::new(queue));
        let workers = thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(MIN_WORKERS)
            .clamp(MIN_WORKERS, MAX_WORKERS);
        for index in 0..workers {
            let queue = Arc::clone(&queue);
            thread::Builder::new()
                .name(format!("toolflow-sandbox-{index}"))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || work(&queue))
                .map_err(|error| format!("failed to start sandbox worker: {error}"))?;
        }
        debug!(workers, "sandbox workers started");
        Ok(Self { jobs })
    }
}

fn work(queue: &Mutex<Receiver<Job>>) {
    ON_WORKER.with(|flag| flag.set(true));
    loop {
        let job = match queue.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => return,
        };
        let Ok(job) = job else {
            return;
        };
        // A panicking job drops its reply sender; the caller reports the failure.
        let _ = catch_unwind(AssertUnwindSafe(job));
    }
}

fn submit(job: Job) -> Result<(), SandboxError> {
    let pool = POOL.as_ref().map_err(|error| SandboxError::Worker(error.clone()))?;
    pool.jobs
        .send(job)
        .map_err(|_| SandboxError::Worker("sandbox workers have stopped".to_string()))
}

fn panicked() -> SandboxError {
    SandboxError::Worker("evaluation thread panicked".to_string())
}

pub(crate) fn on_worker() -> bool {
    ON_WORKER.with(Cell::get)
}

/// Runs `job` on a worker and blocks until it returns.
pub(crate) fn run_blocking<T, F>(job: F) -> Result<T, SandboxError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    if on_worker() {
        return Ok(job());
    }
    let (reply, result) = mpsc::sync_channel(1);
    submit(Box::new(move || {
        let _ = reply.send(job());
    }))?;
    result.recv().map_err(|_| panicked())
}

/// Runs `job` on a worker without blocking the calling task.
///
/// Dropping the returned future detaches the job; pair it with a cancellation token checked by
/// the job so the worker is released promptly.
pub async fn run_on_worker<T, F>(job: F) -> Result<T, SandboxError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (reply, result) = oneshot::channel();
    submit(Box::new(move || {
        let _ = reply.send(job());
    }))?;
    result.await.map_err(|_| panicked())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_jobs_run_on_named_workers() {
        let name = run_blocking(|| thread::current().name().map(str::to_string)).expect("job runs");
        assert!(name.is_some_and(|name| name.starts_with("toolflow-sandbox-")));
        assert!(!on_worker());
    }

    #[test]
    fn nested_jobs_run_inline() {
        let nested = run_blocking(|| run_blocking(on_worker)).expect("outer job");
        assert_eq!(nested, Ok(true));
    }

    #[test]
    fn panics_are_reported_and_workers_survive() {
        let error = run_blocking(|| -> u8 { panic!("boom") }).expect_err("panic surfaces");
        assert!(matches!(error, SandboxError::Worker(_)));
        assert_eq!(run_blocking(|| 7), Ok(7));
    }

    #[tokio::test]
    async fn async_callers_await_without_blocking() {
        let value = run_on_worker(|| 40 + 2).await.expect("job runs");
        assert_eq!(value, 42);
    }
}
