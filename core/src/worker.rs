//! Worker pool for App Object handlers.
//!
//! Handler code never runs on the thread that delivered the event: the
//! engine owns that thread and a handler may itself call back into the
//! engine and wait. The pool is injected into the context so embedders can
//! supply their own executor.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use conduit_types::LifecycleError;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// Unit of work submitted to a pool.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait WorkerPool: Send + Sync {
    /// Schedule `job`. Must not run it inline on the calling thread.
    fn execute(&self, job: Job);

    /// Schedule a job for an object registered by a nested invocation.
    ///
    /// The invoking job is still running and holds its share of the pool
    /// until the nested work completes, so this must not wait for capacity
    /// the invoking job could be holding.
    fn execute_nested(&self, job: Job);
}

/// Tokio-backed pool; at most `max_concurrent` jobs run at once, the rest
/// wait for a permit.
#[derive(Debug, Clone)]
pub struct TokioWorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
}

impl TokioWorkerPool {
    #[must_use]
    pub fn new(runtime: Handle, max_concurrent: usize) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Bind to the runtime the caller is running on.
    pub fn current(max_concurrent: usize) -> Result<Self, LifecycleError> {
        let runtime = Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;
        Ok(Self::new(runtime, max_concurrent))
    }

    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl WorkerPool for TokioWorkerPool {
    fn execute(&self, job: Job) {
        let permits = Arc::clone(&self.permits);
        self.runtime.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::warn!("worker pool semaphore closed; dropping job");
                return;
            };
            job.await;
        });
    }

    fn execute_nested(&self, job: Job) {
        self.runtime.spawn(job);
    }
}
