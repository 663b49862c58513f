//! Compute pool: where handlers run their calls.
//!
//! Handlers are invoked on the connection's read loop and must not block it.
//! [`ComputePool::spawn_call`] moves a call's work onto the runtime, bounded
//! by `max_concurrent_calls`. Short completion work (per-value fills of a
//! fused receive) goes through [`Schedule`], which is not bounded: those
//! units only run for calls that already hold a permit.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::error::{Result, WorkerError};

/// A unit of work run off the calling thread.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Facility that runs work off the calling thread.
pub trait Schedule: Send + Sync {
    fn schedule(&self, work: Work);
}

/// Runtime-backed pool with a bound on concurrently running calls.
pub struct ComputePool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    max_concurrent_calls: usize,
    scheduled_calls: AtomicU64,
}

impl ComputePool {
    /// Pool on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when called outside a runtime.
    pub fn new(max_concurrent_calls: usize) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| WorkerError::Internal(format!("compute pool needs a tokio runtime: {}", e)))?;
        Ok(Self::with_handle(runtime, max_concurrent_calls))
    }

    /// Pool on an explicit runtime.
    pub fn with_handle(runtime: Handle, max_concurrent_calls: usize) -> Self {
        let max_concurrent_calls = max_concurrent_calls.max(1);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrent_calls)),
            max_concurrent_calls,
            scheduled_calls: AtomicU64::new(0),
        }
    }

    /// Run a call's work once a permit is free.
    pub fn spawn_call<F>(&self, call: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.scheduled_calls.fetch_add(1, Ordering::Relaxed);
        let permits = self.permits.clone();
        self.runtime.spawn(async move {
            // The semaphore is never closed; run regardless so the call is
            // always answered.
            let _permit = permits.acquire_owned().await.ok();
            call.await;
        });
    }

    /// Calls handed to [`spawn_call`](Self::spawn_call) so far.
    pub fn scheduled_calls(&self) -> u64 {
        self.scheduled_calls.load(Ordering::Relaxed)
    }

    /// Permits not held by a running call.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls
    }
}

impl Schedule for ComputePool {
    fn schedule(&self, work: Work) {
        self.runtime.spawn(async move { work() });
    }
}
