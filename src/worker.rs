//! The worker: collaborators, compute pool and dispatch table in one place.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::call::{CallOptions, ServerCall};
use crate::config::WorkerConfig;
use crate::device::DeviceRegistry;
use crate::error::{Result, WorkerError};
use crate::pool::ComputePool;
use crate::rendezvous::RendezvousStore;
use crate::service::{MethodDispatchTable, MethodId};
use crate::transfer::TensorTransfer;

/// Boxed future returned by [`GraphWorker::run_graph`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Graph execution engine behind the forwarding methods.
///
/// Requests and responses are opaque bytes; the worker only schedules the
/// call and delivers the result.
pub trait GraphWorker: Send + Sync {
    /// Serve get-status, the session and graph methods, cleanup-all,
    /// logging and tracing.
    fn handle(&self, method: MethodId, request: Bytes) -> Result<Bytes>;

    /// Run a registered graph for one step.
    fn run_graph(&self, options: Arc<CallOptions>, request: Bytes) -> BoxFuture<'static, Result<Bytes>>;
}

/// Graph worker for processes that only serve tensors.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGraphWorker;

impl GraphWorker for NoGraphWorker {
    fn handle(&self, method: MethodId, _request: Bytes) -> Result<Bytes> {
        Err(WorkerError::Unimplemented(method.name()))
    }

    fn run_graph(&self, _options: Arc<CallOptions>, _request: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        Box::pin(async { Err(WorkerError::Unimplemented(MethodId::RunGraph.name())) })
    }
}

/// Collaborators a worker is built from.
#[derive(Clone)]
pub struct WorkerEnv {
    pub devices: Arc<dyn DeviceRegistry>,
    pub rendezvous: Arc<dyn RendezvousStore>,
    pub graph: Arc<dyn GraphWorker>,
}

impl WorkerEnv {
    /// Environment without a graph engine.
    pub fn new(devices: Arc<dyn DeviceRegistry>, rendezvous: Arc<dyn RendezvousStore>) -> Self {
        Self {
            devices,
            rendezvous,
            graph: Arc::new(NoGraphWorker),
        }
    }

    pub fn with_graph(mut self, graph: Arc<dyn GraphWorker>) -> Self {
        self.graph = graph;
        self
    }
}

/// Serves calls for one worker process.
pub struct Worker {
    transfer: TensorTransfer,
    graph: Arc<dyn GraphWorker>,
    pool: Arc<ComputePool>,
    config: WorkerConfig,
    table: MethodDispatchTable,
}

impl Worker {
    /// Worker whose compute pool runs on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when called outside a runtime.
    pub fn new(env: WorkerEnv, config: WorkerConfig) -> Result<Arc<Self>> {
        let pool = Arc::new(ComputePool::new(config.max_concurrent_calls)?);
        Ok(Self::with_pool(env, config, pool))
    }

    /// Worker on an existing compute pool.
    pub fn with_pool(env: WorkerEnv, config: WorkerConfig, pool: Arc<ComputePool>) -> Arc<Self> {
        let transfer = TensorTransfer::new(env.rendezvous, env.devices, pool.clone())
            .with_abort_on_bad_key(config.abort_on_bad_key)
            .with_trace_timing(config.trace_timing);
        Arc::new(Self {
            transfer,
            graph: env.graph,
            pool,
            config,
            table: MethodDispatchTable::new(),
        })
    }

    /// Route `call` to its handler. Never blocks.
    pub fn dispatch(self: &Arc<Self>, call: ServerCall) {
        self.table.dispatch(self, call);
    }

    pub fn transfer(&self) -> &TensorTransfer {
        &self.transfer
    }

    pub fn graph(&self) -> &Arc<dyn GraphWorker> {
        &self.graph
    }

    pub fn pool(&self) -> &ComputePool {
        &self.pool
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}
