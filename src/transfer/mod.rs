//! Tensor transfer: the two receive protocols.
//!
//! [`TensorTransfer`] holds the collaborators a receive needs (rendezvous
//! store, device registry, scheduler) and implements
//!
//! - [`recv_tensor`](TensorTransfer::recv_tensor): one key, one value
//! - [`fused_recv_tensor`](TensorTransfer::fused_recv_tensor): N keys, N
//!   values delivered together
//!
//! Both report through a single completion callback that runs exactly once.

mod copy;
mod fused;
mod single;

use std::sync::Arc;

use tracing::{debug, error};

pub use copy::{decide, CopyDecision, Staging};

use crate::device::{Device, DeviceRegistry};
use crate::error::{Result, WorkerError};
use crate::pool::Schedule;
use crate::rendezvous::{RendezvousKey, RendezvousStore};
use crate::tensor::{SerializedTensor, Tensor};

/// Estimated one-way network latency, subtracted from request timing.
pub const NETWORK_LATENCY_MICROS: i64 = 50;

/// The value of one transferred slot.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorPayload {
    /// Bulk-copyable host tensor, written to the wire without copying.
    Tensor(Tensor),
    /// Self-describing form of a non bulk-copyable tensor.
    Serialized(SerializedTensor),
}

impl TensorPayload {
    /// The tensor, rebuilding it from the serialized form if needed.
    pub fn to_tensor(&self) -> Result<Tensor> {
        match self {
            TensorPayload::Tensor(t) => Ok(t.clone()),
            TensorPayload::Serialized(s) => s.clone().into_tensor(),
        }
    }
}

impl Default for TensorPayload {
    fn default() -> Self {
        TensorPayload::Tensor(Tensor::empty())
    }
}

/// One received value and its is-dead flag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorSlot {
    pub payload: TensorPayload,
    pub is_dead: bool,
}

impl TensorSlot {
    pub fn new(payload: TensorPayload, is_dead: bool) -> Self {
        Self { payload, is_dead }
    }
}

/// Response of `recv-tensor`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorResponse {
    pub slot: TensorSlot,
    pub send_start_micros: i64,
}

/// Response of `fused-recv-tensor`; slots are in request key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FusedTensorResponse {
    pub slots: Vec<TensorSlot>,
    pub send_start_micros: i64,
}

/// Receive protocols over injected collaborators.
pub struct TensorTransfer {
    rendezvous: Arc<dyn RendezvousStore>,
    devices: Arc<dyn DeviceRegistry>,
    scheduler: Arc<dyn Schedule>,
    abort_on_bad_key: bool,
    trace_timing: bool,
}

impl TensorTransfer {
    pub fn new(
        rendezvous: Arc<dyn RendezvousStore>,
        devices: Arc<dyn DeviceRegistry>,
        scheduler: Arc<dyn Schedule>,
    ) -> Self {
        Self {
            rendezvous,
            devices,
            scheduler,
            abort_on_bad_key: false,
            trace_timing: false,
        }
    }

    /// Terminate the process when a single receive names a malformed key
    /// or an unresolvable device.
    ///
    /// The error response is queued first, but the process usually dies
    /// before it is written. Fused receives only report the error.
    pub fn with_abort_on_bad_key(mut self, abort: bool) -> Self {
        self.abort_on_bad_key = abort;
        self
    }

    /// Emit timing traces.
    pub fn with_trace_timing(mut self, trace: bool) -> Self {
        self.trace_timing = trace;
        self
    }

    /// Parse `key` and find its source device.
    fn prepare(&self, key: &str) -> Result<(RendezvousKey, Arc<dyn Device>)> {
        let parsed = RendezvousKey::parse(key)?;
        let device = self.devices.resolve(&parsed)?;
        Ok((parsed, device))
    }

    /// Report a key that failed [`prepare`](Self::prepare).
    fn reject_key<T>(&self, step_id: i64, key: &str, err: WorkerError, done: impl FnOnce(Result<T>)) {
        debug!(step_id, key, error = %err, "rejecting rendezvous key");
        done(Err(err));
    }

    /// Like [`reject_key`](Self::reject_key), then terminate the process
    /// when `abort_on_bad_key` is set.
    fn reject_key_or_abort<T>(
        &self,
        step_id: i64,
        key: &str,
        err: WorkerError,
        done: impl FnOnce(Result<T>),
    ) {
        if !self.abort_on_bad_key {
            return self.reject_key(step_id, key, err, done);
        }
        let message = err.to_string();
        done(Err(err));
        error!(step_id, key, error = %message, "bad rendezvous key, aborting process");
        std::process::abort();
    }
}
