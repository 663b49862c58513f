//! Rendezvous: where produced values wait for their receivers.
//!
//! The transfer protocols only see the [`RendezvousStore`] trait. Both
//! receive operations are asynchronous and invoke their callback exactly once,
//! on whatever thread produced the outcome.
//!
//! [`LocalRendezvous`] is the in-memory store used by a single worker.

mod key;
mod local;

use std::fmt;
use std::sync::Arc;

pub use key::{DeviceName, FrameAndIter, RendezvousKey};
pub use local::LocalRendezvous;

use crate::device::{AllocatorAttributes, DeviceContext};
use crate::error::Result;
use crate::tensor::Tensor;

/// Residency metadata the producer attached to a value.
#[derive(Clone, Default)]
pub struct RendezvousArgs {
    /// Where the value's buffer was allocated.
    pub alloc_attrs: AllocatorAttributes,
    /// Context able to copy the value off its device.
    pub device_context: Option<Arc<dyn DeviceContext>>,
    /// When the value was handed to the rendezvous.
    pub rendezvous_micros: i64,
}

impl RendezvousArgs {
    /// Metadata for a value already in host memory.
    pub fn host() -> Self {
        Self {
            alloc_attrs: AllocatorAttributes::new().with_on_host(true),
            ..Self::default()
        }
    }

    /// Metadata for a value in the producing device's own memory.
    pub fn on_device(device_context: Arc<dyn DeviceContext>) -> Self {
        Self {
            alloc_attrs: AllocatorAttributes::new(),
            device_context: Some(device_context),
            rendezvous_micros: 0,
        }
    }
}

impl fmt::Debug for RendezvousArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RendezvousArgs")
            .field("alloc_attrs", &self.alloc_attrs)
            .field("device_context", &self.device_context.is_some())
            .field("rendezvous_micros", &self.rendezvous_micros)
            .finish()
    }
}

/// One value handed out by the rendezvous.
#[derive(Debug, Clone)]
pub struct Received {
    pub args: RendezvousArgs,
    pub value: Tensor,
    /// The producer signalled that no value exists.
    pub is_dead: bool,
}

impl Received {
    pub fn new(args: RendezvousArgs, value: Tensor, is_dead: bool) -> Self {
        Self {
            args,
            value,
            is_dead,
        }
    }

    /// A dead value: empty tensor, `is_dead` set.
    pub fn dead(args: RendezvousArgs) -> Self {
        Self::new(args, Tensor::empty(), true)
    }
}

/// Completion of a single receive.
pub type RecvCallback = Box<dyn FnOnce(Result<Received>) + Send + 'static>;

/// Completion of a batched receive: one entry per key, in key order.
pub type FusedRecvCallback = Box<dyn FnOnce(Result<Vec<Received>>) + Send + 'static>;

/// Store that pairs produced values with pending receives.
pub trait RendezvousStore: Send + Sync {
    /// Receive the value published under `key` in `step_id`.
    ///
    /// `done` runs exactly once, possibly before this call returns when the
    /// value is already there.
    fn recv_local_async(&self, step_id: i64, key: &RendezvousKey, done: RecvCallback);

    /// Receive all `keys` of `step_id` as one batch.
    ///
    /// `done` runs exactly once with either every value or the first failure.
    fn fused_recv_local_async(&self, step_id: i64, keys: &[RendezvousKey], done: FusedRecvCallback);
}
