//! Devices, allocators and device-to-host copies.
//!
//! The worker never owns accelerator code. It talks to devices through three
//! small traits:
//!
//! - [`Device`] - name, incarnation, whether values need host staging, and
//!   allocators by [`AllocatorAttributes`]
//! - [`DeviceContext`] - issues an asynchronous device-to-host copy
//! - [`DeviceRegistry`] - finds the device that produced a rendezvous key
//!
//! [`CpuDevice`] and [`DeviceSet`] cover the host-only case; accelerator
//! backends implement the traits themselves.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::{Result, WorkerError};
use crate::rendezvous::RendezvousKey;
use crate::tensor::Tensor;

/// Where an allocation must live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AllocatorAttributes {
    on_host: bool,
    gpu_compatible: bool,
}

impl AllocatorAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host memory the accelerator can DMA into; the staging buffer of a
    /// device-to-host copy.
    pub fn host_staging() -> Self {
        Self {
            on_host: true,
            gpu_compatible: true,
        }
    }

    pub fn with_on_host(mut self, on_host: bool) -> Self {
        self.on_host = on_host;
        self
    }

    pub fn with_gpu_compatible(mut self, gpu_compatible: bool) -> Self {
        self.gpu_compatible = gpu_compatible;
        self
    }

    #[inline]
    pub fn on_host(&self) -> bool {
        self.on_host
    }

    #[inline]
    pub fn gpu_compatible(&self) -> bool {
        self.gpu_compatible
    }
}

/// Memory allocator exposed by a device.
pub trait Allocator: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate a zeroed buffer of `num_bytes`.
    fn allocate(&self, num_bytes: usize) -> Result<BytesMut>;
}

/// Plain heap allocator.
#[derive(Debug, Default)]
pub struct HostAllocator;

impl Allocator for HostAllocator {
    fn name(&self) -> &str {
        "host"
    }

    fn allocate(&self, num_bytes: usize) -> Result<BytesMut> {
        Ok(BytesMut::zeroed(num_bytes))
    }
}

/// Completion of a device-to-host copy: the filled host buffer, or why the
/// copy failed.
pub type CopyCallback = Box<dyn FnOnce(Result<BytesMut>) + Send + 'static>;

/// Stream/context a value was produced on.
pub trait DeviceContext: Send + Sync {
    /// Copy `src` from `device` into the host buffer `dst`.
    ///
    /// `done` must be invoked exactly once, from any thread, after the copy
    /// has finished or failed.
    fn copy_device_to_host(
        &self,
        src: &Tensor,
        key: &str,
        device: &dyn Device,
        dst: BytesMut,
        done: CopyCallback,
    );
}

/// A compute device local to this worker.
pub trait Device: Send + Sync {
    /// Full device name, e.g. `/job:worker/replica:0/task:0/device:GPU:0`.
    fn name(&self) -> &str;

    /// Device type, e.g. `CPU` or `GPU`.
    fn device_type(&self) -> &str;

    /// Random id minted when the device was created; changes on restart.
    fn incarnation(&self) -> u64;

    /// Whether values resident in this device's own memory must be copied to
    /// host memory before they can be sent.
    fn requires_host_staging(&self) -> bool;

    /// Allocator for memory with the given attributes.
    fn allocator(&self, attrs: AllocatorAttributes) -> Arc<dyn Allocator>;
}

impl fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name())
            .field("device_type", &self.device_type())
            .field("incarnation", &self.incarnation())
            .finish()
    }
}

/// The host CPU.
#[derive(Debug)]
pub struct CpuDevice {
    name: String,
    incarnation: u64,
    allocator: Arc<HostAllocator>,
}

impl CpuDevice {
    pub fn new(name: impl Into<String>, incarnation: u64) -> Self {
        Self {
            name: name.into(),
            incarnation,
            allocator: Arc::new(HostAllocator),
        }
    }
}

impl Device for CpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_type(&self) -> &str {
        "CPU"
    }

    fn incarnation(&self) -> u64 {
        self.incarnation
    }

    fn requires_host_staging(&self) -> bool {
        false
    }

    fn allocator(&self, _attrs: AllocatorAttributes) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }
}

/// Lookup of local devices.
pub trait DeviceRegistry: Send + Sync {
    /// Device registered under exactly `name`.
    fn lookup(&self, name: &str) -> Option<Arc<dyn Device>>;

    /// Device that produced the value behind `key`.
    ///
    /// # Errors
    ///
    /// [`WorkerError::DeviceNotFound`] when the source device is not local,
    /// [`WorkerError::IncarnationMismatch`] when the key was minted for an
    /// earlier incarnation of it.
    fn resolve(&self, key: &RendezvousKey) -> Result<Arc<dyn Device>> {
        let device = self
            .lookup(key.src_device())
            .ok_or_else(|| WorkerError::DeviceNotFound(key.src_device().to_string()))?;
        if device.incarnation() != key.src_incarnation() {
            return Err(WorkerError::IncarnationMismatch {
                device: device.name().to_string(),
                expected: key.src_incarnation(),
                actual: device.incarnation(),
            });
        }
        Ok(device)
    }
}

/// Devices of this worker, keyed by full name.
#[derive(Default)]
pub struct DeviceSet {
    devices: HashMap<String, Arc<dyn Device>>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, replacing any device with the same name.
    pub fn add(&mut self, device: Arc<dyn Device>) {
        self.devices.insert(device.name().to_string(), device);
    }

    /// Builder-style [`add`](Self::add).
    pub fn with_device(mut self, device: Arc<dyn Device>) -> Self {
        self.add(device);
        self
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceRegistry for DeviceSet {
    fn lookup(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices.get(name).cloned()
    }
}
