//! Device-aware copy decisions.
//!
//! [`decide`] is a pure function of the source device, the value's
//! allocation attributes, the element type and whether host staging is
//! allowed on the calling path. [`stage_to_host`] carries out the
//! staging copy when the decision says so.

use std::sync::Arc;

use crate::device::{AllocatorAttributes, Device};
use crate::error::{Result, WorkerError};
use crate::rendezvous::Received;
use crate::tensor::{DataType, Tensor};

use super::TensorPayload;

/// Whether the calling path may issue a device-to-host copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staging {
    Allowed,
    Forbidden,
}

/// What to do with a located value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDecision {
    /// Host-resident and bulk-copyable: send the buffer as is.
    UseAsIs,
    /// Host-resident but not bulk-copyable: send the serialized form.
    Serialize,
    /// In device memory: copy to a host buffer first.
    StageToHost,
    /// In device memory on a path that cannot stage.
    Unsupported,
}

pub fn decide(
    device: &dyn Device,
    attrs: AllocatorAttributes,
    dtype: DataType,
    staging: Staging,
) -> CopyDecision {
    if device.requires_host_staging() && !attrs.on_host() {
        return match staging {
            Staging::Allowed => CopyDecision::StageToHost,
            Staging::Forbidden => CopyDecision::Unsupported,
        };
    }
    if dtype.can_use_memcpy() {
        CopyDecision::UseAsIs
    } else {
        CopyDecision::Serialize
    }
}

/// Payload for a host-resident value.
pub(crate) fn host_payload(value: Tensor) -> TensorPayload {
    if value.dtype().can_use_memcpy() {
        TensorPayload::Tensor(value)
    } else {
        TensorPayload::Serialized(value.to_serialized())
    }
}

/// Copy a device-resident value into a host buffer from the device's
/// staging allocator.
///
/// `done` runs exactly once: with the host tensor when the copy completes,
/// or with the error that kept it from starting or finishing.
pub(crate) fn stage_to_host(
    device: Arc<dyn Device>,
    received: Received,
    key: &str,
    done: impl FnOnce(Result<Tensor>) + Send + 'static,
) {
    let Some(context) = received.args.device_context.clone() else {
        done(Err(WorkerError::UnsupportedConfiguration(format!(
            "value for {} is in {} memory but has no device context",
            key,
            device.name()
        ))));
        return;
    };

    let value = received.value;
    let allocator = device.allocator(AllocatorAttributes::host_staging());
    let staging = match allocator.allocate(value.total_bytes()) {
        Ok(buf) => buf,
        Err(err) => {
            done(Err(err));
            return;
        }
    };

    let dtype = value.dtype();
    let shape = value.shape().clone();
    context.copy_device_to_host(
        &value,
        key,
        device.as_ref(),
        staging,
        Box::new(move |copied| {
            let result = copied
                .map_err(|err| {
                    if matches!(err, WorkerError::CopyFailed(_)) {
                        err
                    } else {
                        WorkerError::CopyFailed(err.to_string())
                    }
                })
                .and_then(|buf| Tensor::from_bytes(dtype, shape, buf.freeze()));
            done(result);
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Allocator, CpuDevice, HostAllocator};
    use bytes::Bytes;

    struct Accelerator;

    impl Device for Accelerator {
        fn name(&self) -> &str {
            "/job:worker/replica:0/task:0/device:GPU:0"
        }
        fn device_type(&self) -> &str {
            "GPU"
        }
        fn incarnation(&self) -> u64 {
            1
        }
        fn requires_host_staging(&self) -> bool {
            true
        }
        fn allocator(&self, _attrs: AllocatorAttributes) -> Arc<dyn Allocator> {
            Arc::new(HostAllocator)
        }
    }

    #[test]
    fn test_host_device_never_stages() {
        let cpu = CpuDevice::new("/job:worker/replica:0/task:0/device:CPU:0", 1);
        let device_mem = AllocatorAttributes::new();
        assert_eq!(
            decide(&cpu, device_mem, DataType::Float, Staging::Allowed),
            CopyDecision::UseAsIs
        );
        assert_eq!(
            decide(&cpu, device_mem, DataType::String, Staging::Forbidden),
            CopyDecision::Serialize
        );
    }

    #[test]
    fn test_accelerator_memory() {
        let gpu = Accelerator;
        let device_mem = AllocatorAttributes::new();
        assert_eq!(
            decide(&gpu, device_mem, DataType::Float, Staging::Allowed),
            CopyDecision::StageToHost
        );
        assert_eq!(
            decide(&gpu, device_mem, DataType::Float, Staging::Forbidden),
            CopyDecision::Unsupported
        );
    }

    #[test]
    fn test_accelerator_value_already_on_host() {
        let gpu = Accelerator;
        let host = AllocatorAttributes::new().with_on_host(true);
        assert_eq!(
            decide(&gpu, host, DataType::Int64, Staging::Forbidden),
            CopyDecision::UseAsIs
        );
        assert_eq!(
            decide(&gpu, host, DataType::Resource, Staging::Allowed),
            CopyDecision::Serialize
        );
    }

    #[test]
    fn test_decide_is_deterministic() {
        let gpu = Accelerator;
        let attrs = AllocatorAttributes::new();
        let first = decide(&gpu, attrs, DataType::Half, Staging::Allowed);
        for _ in 0..10 {
            assert_eq!(decide(&gpu, attrs, DataType::Half, Staging::Allowed), first);
        }
    }

    #[test]
    fn test_host_payload_by_dtype() {
        let floats = Tensor::from_bytes(DataType::Float, vec![1u64], Bytes::from_static(&[0; 4])).unwrap();
        assert!(matches!(host_payload(floats), TensorPayload::Tensor(_)));

        let strings =
            Tensor::from_elements(DataType::String, vec![1u64], vec![Bytes::from_static(b"s")]).unwrap();
        assert!(matches!(host_payload(strings), TensorPayload::Serialized(_)));
    }
}
