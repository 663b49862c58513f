//! `fused-recv-tensor`: N keys, N values, one response.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::copy::{decide, host_payload, CopyDecision, Staging};
use super::{FusedTensorResponse, TensorPayload, TensorSlot, TensorTransfer};
use crate::barrier::JoinBarrier;
use crate::call::CallOptions;
use crate::device::Device;
use crate::error::{Result, WorkerError};
use crate::rendezvous::Received;
use crate::tensor::now_micros;

/// Slots of one fused response while they are being filled.
///
/// Each index is written by exactly one fill; the join barrier decides who
/// calls [`finish`](Self::finish).
struct FusedBatch {
    slots: Vec<Mutex<Option<TensorSlot>>>,
    first_error: Mutex<Option<WorkerError>>,
}

impl FusedBatch {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Mutex::new(None)).collect(),
            first_error: Mutex::new(None),
        }
    }

    fn fill(&self, index: usize, slot: Result<TensorSlot>) {
        match slot {
            Ok(slot) => *self.slots[index].lock() = Some(slot),
            Err(err) => {
                let mut first = self.first_error.lock();
                if first.is_none() {
                    *first = Some(err);
                }
            }
        }
    }

    fn finish(&self) -> Result<FusedTensorResponse> {
        if let Some(err) = self.first_error.lock().take() {
            return Err(err);
        }
        let slots = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.lock()
                    .take()
                    .ok_or_else(|| WorkerError::Internal(format!("fused slot {} never filled", index)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FusedTensorResponse {
            slots,
            send_start_micros: now_micros(),
        })
    }
}

/// Build one slot. Fused receives never stage, so an accelerator-resident
/// value is a configuration error.
fn fill_slot(device: &dyn Device, received: Received, key: &str) -> Result<TensorSlot> {
    if received.is_dead {
        return Ok(TensorSlot::new(host_payload(received.value), true));
    }
    let decision = decide(
        device,
        received.args.alloc_attrs,
        received.value.dtype(),
        Staging::Forbidden,
    );
    let payload = match decision {
        CopyDecision::UseAsIs => TensorPayload::Tensor(received.value),
        CopyDecision::Serialize => TensorPayload::Serialized(received.value.to_serialized()),
        CopyDecision::StageToHost | CopyDecision::Unsupported => {
            return Err(WorkerError::UnsupportedConfiguration(format!(
                "value for {} is in {} memory; fused receives need host-resident values",
                key,
                device.name()
            )))
        }
    };
    Ok(TensorSlot::new(payload, false))
}

impl TensorTransfer {
    /// Receive all `keys` of `step_id` as one response, slots in key order.
    ///
    /// Every key is parsed and resolved before any lookup is issued; one bad
    /// key fails the whole call. `done` runs exactly once: with all N slots,
    /// or with the first failure. An empty key list answers at once with an
    /// empty response.
    pub fn fused_recv_tensor<F>(
        &self,
        step_id: i64,
        keys: &[String],
        options: &Arc<CallOptions>,
        done: F,
    ) where
        F: FnOnce(Result<FusedTensorResponse>) + Send + 'static,
    {
        if keys.is_empty() {
            done(Ok(FusedTensorResponse {
                slots: Vec::new(),
                send_start_micros: now_micros(),
            }));
            return;
        }

        let prepare_start = now_micros();
        let mut parsed = Vec::with_capacity(keys.len());
        let mut devices = Vec::with_capacity(keys.len());
        for key in keys {
            match self.prepare(key) {
                Ok((key, device)) => {
                    parsed.push(key);
                    devices.push(device);
                }
                Err(err) => {
                    self.reject_key(step_id, key, err, done);
                    return;
                }
            }
        }

        let num_keys = keys.len();
        options.set_cancel_callback(move || {
            warn!(step_id, num_keys, "fused-recv-tensor cancelled while waiting for values");
        });

        let options = options.clone();
        let scheduler = self.scheduler.clone();
        let trace_timing = self.trace_timing;
        let keys = keys.to_vec();
        self.rendezvous.fused_recv_local_async(
            step_id,
            &parsed,
            Box::new(move |result| {
                if trace_timing {
                    trace!(
                        step_id,
                        num_keys,
                        micros = now_micros() - prepare_start,
                        "fused-recv-tensor data prepare"
                    );
                }
                options.clear_cancel_callback();

                let received = match result {
                    Ok(received) if received.len() == num_keys => received,
                    Ok(received) => {
                        done(Err(WorkerError::Internal(format!(
                            "rendezvous returned {} values for {} keys",
                            received.len(),
                            num_keys
                        ))));
                        return;
                    }
                    Err(err) => {
                        done(Err(err));
                        return;
                    }
                };

                let batch = Arc::new(FusedBatch::new(num_keys));
                let barrier = {
                    let batch = batch.clone();
                    Arc::new(JoinBarrier::new(num_keys, move || done(batch.finish())))
                };

                for (index, ((item, device), key)) in
                    received.into_iter().zip(devices).zip(keys).enumerate()
                {
                    let batch = batch.clone();
                    let barrier = barrier.clone();
                    scheduler.schedule(Box::new(move || {
                        batch.fill(index, fill_slot(device.as_ref(), item, &key));
                        barrier.arrive();
                    }));
                }
            }),
        );
    }
}
