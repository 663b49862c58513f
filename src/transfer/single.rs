//! `recv-tensor`: one key, one value.

use std::sync::Arc;

use tracing::{trace, warn};

use super::copy::{decide, host_payload, stage_to_host, CopyDecision, Staging};
use super::{TensorPayload, TensorResponse, TensorSlot, TensorTransfer};
use crate::call::CallOptions;
use crate::error::{Result, WorkerError};
use crate::tensor::now_micros;

impl TensorTransfer {
    /// Receive the value published under `key` in `step_id`.
    ///
    /// `done` runs exactly once, on whichever thread produced the outcome:
    /// the caller's on a bad key, the producer's or the copy's otherwise.
    /// A cancellation of `options` while the lookup is pending is only
    /// logged; the lookup keeps going so a retried request can still use it.
    pub fn recv_tensor<F>(&self, step_id: i64, key: &str, options: &Arc<CallOptions>, done: F)
    where
        F: FnOnce(Result<TensorResponse>) + Send + 'static,
    {
        let (parsed, device) = match self.prepare(key) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.reject_key_or_abort(step_id, key, err, done);
                return;
            }
        };

        {
            let key = key.to_string();
            options.set_cancel_callback(move || {
                warn!(step_id, %key, "recv-tensor cancelled while waiting for value");
            });
        }

        let options = options.clone();
        let trace_timing = self.trace_timing;
        let key = key.to_string();
        self.rendezvous.recv_local_async(
            step_id,
            &parsed,
            Box::new(move |result| {
                options.clear_cancel_callback();
                let received = match result {
                    Ok(received) => received,
                    Err(err) => {
                        done(Err(err));
                        return;
                    }
                };

                let send_start_micros = now_micros();
                let is_dead = received.is_dead;
                let trace_key = key.clone();
                let respond = move |payload: Result<TensorPayload>| {
                    if trace_timing {
                        trace!(
                            step_id,
                            key = %trace_key,
                            micros = now_micros() - send_start_micros,
                            "recv-tensor lookup done to response send"
                        );
                    }
                    done(payload.map(|payload| TensorResponse {
                        slot: TensorSlot::new(payload, is_dead),
                        send_start_micros,
                    }));
                };

                if is_dead {
                    respond(Ok(host_payload(received.value)));
                    return;
                }

                let decision = decide(
                    device.as_ref(),
                    received.args.alloc_attrs,
                    received.value.dtype(),
                    Staging::Allowed,
                );
                match decision {
                    CopyDecision::UseAsIs => respond(Ok(TensorPayload::Tensor(received.value))),
                    CopyDecision::Serialize => {
                        respond(Ok(TensorPayload::Serialized(received.value.to_serialized())))
                    }
                    CopyDecision::StageToHost => {
                        stage_to_host(device, received, &key, move |copied| {
                            respond(copied.map(host_payload))
                        });
                    }
                    CopyDecision::Unsupported => respond(Err(WorkerError::UnsupportedConfiguration(
                        format!("cannot stage {} from {}", key, device.name()),
                    ))),
                }
            }),
        );
    }
}
