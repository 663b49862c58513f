//! In-memory rendezvous table.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{FusedRecvCallback, Received, RecvCallback, RendezvousArgs, RendezvousKey, RendezvousStore};
use crate::barrier::JoinBarrier;
use crate::error::{Result, WorkerError};
use crate::tensor::Tensor;

type TableKey = (i64, String);

#[derive(Default)]
struct Table {
    ready: HashMap<TableKey, Received>,
    waiting: HashMap<TableKey, VecDeque<RecvCallback>>,
    aborted: HashMap<i64, String>,
}

impl Table {
    /// Pull every waiter registered for `step_id`.
    fn drain_waiters(&mut self, step_id: i64) -> Vec<RecvCallback> {
        let keys: Vec<TableKey> = self
            .waiting
            .keys()
            .filter(|(step, _)| *step == step_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|k| self.waiting.remove(&k))
            .flatten()
            .collect()
    }
}

/// Rendezvous for one worker process.
///
/// Values are keyed by `(step_id, key)`. A send either completes the oldest
/// waiting receive for that key or parks the value until a receive arrives.
/// Callbacks always run after the table lock is released.
#[derive(Default)]
pub struct LocalRendezvous {
    table: Mutex<Table>,
}

impl LocalRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `value` under `key` for `step_id`.
    ///
    /// # Errors
    ///
    /// Fails if the step was aborted or a value is already parked under the
    /// same key.
    pub fn send(
        &self,
        step_id: i64,
        key: &RendezvousKey,
        args: RendezvousArgs,
        value: Tensor,
    ) -> Result<()> {
        self.publish(step_id, key, Received::new(args, value, false))
    }

    /// Publish "no value" under `key`; the receiver gets an empty tensor with
    /// `is_dead` set.
    pub fn send_dead(&self, step_id: i64, key: &RendezvousKey, args: RendezvousArgs) -> Result<()> {
        self.publish(step_id, key, Received::dead(args))
    }

    fn publish(&self, step_id: i64, key: &RendezvousKey, mut item: Received) -> Result<()> {
        if item.args.rendezvous_micros == 0 {
            item.args.rendezvous_micros = crate::tensor::now_micros();
        }

        let table_key = (step_id, key.as_str().to_string());
        let waiter = {
            let mut table = self.table.lock();
            if let Some(reason) = table.aborted.get(&step_id) {
                return Err(WorkerError::Aborted {
                    step_id,
                    reason: reason.clone(),
                });
            }
            let waiter = match table.waiting.get_mut(&table_key) {
                Some(queue) => {
                    let waiter = queue.pop_front();
                    if queue.is_empty() {
                        table.waiting.remove(&table_key);
                    }
                    waiter
                }
                None => None,
            };
            match waiter {
                Some(waiter) => waiter,
                None => {
                    if table.ready.contains_key(&table_key) {
                        return Err(WorkerError::Rendezvous {
                            step_id,
                            message: format!("duplicate send for key {}", key),
                        });
                    }
                    table.ready.insert(table_key, item);
                    return Ok(());
                }
            }
        };

        waiter(Ok(item));
        Ok(())
    }

    /// Abort `step_id`: pending and future receives fail with `reason`.
    pub fn abort_step(&self, step_id: i64, reason: impl Into<String>) {
        let reason = reason.into();
        let waiters = {
            let mut table = self.table.lock();
            table.ready.retain(|(step, _), _| *step != step_id);
            table.aborted.insert(step_id, reason.clone());
            table.drain_waiters(step_id)
        };

        debug!(step_id, waiters = waiters.len(), %reason, "rendezvous step aborted");
        for waiter in waiters {
            waiter(Err(WorkerError::Aborted {
                step_id,
                reason: reason.clone(),
            }));
        }
    }

    /// Forget everything about `step_id`, failing receives still waiting.
    pub fn cleanup_step(&self, step_id: i64) {
        let waiters = {
            let mut table = self.table.lock();
            table.ready.retain(|(step, _), _| *step != step_id);
            table.aborted.remove(&step_id);
            table.drain_waiters(step_id)
        };

        for waiter in waiters {
            waiter(Err(WorkerError::Aborted {
                step_id,
                reason: "step cleaned up".to_string(),
            }));
        }
    }

    /// Values parked without a receiver.
    pub fn ready_count(&self) -> usize {
        self.table.lock().ready.len()
    }

    /// Receives parked without a value.
    pub fn waiting_count(&self) -> usize {
        self.table.lock().waiting.values().map(VecDeque::len).sum()
    }
}

impl RendezvousStore for LocalRendezvous {
    fn recv_local_async(&self, step_id: i64, key: &RendezvousKey, done: RecvCallback) {
        let table_key = (step_id, key.as_str().to_string());
        let outcome = {
            let mut table = self.table.lock();
            if let Some(reason) = table.aborted.get(&step_id) {
                Err(WorkerError::Aborted {
                    step_id,
                    reason: reason.clone(),
                })
            } else if let Some(item) = table.ready.remove(&table_key) {
                Ok(item)
            } else {
                table.waiting.entry(table_key).or_default().push_back(done);
                return;
            }
        };
        done(outcome);
    }

    fn fused_recv_local_async(&self, step_id: i64, keys: &[RendezvousKey], done: FusedRecvCallback) {
        let slots: Arc<Vec<Mutex<Option<Received>>>> =
            Arc::new(keys.iter().map(|_| Mutex::new(None)).collect());
        let first_error: Arc<Mutex<Option<WorkerError>>> = Arc::new(Mutex::new(None));

        let barrier = {
            let slots = slots.clone();
            let first_error = first_error.clone();
            Arc::new(JoinBarrier::new(keys.len(), move || {
                if let Some(err) = first_error.lock().take() {
                    done(Err(err));
                    return;
                }
                let values: Option<Vec<Received>> =
                    slots.iter().map(|slot| slot.lock().take()).collect();
                match values {
                    Some(values) => done(Ok(values)),
                    None => done(Err(WorkerError::Internal(
                        "fused receive finished with an empty slot".to_string(),
                    ))),
                }
            }))
        };

        for (index, key) in keys.iter().enumerate() {
            let slots = slots.clone();
            let first_error = first_error.clone();
            let barrier = barrier.clone();
            self.recv_local_async(
                step_id,
                key,
                Box::new(move |outcome| {
                    match outcome {
                        Ok(item) => *slots[index].lock() = Some(item),
                        Err(err) => {
                            first_error.lock().get_or_insert(err);
                        }
                    }
                    barrier.arrive();
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::FrameAndIter;
    use crate::tensor::DataType;
    use bytes::Bytes;
    use tokio::sync::oneshot;

    const CPU0: &str = "/job:worker/replica:0/task:0/device:CPU:0";

    fn key(edge: &str) -> RendezvousKey {
        RendezvousKey::parse(&RendezvousKey::create(
            CPU0,
            1,
            CPU0,
            edge,
            FrameAndIter::default(),
        ))
        .unwrap()
    }

    fn scalar(v: i32) -> Tensor {
        Tensor::from_bytes(
            DataType::Int32,
            vec![1u64],
            Bytes::copy_from_slice(&v.to_le_bytes()),
        )
        .unwrap()
    }

    fn recv(store: &LocalRendezvous, step: i64, k: &RendezvousKey) -> oneshot::Receiver<Result<Received>> {
        let (tx, rx) = oneshot::channel();
        store.recv_local_async(
            step,
            k,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        rx
    }

    #[tokio::test]
    async fn test_send_then_recv() {
        let store = LocalRendezvous::new();
        store.send(7, &key("a"), RendezvousArgs::host(), scalar(5)).unwrap();
        assert_eq!(store.ready_count(), 1);

        let got = recv(&store, 7, &key("a")).await.unwrap().unwrap();
        assert_eq!(got.value, scalar(5));
        assert!(!got.is_dead);
        assert!(got.args.rendezvous_micros > 0);
        assert_eq!(store.ready_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_then_send() {
        let store = LocalRendezvous::new();
        let rx = recv(&store, 7, &key("a"));
        assert_eq!(store.waiting_count(), 1);

        store.send(7, &key("a"), RendezvousArgs::host(), scalar(9)).unwrap();
        let got = rx.await.unwrap().unwrap();
        assert_eq!(got.value, scalar(9));
        assert_eq!(store.waiting_count(), 0);
    }

    #[tokio::test]
    async fn test_steps_are_separate() {
        let store = LocalRendezvous::new();
        store.send(1, &key("a"), RendezvousArgs::host(), scalar(1)).unwrap();
        let mut rx = recv(&store, 2, &key("a"));
        assert!(rx.try_recv().is_err());
        assert_eq!(store.ready_count(), 1);
        assert_eq!(store.waiting_count(), 1);
    }

    #[tokio::test]
    async fn test_send_dead() {
        let store = LocalRendezvous::new();
        store.send_dead(3, &key("gone"), RendezvousArgs::host()).unwrap();
        let got = recv(&store, 3, &key("gone")).await.unwrap().unwrap();
        assert!(got.is_dead);
        assert!(got.value.is_empty());
    }

    #[test]
    fn test_duplicate_send_rejected() {
        let store = LocalRendezvous::new();
        store.send(1, &key("a"), RendezvousArgs::host(), scalar(1)).unwrap();
        let err = store
            .send(1, &key("a"), RendezvousArgs::host(), scalar(2))
            .unwrap_err();
        assert!(matches!(err, WorkerError::Rendezvous { step_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_abort_fails_pending_and_future() {
        let store = LocalRendezvous::new();
        let pending = recv(&store, 4, &key("a"));
        store.abort_step(4, "cancelled by master");

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, WorkerError::Aborted { step_id: 4, ref reason } if reason == "cancelled by master"));

        let later = recv(&store, 4, &key("b")).await.unwrap().unwrap_err();
        assert!(matches!(later, WorkerError::Aborted { .. }));
        assert!(store.send(4, &key("c"), RendezvousArgs::host(), scalar(0)).is_err());
    }

    #[tokio::test]
    async fn test_cleanup_clears_abort_mark() {
        let store = LocalRendezvous::new();
        store.abort_step(5, "x");
        store.cleanup_step(5);
        store.send(5, &key("a"), RendezvousArgs::host(), scalar(3)).unwrap();
        assert!(recv(&store, 5, &key("a")).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fused_in_key_order() {
        let store = Arc::new(LocalRendezvous::new());
        let keys = vec![key("a"), key("b"), key("c")];
        store.send(8, &keys[1], RendezvousArgs::host(), scalar(2)).unwrap();

        let (tx, rx) = oneshot::channel();
        store.fused_recv_local_async(
            8,
            &keys,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );

        store.send(8, &keys[2], RendezvousArgs::host(), scalar(3)).unwrap();
        store.send_dead(8, &keys[0], RendezvousArgs::host()).unwrap();

        let got = rx.await.unwrap().unwrap();
        assert_eq!(got.len(), 3);
        assert!(got[0].is_dead);
        assert_eq!(got[1].value, scalar(2));
        assert_eq!(got[2].value, scalar(3));
    }

    #[tokio::test]
    async fn test_fused_reports_first_failure_once() {
        let store = LocalRendezvous::new();
        let keys = vec![key("a"), key("b")];
        store.send(9, &keys[0], RendezvousArgs::host(), scalar(1)).unwrap();

        let (tx, rx) = oneshot::channel();
        store.fused_recv_local_async(
            9,
            &keys,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        store.abort_step(9, "failed");

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, WorkerError::Aborted { step_id: 9, .. }));
    }

    #[tokio::test]
    async fn test_fused_empty_completes() {
        let store = LocalRendezvous::new();
        let (tx, rx) = oneshot::channel();
        store.fused_recv_local_async(
            1,
            &[],
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        assert!(rx.await.unwrap().unwrap().is_empty());
    }
}
