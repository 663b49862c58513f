//! Per-call options: the cancellation slot and timing delta.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct CancelSlot {
    callback: Option<CancelCallback>,
    cancelled: bool,
}

/// Options shared between a call's protocol and its transport.
///
/// Holds at most one cancellation callback. Firing and clearing are
/// serialised on the slot lock, so a callback cleared before the cancel
/// never runs and clearing after the cancel is a no-op. The callback runs
/// outside the lock: a clear racing the cancel may return while the
/// callback is still running.
#[derive(Default)]
pub struct CallOptions {
    slot: Mutex<CancelSlot>,
    delta_micros: AtomicI64,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the callback to run on cancellation, replacing any previous
    /// one.
    ///
    /// If the call was already cancelled the callback runs immediately.
    pub fn set_cancel_callback(&self, callback: impl FnOnce() + Send + 'static) {
        let mut slot = self.slot.lock();
        if slot.cancelled {
            drop(slot);
            callback();
            return;
        }
        slot.callback = Some(Box::new(callback));
    }

    /// Drop the registered callback, if any.
    pub fn clear_cancel_callback(&self) {
        let callback = self.slot.lock().callback.take();
        drop(callback);
    }

    /// Cancel the call: runs the registered callback once.
    ///
    /// Repeated cancels do nothing.
    pub fn start_cancel(&self) {
        let callback = {
            let mut slot = self.slot.lock();
            slot.cancelled = true;
            slot.callback.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.lock().cancelled
    }

    pub fn has_cancel_callback(&self) -> bool {
        self.slot.lock().callback.is_some()
    }

    /// Offset between the client's request stamp and this worker's clock,
    /// net of the estimated network latency.
    pub fn delta_micros(&self) -> i64 {
        self.delta_micros.load(Ordering::Relaxed)
    }

    pub fn set_delta_micros(&self, delta: i64) {
        self.delta_micros.store(delta, Ordering::Relaxed);
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("CallOptions")
            .field("cancelled", &slot.cancelled)
            .field("has_callback", &slot.callback.is_some())
            .field("delta_micros", &self.delta_micros())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_cancel_fires_once() {
        let opts = CallOptions::new();
        let (count, cb) = counter();
        opts.set_cancel_callback(cb);
        opts.start_cancel();
        opts.start_cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(opts.is_cancelled());
        assert!(!opts.has_cancel_callback());
    }

    #[test]
    fn test_cancel_after_clear_is_noop() {
        let opts = CallOptions::new();
        let (count, cb) = counter();
        opts.set_cancel_callback(cb);
        opts.clear_cancel_callback();
        opts.start_cancel();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_after_fire_is_safe() {
        let opts = CallOptions::new();
        let (count, cb) = counter();
        opts.set_cancel_callback(cb);
        opts.start_cancel();
        opts.clear_cancel_callback();
        opts.clear_cancel_callback();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_after_cancel_fires_immediately() {
        let opts = CallOptions::new();
        opts.start_cancel();
        let (count, cb) = counter();
        opts.set_cancel_callback(cb);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!opts.has_cancel_callback());
    }

    #[test]
    fn test_callback_may_touch_options() {
        let opts = Arc::new(CallOptions::new());
        let inner = opts.clone();
        opts.set_cancel_callback(move || inner.clear_cancel_callback());
        opts.start_cancel();
        assert!(opts.is_cancelled());
    }

    #[test]
    fn test_concurrent_cancel_and_clear() {
        for _ in 0..100 {
            let opts = Arc::new(CallOptions::new());
            let (count, cb) = counter();
            opts.set_cancel_callback(cb);

            let a = opts.clone();
            let b = opts.clone();
            let t1 = std::thread::spawn(move || a.start_cancel());
            let t2 = std::thread::spawn(move || b.clear_cancel_callback());
            t1.join().unwrap();
            t2.join().unwrap();

            assert!(count.load(Ordering::SeqCst) <= 1);
        }
    }

    #[test]
    fn test_clear_does_not_wait_for_running_callback() {
        let opts = Arc::new(CallOptions::new());
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        opts.set_cancel_callback(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });

        let canceller = opts.clone();
        let cancel = std::thread::spawn(move || canceller.start_cancel());
        started_rx.recv().unwrap();

        // callback is mid-flight; clearing returns without it
        opts.clear_cancel_callback();
        assert!(!opts.has_cancel_callback());
        assert!(opts.is_cancelled());

        release_tx.send(()).unwrap();
        cancel.join().unwrap();
    }

    #[test]
    fn test_delta_micros() {
        let opts = CallOptions::new();
        assert_eq!(opts.delta_micros(), 0);
        opts.set_delta_micros(-120);
        assert_eq!(opts.delta_micros(), -120);
    }
}
