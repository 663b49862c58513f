//! Join barrier for fan-in completions.
//!
//! A [`JoinBarrier`] is created for `n` parties with a finalize closure.
//! Each party calls [`arrive`](JoinBarrier::arrive) exactly once, from any
//! thread. The party whose arrival brings the count to zero runs the
//! closure; nobody else ever does.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use rendezvous_worker::JoinBarrier;
//!
//! let fired = Arc::new(AtomicUsize::new(0));
//! let counter = fired.clone();
//! let barrier = JoinBarrier::new(2, move || {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! assert!(!barrier.arrive());
//! assert!(barrier.arrive());
//! assert_eq!(fired.load(Ordering::SeqCst), 1);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

type Finalize = Box<dyn FnOnce() + Send + 'static>;

/// Counts down `n` arrivals and finalizes exactly once.
pub struct JoinBarrier {
    remaining: AtomicUsize,
    finalize: Mutex<Option<Finalize>>,
}

impl JoinBarrier {
    /// Create a barrier for `parties` arrivals.
    ///
    /// A barrier for zero parties finalizes immediately.
    pub fn new(parties: usize, finalize: impl FnOnce() + Send + 'static) -> Self {
        if parties == 0 {
            finalize();
            return Self {
                remaining: AtomicUsize::new(0),
                finalize: Mutex::new(None),
            };
        }
        Self {
            remaining: AtomicUsize::new(parties),
            finalize: Mutex::new(Some(Box::new(finalize))),
        }
    }

    /// Record one arrival. Returns `true` for the arrival that finalized.
    ///
    /// Arrivals beyond the party count are ignored and return `false`.
    pub fn arrive(&self) -> bool {
        // Release publishes this party's writes; Acquire on the last
        // decrement makes everyone's writes visible to finalize.
        let prev = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => {
                let finalize = self.finalize.lock().take();
                if let Some(finalize) = finalize {
                    finalize();
                }
                true
            }
            Ok(_) => false,
            Err(_) => {
                tracing::error!("join barrier arrival after completion ignored");
                false
            }
        }
    }

    /// Arrivals still outstanding.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }
}

impl fmt::Debug for JoinBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinBarrier")
            .field("remaining", &self.remaining())
            .finish()
    }
}
