//! Single-shot fulfillable signals.
//!
//! A [`SyncPromise`] / [`SyncWaiter`] pair is the fence primitive used for
//! sync tokens, cookie observations, the ready-to-query future, and settle
//! waiters. Fulfillment is idempotent; dropping an unfulfilled promise
//! aborts its waiters so nobody parks forever on an abandoned fence.
//!
//! Coordination is plain [`Mutex`] + [`Condvar`]: the only blockers are
//! client threads that asked to wait, never the reconciliation worker.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use vigil_core::{WatchError, WatchResult};

#[derive(Debug, Clone)]
enum SignalState {
    Pending,
    Ready,
    Aborted(String),
}

#[derive(Debug)]
struct SignalInner {
    state: Mutex<SignalState>,
    cond: Condvar,
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The fulfillable side of a single-shot signal.
#[derive(Debug)]
pub struct SyncPromise {
    inner: Arc<SignalInner>,
}

impl SyncPromise {
    /// Mark the signal ready and wake all waiters. Idempotent; a no-op if
    /// the signal was already aborted.
    pub fn fulfill(self) {
        self.transition(SignalState::Ready);
    }

    /// Fail the signal with a reason and wake all waiters. A no-op if the
    /// signal was already fulfilled.
    pub fn abort(self, reason: impl Into<String>) {
        self.transition(SignalState::Aborted(reason.into()));
    }

    fn transition(&self, next: SignalState) {
        let mut state = lock_or_recover(&self.inner.state);
        if matches!(*state, SignalState::Pending) {
            *state = next;
            drop(state);
            self.inner.cond.notify_all();
        }
    }
}

impl Drop for SyncPromise {
    fn drop(&mut self) {
        self.transition(SignalState::Aborted(
            "promise abandoned before fulfillment".to_owned(),
        ));
    }
}

/// The waitable side of a single-shot signal. Cloneable; every clone
/// observes the same outcome.
#[derive(Debug, Clone)]
pub struct SyncWaiter {
    inner: Arc<SignalInner>,
}

impl SyncWaiter {
    /// An already-satisfied waiter.
    #[must_use]
    pub fn ready() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState::Ready),
                cond: Condvar::new(),
            }),
        }
    }

    /// Whether the signal has been fulfilled.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(*lock_or_recover(&self.inner.state), SignalState::Ready)
    }

    /// Block until the signal resolves or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`WatchError::SyncTimeout`] when the timeout elapses first;
    /// [`WatchError::SyncAborted`] when the promise was aborted or dropped.
    pub fn wait_for(&self, timeout: Duration) -> WatchResult<()> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut state = lock_or_recover(&self.inner.state);
        loop {
            match &*state {
                SignalState::Ready => return Ok(()),
                SignalState::Aborted(reason) => {
                    return Err(WatchError::SyncAborted {
                        reason: reason.clone(),
                    });
                }
                SignalState::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WatchError::SyncTimeout {
                    elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                    budget_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            let (next, _timeout_result) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = next;
        }
    }
}

/// Create a linked promise/waiter pair.
#[must_use]
pub fn pair() -> (SyncPromise, SyncWaiter) {
    let inner = Arc::new(SignalInner {
        state: Mutex::new(SignalState::Pending),
        cond: Condvar::new(),
    });
    (
        SyncPromise {
            inner: Arc::clone(&inner),
        },
        SyncWaiter { inner },
    )
}
