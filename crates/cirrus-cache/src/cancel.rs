use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use cirrus_types::{CirrusError, Result};

/// Cooperative cancellation token shared between the cache façade and its
/// background loops.
///
/// Cancellation is one-way and sticky. Long operations call [`check`] at
/// suspension points; backoff and poll sleeps go through [`sleep`], which
/// wakes promptly when the token trips.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    state: Mutex<bool>,
    wake: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token and wake every sleeper.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let mut flag = self.inner.state.lock().unwrap();
        *flag = true;
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` when the token has tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(CirrusError::Cancelled);
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `true` when the full duration elapsed, `false` when the sleep
    /// was interrupted by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut flag = self.inner.state.lock().unwrap();
        let deadline = std::time::Instant::now() + duration;
        while !*flag {
            let now = std::time::Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, timeout) = self
                .inner
                .wake
                .wait_timeout(flag, deadline - now)
                .unwrap();
            flag = guard;
            if timeout.timed_out() {
                return !*flag;
            }
        }
        false
    }
}
