use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use termcast_common::mutex_lock_or_recover;

/// Lifetime token shared between a session and its timers.
///
/// Timer callbacks check [`CancellationToken::is_cancelled`] before acting;
/// teardown cancels the token before the session leaves the registry.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let _guard = mutex_lock_or_recover(&self.inner.lock);
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `timeout` or until cancelled; returns true when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = mutex_lock_or_recover(&self.inner.lock);
        if self.is_cancelled() {
            return true;
        }
        let result = self
            .inner
            .wake
            .wait_timeout_while(guard, timeout, |_| !self.is_cancelled());
        drop(result);
        self.is_cancelled()
    }
}
