//! Delayed actions, background work, and epoch-based timer invalidation
//!
//! Timers are never cancelled for correctness. Each timer captures the epoch
//! that was current when it was armed and does nothing if the epoch has moved
//! on by the time it fires. Aborting the previous timer is only an
//! optimisation that keeps stale tasks from piling up.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::error::{EngineError, Result};

/// Delay before a timer that found its target mid-turn checks again
pub(crate) const RETRY_DELAY: Duration = Duration::from_millis(1);

/// Spawns delayed actions and background computations on a tokio runtime
#[derive(Clone, Debug)]
pub struct Scheduler {
    handle: Handle,
    grace: Duration,
}

impl Scheduler {
    /// Create a scheduler on an explicit runtime handle
    pub fn new(handle: Handle, grace: Duration) -> Self {
        Self { handle, grace }
    }

    /// Create a scheduler on the runtime the caller is running in
    pub fn current(grace: Duration) -> Result<Self> {
        let handle =
            Handle::try_current().map_err(|err| EngineError::NoRuntime(err.to_string()))?;
        Ok(Self::new(handle, grace))
    }

    /// Grace period added to every delay
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Underlying runtime handle
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `action` once `delay` plus the grace period has elapsed.
    ///
    /// The grace avoids boundary ties with a reply arriving at almost exactly
    /// the deadline.
    pub fn after<F>(&self, delay: Duration, action: F) -> AbortHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay + self.grace;
        self.handle
            .spawn(async move {
                tokio::time::sleep_until(deadline).await;
                action();
            })
            .abort_handle()
    }

    /// Drive `work` to completion, then run `continuation`
    pub fn spawn_background<Fut, F>(&self, work: Fut, continuation: F)
    where
        Fut: Future<Output = ()> + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move {
            work.await;
            continuation();
        });
    }
}

/// Per-wait (or per-conversation) epoch counter plus the most recent timer
#[derive(Debug, Default)]
pub struct EpochClock {
    epoch: AtomicU64,
    timer: Mutex<Option<AbortHandle>>,
}

impl EpochClock {
    /// Create a clock at epoch zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current epoch
    pub fn current(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether `epoch` is still the current one
    pub fn is_current(&self, epoch: u64) -> bool {
        self.current() == epoch
    }

    /// Move to the next epoch, invalidating every timer armed so far
    pub fn advance(&self) -> u64 {
        let next = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = self.timer.lock().take() {
            previous.abort();
        }
        next
    }

    /// Remember the timer armed for the current epoch
    pub fn arm(&self, timer: AbortHandle) {
        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_epoch_advance_invalidates() {
        let clock = EpochClock::new();
        let armed_at = clock.current();
        assert!(clock.is_current(armed_at));

        let next = clock.advance();
        assert_eq!(next, armed_at + 1);
        assert!(!clock.is_current(armed_at));
    }

    #[tokio::test]
    async fn test_after_includes_grace() {
        tokio::time::pause();
        let scheduler = Scheduler::current(Duration::from_millis(10)).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        scheduler.after(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(105)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "grace not yet elapsed");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_advance_aborts_armed_timer() {
        tokio::time::pause();
        let scheduler = Scheduler::current(Duration::ZERO).unwrap();
        let clock = EpochClock::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        clock.arm(scheduler.after(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        clock.advance();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
