//! Registry of pending waits
//!
//! A wait is a registered interest in future events. Incoming events are
//! offered to waits from the most recently registered to the oldest; the
//! first wait whose resume function consumes the event stops the scan.
//!
//! Each wait carries an execution guard so that a single wait never runs two
//! resumes at once, plus an [`EpochClock`] that invalidates stale timers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::error::Fault;
use super::event::{Message, Scope, WaitId};
use super::matcher::ScopeMatcher;
use super::scheduler::{EpochClock, RETRY_DELAY, Scheduler};

/// Outcome of offering an event to a wait.
///
/// Encodes two independent bits: whether the event was consumed (stop
/// dispatch) and whether the wait is done (remove).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitResult {
    /// Not consumed; the wait stays registered
    PassThrough,
    /// Consumed; the wait stays registered with its timeout reset
    Suspend,
    /// Not consumed; the wait gives up and is removed
    Reject,
    /// Consumed; the wait is finished and removed
    Complete,
}

impl WaitResult {
    /// Build a result from its two bits
    pub fn from_bits(stop_dispatch: bool, remove: bool) -> Self {
        match (stop_dispatch, remove) {
            (false, false) => Self::PassThrough,
            (true, false) => Self::Suspend,
            (false, true) => Self::Reject,
            (true, true) => Self::Complete,
        }
    }

    /// Whether the event was consumed
    pub fn stops_dispatch(self) -> bool {
        matches!(self, Self::Suspend | Self::Complete)
    }

    /// Whether the wait must leave the registry
    pub fn removes(self) -> bool {
        matches!(self, Self::Reject | Self::Complete)
    }
}

/// What one dispatch did
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    /// Wait that consumed the event, if any
    pub consumed: Option<WaitId>,
    /// Failures contained while resuming waits for this event
    pub faults: Vec<Fault>,
}

type ResumeFn = Box<dyn FnMut(&Scope, &Message) -> WaitResult + Send>;
type TimeoutFn = Box<dyn FnOnce() + Send>;

struct WaitBody {
    resume: ResumeFn,
    last_activity: Instant,
}

struct Wait {
    id: WaitId,
    matcher: ScopeMatcher,
    timeout: Option<Duration>,
    body: Mutex<WaitBody>,
    on_timeout: Mutex<Option<TimeoutFn>>,
    clock: EpochClock,
    closed: AtomicBool,
    /// Failure contained by the resume currently running, if any
    fault: Mutex<Option<Fault>>,
}

impl Wait {
    fn close(&self) -> bool {
        let was_open = !self.closed.swap(true, Ordering::SeqCst);
        self.clock.advance();
        was_open
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct RegistryInner {
    waits: RwLock<Vec<Arc<Wait>>>,
    next_id: AtomicU64,
    scheduler: Scheduler,
    faults: broadcast::Sender<Fault>,
}

impl RegistryInner {
    fn detach(&self, id: WaitId) -> Option<Arc<Wait>> {
        let mut waits = self.waits.write();
        let index = waits.iter().position(|wait| wait.id == id)?;
        Some(waits.remove(index))
    }

    /// Run one resume under the wait's guard. `None` means the wait was
    /// skipped without running.
    fn offer(
        self: &Arc<Self>,
        wait: &Arc<Wait>,
        scope: &Scope,
        message: &Message,
    ) -> Option<WaitResult> {
        let mut body = wait.body.lock();
        if wait.is_closed() {
            return None;
        }
        if let Some(timeout) = wait.timeout {
            // Deadline passed but the timer has not fired yet.
            if body.last_activity.elapsed() >= timeout {
                return None;
            }
        }

        let result = (body.resume)(scope, message);
        match result {
            WaitResult::Reject | WaitResult::Complete => {
                wait.close();
            }
            WaitResult::Suspend => {
                body.last_activity = Instant::now();
                self.arm(wait);
            }
            WaitResult::PassThrough => {}
        }
        Some(result)
    }

    fn arm(self: &Arc<Self>, wait: &Arc<Wait>) {
        let Some(timeout) = wait.timeout else {
            return;
        };
        let epoch = wait.clock.advance();
        let timer = self.schedule_expiry(wait, timeout, epoch);
        wait.clock.arm(timer);
    }

    fn schedule_expiry(
        self: &Arc<Self>,
        wait: &Arc<Wait>,
        delay: Duration,
        epoch: u64,
    ) -> AbortHandle {
        let registry = Arc::downgrade(self);
        let target = Arc::downgrade(wait);
        self.scheduler.after(delay, move || {
            expire(&registry, &target, epoch);
        })
    }

    fn expire(self: &Arc<Self>, wait: &Arc<Wait>, epoch: u64) {
        let Some(body) = wait.body.try_lock() else {
            // Mid-resume. Check again shortly without replacing the armed
            // timer; a resume that suspends moves the epoch on and voids
            // the retry.
            self.schedule_expiry(wait, RETRY_DELAY, epoch);
            return;
        };
        if !wait.clock.is_current(epoch) || wait.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(body);

        self.detach(wait.id);
        tracing::debug!(wait = %wait.id, "wait timed out");
        let callback = wait.on_timeout.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

fn expire(registry: &Weak<RegistryInner>, wait: &Weak<Wait>, epoch: u64) {
    if let (Some(registry), Some(wait)) = (registry.upgrade(), wait.upgrade()) {
        registry.expire(&wait, epoch);
    }
}

/// Shared registry of pending waits.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct WaitRegistry {
    inner: Arc<RegistryInner>,
}

impl WaitRegistry {
    /// Create an empty registry
    pub fn new(scheduler: Scheduler, fault_capacity: usize) -> Self {
        let (faults, _) = broadcast::channel(fault_capacity.max(1));
        Self {
            inner: Arc::new(RegistryInner {
                waits: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                scheduler,
                faults,
            }),
        }
    }

    /// Register a wait without a timeout
    pub fn register<F>(&self, matcher: ScopeMatcher, resume: F) -> WaitId
    where
        F: FnMut(&Scope, &Message) -> WaitResult + Send + 'static,
    {
        self.insert(matcher, None, Box::new(resume), None)
    }

    /// Register a wait that expires after `timeout` without a consumed event.
    ///
    /// A zero timeout registers a plain wait and drops `on_timeout`.
    pub fn register_with_timeout<F, T>(
        &self,
        matcher: ScopeMatcher,
        timeout: Duration,
        resume: F,
        on_timeout: T,
    ) -> WaitId
    where
        F: FnMut(&Scope, &Message) -> WaitResult + Send + 'static,
        T: FnOnce() + Send + 'static,
    {
        if timeout.is_zero() {
            return self.register(matcher, resume);
        }
        self.insert(
            matcher,
            Some(timeout),
            Box::new(resume),
            Some(Box::new(on_timeout)),
        )
    }

    fn insert(
        &self,
        matcher: ScopeMatcher,
        timeout: Option<Duration>,
        resume: ResumeFn,
        on_timeout: Option<TimeoutFn>,
    ) -> WaitId {
        let id = WaitId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let wait = Arc::new(Wait {
            id,
            matcher,
            timeout,
            body: Mutex::new(WaitBody {
                resume,
                last_activity: Instant::now(),
            }),
            on_timeout: Mutex::new(on_timeout),
            clock: EpochClock::new(),
            closed: AtomicBool::new(false),
            fault: Mutex::new(None),
        });

        self.inner.waits.write().push(wait.clone());
        self.inner.arm(&wait);
        tracing::debug!(wait = %id, timeout = ?timeout, "registered wait");
        id
    }

    /// Remove a wait. Returns `false` if it was already gone.
    pub fn unregister(&self, id: WaitId) -> bool {
        match self.inner.detach(id) {
            Some(wait) => {
                wait.close();
                tracing::debug!(wait = %id, "unregistered wait");
                true
            }
            None => false,
        }
    }

    /// Offer an event to every matching wait, newest first.
    ///
    /// Returns the wait that consumed the event, if any. Resume functions
    /// must not panic; no registry lock is held while they run.
    pub fn dispatch(&self, scope: &Scope, message: &Message) -> Option<WaitId> {
        self.dispatch_outcome(scope, message).consumed
    }

    /// Like [`dispatch`](Self::dispatch), also collecting the failures
    /// resume functions contained and reported for this event.
    pub fn dispatch_outcome(&self, scope: &Scope, message: &Message) -> DispatchOutcome {
        let snapshot: Vec<Arc<Wait>> = self.inner.waits.read().clone();
        let mut outcome = DispatchOutcome::default();

        for wait in snapshot.iter().rev() {
            if !wait.matcher.matches(Some(scope)) {
                continue;
            }
            let result = self.inner.offer(wait, scope, message);
            if let Some(fault) = wait.fault.lock().take() {
                outcome.faults.push(fault);
            }
            let Some(result) = result else {
                continue;
            };
            if result.removes() && self.inner.detach(wait.id).is_some() {
                tracing::debug!(wait = %wait.id, result = ?result, "wait finished");
            }
            if result.stops_dispatch() {
                outcome.consumed = Some(wait.id);
                break;
            }
        }
        outcome
    }

    /// Whether a wait is still registered
    pub fn contains(&self, id: WaitId) -> bool {
        self.inner.waits.read().iter().any(|wait| wait.id == id)
    }

    /// Number of registered waits
    pub fn len(&self) -> usize {
        self.inner.waits.read().len()
    }

    /// Whether no wait is registered
    pub fn is_empty(&self) -> bool {
        self.inner.waits.read().is_empty()
    }

    /// Remove every wait without running timeout callbacks
    pub fn clear(&self) {
        let drained: Vec<Arc<Wait>> = std::mem::take(&mut *self.inner.waits.write());
        for wait in &drained {
            wait.close();
        }
        tracing::debug!(count = drained.len(), "cleared waits");
    }

    /// Subscribe to contained conversation failures
    pub fn subscribe_faults(&self) -> broadcast::Receiver<Fault> {
        self.inner.faults.subscribe()
    }

    /// Broadcast a contained failure to subscribers.
    ///
    /// A fault naming a still-registered wait is also handed to the
    /// dispatch that is resuming it, see [`dispatch_outcome`](Self::dispatch_outcome).
    pub fn report_fault(&self, fault: Fault) {
        if let Some(id) = fault.wait {
            let wait = self
                .inner
                .waits
                .read()
                .iter()
                .find(|wait| wait.id == id)
                .cloned();
            if let Some(wait) = wait {
                *wait.fault.lock() = Some(fault.clone());
            }
        }
        // No subscribers is fine.
        let _ = self.inner.faults.send(fault);
    }

    /// Scheduler used for timers and background work
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }
}

impl std::fmt::Debug for WaitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitRegistry")
            .field("waits", &self.len())
            .finish()
    }
}
