//! Conversation scripts and the directives they yield
//!
//! A script is an explicit state object. Each time the engine resumes it, the
//! script returns the next [`Directive`] or `None` once it has nothing left to
//! do. The [`Input`] passed in tells the script why it is running.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::event::Reply;
use super::matcher::ScopeMatcher;

/// Why a script is being resumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// First turn of the script
    Start,
    /// The event (or timeout) requested by the last `Receive`
    Reply(Reply),
    /// The last directive did not suspend, or a sub-script finished
    Continue,
    /// A background computation requested by `Await` finished
    Resumed,
}

impl Input {
    /// The reply carried by this input, if any
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            Self::Reply(reply) => Some(reply),
            _ => None,
        }
    }
}

/// Instruction a script hands back to the engine
pub enum Directive {
    /// Suspend until the next matched event or timeout
    Receive,
    /// Change which scopes the conversation listens to
    Retarget(ScopeMatcher),
    /// Change the timeout; `None` disables it
    SetTimeout(Option<Duration>),
    /// Suspend until the future finishes; events are not offered meanwhile
    Await(BoxFuture<'static, ()>),
    /// Send text to the conversation's current peer
    Emit(String),
    /// Decline the current event; `remove` ends the conversation
    NotMatched {
        /// Whether the conversation gives up entirely
        remove: bool,
    },
    /// Run a nested script to completion before continuing
    SubScript(Box<dyn Script>),
}

impl Directive {
    /// Send text
    pub fn emit(text: impl Into<String>) -> Self {
        Self::Emit(text.into())
    }

    /// Time out after `duration` without a consumed event
    pub fn timeout(duration: Duration) -> Self {
        if duration.is_zero() {
            Self::SetTimeout(None)
        } else {
            Self::SetTimeout(Some(duration))
        }
    }

    /// Disable the timeout
    pub fn timeout_off() -> Self {
        Self::SetTimeout(None)
    }

    /// Suspend for a fixed delay
    pub fn sleep(duration: Duration) -> Self {
        Self::Await(tokio::time::sleep(duration).boxed())
    }

    /// Suspend until a monotonic deadline
    pub fn sleep_until(deadline: Instant) -> Self {
        Self::Await(tokio::time::sleep_until(deadline).boxed())
    }

    /// Suspend on an async computation
    pub fn compute<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::Await(future.boxed())
    }

    /// Suspend on an async computation whose output lands in `slot`
    pub fn compute_into<T, F>(slot: &Slot<T>, future: F) -> Self
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let slot = slot.clone();
        Self::compute(async move {
            slot.fill(future.await);
        })
    }

    /// Suspend on blocking work run off the async workers
    pub fn run_blocking<T, F>(slot: &Slot<T>, work: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let slot = slot.clone();
        Self::compute(async move {
            match tokio::task::spawn_blocking(work).await {
                Ok(value) => {
                    slot.fill(value);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "blocking computation did not finish");
                }
            }
        })
    }

    /// Decline this event and keep waiting
    pub fn not_matched() -> Self {
        Self::NotMatched { remove: false }
    }

    /// Decline this event and end the conversation
    pub fn give_up() -> Self {
        Self::NotMatched { remove: true }
    }

    /// Nest a sub-script
    pub fn sub<S: Script>(script: S) -> Self {
        Self::SubScript(Box::new(script))
    }
}

impl fmt::Debug for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Receive => f.write_str("Receive"),
            Self::Retarget(matcher) => f.debug_tuple("Retarget").field(matcher).finish(),
            Self::SetTimeout(timeout) => f.debug_tuple("SetTimeout").field(timeout).finish(),
            Self::Await(_) => f.write_str("Await(..)"),
            Self::Emit(text) => f.debug_tuple("Emit").field(text).finish(),
            Self::NotMatched { remove } => {
                f.debug_struct("NotMatched").field("remove", remove).finish()
            }
            Self::SubScript(_) => f.write_str("SubScript(..)"),
        }
    }
}

/// A resumable conversation script
pub trait Script: Send + 'static {
    /// Advance to the next directive. `Ok(None)` means the script is done.
    fn resume(&mut self, input: Input) -> anyhow::Result<Option<Directive>>;
}

impl<F> Script for F
where
    F: FnMut(Input) -> anyhow::Result<Option<Directive>> + Send + 'static,
{
    fn resume(&mut self, input: Input) -> anyhow::Result<Option<Directive>> {
        self(input)
    }
}

/// Script that yields a fixed list of directives, ignoring replies
#[derive(Debug, Default)]
pub struct Sequence {
    directives: VecDeque<Directive>,
}

impl Script for Sequence {
    fn resume(&mut self, _input: Input) -> anyhow::Result<Option<Directive>> {
        Ok(self.directives.pop_front())
    }
}

/// Build a [`Sequence`] from directives
pub fn sequence(directives: impl IntoIterator<Item = Directive>) -> Sequence {
    Sequence {
        directives: directives.into_iter().collect(),
    }
}

/// Single-assignment cell shared between a computation and its script.
///
/// Cloning yields another handle to the same cell.
pub struct Slot<T> {
    value: Arc<Mutex<Option<T>>>,
}

impl<T> Slot<T> {
    /// Create an empty slot
    pub fn new() -> Self {
        Self {
            value: Arc::new(Mutex::new(None)),
        }
    }

    /// Store a value. Returns `false` and keeps the first value if already filled.
    pub fn fill(&self, value: T) -> bool {
        let mut slot = self.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        true
    }

    /// Take the value out, leaving the slot empty
    pub fn take(&self) -> Option<T> {
        self.value.lock().take()
    }

    /// Whether a value is present
    pub fn is_filled(&self) -> bool {
        self.value.lock().is_some()
    }
}

impl<T: Clone> Slot<T> {
    /// Copy of the stored value
    pub fn get(&self) -> Option<T> {
        self.value.lock().clone()
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
        }
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot").field(&*self.value.lock()).finish()
    }
}
