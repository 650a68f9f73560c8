//! Resumable conversations driven through the wait registry
//!
//! A conversation owns a chain of frames: the root script plus at most one
//! active sub-script per level. The chain is a simple path, never a tree.
//! Each turn feeds one input to the innermost frame and advances scripts
//! until one of them suspends or the root runs out of directives.
//!
//! The root holds a single mutex around its frames. Message delivery blocks
//! on it, timers only `try_lock` it, and background continuations block on
//! it after clearing the `skip` flag. A conversation therefore never runs two
//! turns at once, and a timer never interrupts a turn in progress.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use super::error::{EngineError, Fault, Result, panic_message};
use super::event::{ConversationId, Message, Reply, Scope, WaitId};
use super::matcher::ScopeMatcher;
use super::outbox::Outbox;
use super::registry::{WaitRegistry, WaitResult};
use super::scheduler::{EpochClock, RETRY_DELAY};
use super::script::{Directive, Input, Script};

/// Collaborators every conversation needs
#[derive(Clone)]
pub(crate) struct ConversationContext {
    pub(crate) registry: WaitRegistry,
    pub(crate) outbox: Arc<dyn Outbox>,
    pub(crate) max_depth: usize,
}

#[derive(Debug, Clone, Copy)]
enum Event<'a> {
    Start,
    Message(&'a Scope, &'a Message),
    Timeout,
    Resumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Start,
    Receive,
    Computation,
}

enum Turn {
    /// Script exhausted
    Done,
    /// Gave up via `NotMatched { remove: true }`
    GaveUp,
    /// Waiting for the next event; `declined` when the current one was refused
    Receiving { declined: bool },
    /// Waiting for a background computation
    Awaiting(BoxFuture<'static, ()>),
}

struct TurnContext<'a> {
    conversation: ConversationId,
    outbox: &'a dyn Outbox,
    reply_to: Option<Scope>,
    max_depth: usize,
}

impl TurnContext<'_> {
    fn emit(&self, text: &str) {
        let Some(scope) = self.reply_to else {
            tracing::warn!(conversation = %self.conversation, "no peer to send to, dropping text");
            return;
        };
        if let Err(err) = self.outbox.send(&scope, text) {
            tracing::warn!(
                conversation = %self.conversation,
                scope = %scope,
                error = %err,
                "send failed"
            );
        }
    }

    fn malformed(&self, detail: String) -> EngineError {
        EngineError::MalformedScript {
            conversation: self.conversation,
            detail,
        }
    }
}

struct Frame {
    script: Box<dyn Script>,
    matcher: ScopeMatcher,
    timeout: Option<Duration>,
    pending: Pending,
    child: Option<Box<Frame>>,
    depth: usize,
}

impl Frame {
    fn new(
        script: Box<dyn Script>,
        matcher: ScopeMatcher,
        timeout: Option<Duration>,
        depth: usize,
    ) -> Self {
        Self {
            script,
            matcher,
            timeout,
            pending: Pending::Start,
            child: None,
            depth,
        }
    }

    /// Innermost active frame
    fn active(&self) -> &Frame {
        match &self.child {
            Some(child) => child.active(),
            None => self,
        }
    }

    fn step(&mut self, event: Event<'_>, cx: &mut TurnContext<'_>) -> Result<Turn> {
        if let Some(child) = self.child.as_mut() {
            return match child.step(event, cx)? {
                Turn::Done => {
                    self.child = None;
                    self.advance(Input::Continue, cx)
                }
                Turn::GaveUp => {
                    self.child = None;
                    Ok(Turn::GaveUp)
                }
                turn => Ok(turn),
            };
        }

        let input = match (self.pending, event) {
            (Pending::Start, Event::Start) => Input::Start,
            (Pending::Receive, Event::Message(scope, message)) => {
                Input::Reply(Reply::delivered(*scope, message.clone()))
            }
            (Pending::Receive, Event::Timeout) => Input::Reply(Reply::timed_out()),
            (Pending::Computation, Event::Resumed) => Input::Resumed,
            (pending, event) => {
                return Err(cx.malformed(format!("{event:?} delivered while {pending:?}")));
            }
        };
        self.advance(input, cx)
    }

    fn advance(&mut self, mut input: Input, cx: &mut TurnContext<'_>) -> Result<Turn> {
        loop {
            let directive = self
                .script
                .resume(input)
                .map_err(|source| EngineError::Script {
                    conversation: cx.conversation,
                    source,
                })?;
            input = Input::Continue;

            match directive {
                None => return Ok(Turn::Done),
                Some(Directive::Receive) => {
                    self.pending = Pending::Receive;
                    return Ok(Turn::Receiving { declined: false });
                }
                Some(Directive::Retarget(matcher)) => self.matcher = matcher,
                Some(Directive::SetTimeout(timeout)) => self.timeout = timeout,
                Some(Directive::Await(work)) => {
                    self.pending = Pending::Computation;
                    return Ok(Turn::Awaiting(work));
                }
                Some(Directive::Emit(text)) => cx.emit(&text),
                Some(Directive::NotMatched { remove: false }) => {
                    self.pending = Pending::Receive;
                    return Ok(Turn::Receiving { declined: true });
                }
                Some(Directive::NotMatched { remove: true }) => return Ok(Turn::GaveUp),
                Some(Directive::SubScript(script)) => {
                    let depth = self.depth + 1;
                    if depth > cx.max_depth {
                        return Err(cx.malformed(format!(
                            "sub-script nesting exceeds {} levels",
                            cx.max_depth
                        )));
                    }
                    let mut child = Frame::new(script, self.matcher.clone(), self.timeout, depth);
                    match child.advance(Input::Start, cx)? {
                        Turn::Done => {}
                        Turn::GaveUp => return Ok(Turn::GaveUp),
                        turn => {
                            self.child = Some(Box::new(child));
                            return Ok(turn);
                        }
                    }
                }
            }
        }
    }
}

struct State {
    frame: Frame,
    deadline: Option<Instant>,
    last_scope: Option<Scope>,
}

struct Conversation {
    id: ConversationId,
    origin: Option<Scope>,
    state: Mutex<State>,
    matcher: RwLock<ScopeMatcher>,
    skip: AtomicBool,
    finished: AtomicBool,
    clock: EpochClock,
    wait: Mutex<Option<WaitId>>,
    cx: ConversationContext,
}

impl Conversation {
    fn wait_id(&self) -> Option<WaitId> {
        *self.wait.lock()
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Resume function of the registered wait
    fn on_event(self: &Arc<Self>, scope: &Scope, message: &Message) -> WaitResult {
        if self.is_finished() {
            return WaitResult::Reject;
        }
        if self.skip.load(Ordering::SeqCst) {
            return WaitResult::PassThrough;
        }

        let mut state = self.state.lock();
        if self.is_finished() {
            return WaitResult::Reject;
        }
        if self.skip.load(Ordering::SeqCst) {
            return WaitResult::PassThrough;
        }
        if state.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return WaitResult::PassThrough;
        }

        state.last_scope = Some(*scope);
        self.step_locked(&mut state, Event::Message(scope, message))
    }

    fn on_timeout(self: &Arc<Self>, epoch: u64) {
        let Some(mut state) = self.state.try_lock() else {
            // Mid-turn. Retry shortly without replacing the armed timer;
            // a turn that suspends moves the epoch on.
            let conversation = Arc::downgrade(self);
            self.cx
                .registry
                .scheduler()
                .after(RETRY_DELAY, move || fire_timeout(&conversation, epoch));
            return;
        };
        if !self.clock.is_current(epoch) || self.is_finished() || self.skip.load(Ordering::SeqCst) {
            return;
        }

        tracing::debug!(conversation = %self.id, "conversation timed out");
        state.deadline = None;
        self.step_locked(&mut state, Event::Timeout);
    }

    fn on_resumed(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if self.is_finished() {
            return;
        }
        self.skip.store(false, Ordering::SeqCst);
        self.step_locked(&mut state, Event::Resumed);
    }

    fn step_locked(self: &Arc<Self>, state: &mut State, event: Event<'_>) -> WaitResult {
        let by_message = matches!(event, Event::Message(..));
        let mut cx = TurnContext {
            conversation: self.id,
            outbox: self.cx.outbox.as_ref(),
            reply_to: state.last_scope.or(self.origin),
            max_depth: self.cx.max_depth,
        };

        let frame = &mut state.frame;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| frame.step(event, &mut cx)));
        let turn = match outcome {
            Ok(Ok(turn)) => turn,
            Ok(Err(err)) => return self.fail(err, by_message),
            Err(payload) => {
                let err = EngineError::ScriptPanicked {
                    conversation: self.id,
                    message: panic_message(payload.as_ref()),
                };
                return self.fail(err, by_message);
            }
        };

        match turn {
            Turn::Done => {
                tracing::debug!(conversation = %self.id, "conversation finished");
                self.finish(!by_message);
                WaitResult::Complete
            }
            Turn::GaveUp => {
                tracing::debug!(conversation = %self.id, "conversation gave up");
                self.finish(!by_message);
                WaitResult::Reject
            }
            Turn::Receiving { declined } => {
                *self.matcher.write() = state.frame.active().matcher.clone();
                if declined && by_message {
                    return WaitResult::PassThrough;
                }
                self.arm_timeout(state);
                WaitResult::Suspend
            }
            Turn::Awaiting(work) => {
                *self.matcher.write() = state.frame.active().matcher.clone();
                self.skip.store(true, Ordering::SeqCst);
                self.clock.advance();
                state.deadline = None;

                let conversation = self.clone();
                self.cx
                    .registry
                    .scheduler()
                    .spawn_background(work, move || conversation.on_resumed());
                WaitResult::Suspend
            }
        }
    }

    fn arm_timeout(self: &Arc<Self>, state: &mut State) {
        let epoch = self.clock.advance();
        let Some(timeout) = state.frame.active().timeout else {
            state.deadline = None;
            return;
        };

        state.deadline = Some(Instant::now() + timeout);
        let conversation = Arc::downgrade(self);
        let timer = self
            .cx
            .registry
            .scheduler()
            .after(timeout, move || fire_timeout(&conversation, epoch));
        self.clock.arm(timer);
    }

    /// Mark finished. The registry drops the wait itself when a message
    /// drove the turn; otherwise it is unregistered here.
    fn finish(&self, unregister: bool) -> bool {
        let was_running = !self.finished.swap(true, Ordering::SeqCst);
        self.clock.advance();
        if unregister {
            if let Some(id) = self.wait_id() {
                self.cx.registry.unregister(id);
            }
        }
        was_running
    }

    fn fail(&self, err: EngineError, by_message: bool) -> WaitResult {
        self.finish(!by_message);
        tracing::error!(conversation = %self.id, error = %err, "conversation failed");
        self.cx
            .registry
            .report_fault(Fault::new(self.id, self.wait_id(), err));
        WaitResult::Complete
    }
}

fn fire_timeout(conversation: &Weak<Conversation>, epoch: u64) {
    if let Some(conversation) = conversation.upgrade() {
        conversation.on_timeout(epoch);
    }
}

/// Start a conversation and step it once.
///
/// A wait is registered only if the first turn leaves the script suspended.
pub(crate) fn start(
    cx: &ConversationContext,
    matcher: ScopeMatcher,
    origin: Option<Scope>,
    script: Box<dyn Script>,
) -> ConversationHandle {
    let conversation = Arc::new(Conversation {
        id: ConversationId::new(),
        origin,
        state: Mutex::new(State {
            frame: Frame::new(script, matcher.clone(), None, 0),
            deadline: None,
            last_scope: None,
        }),
        matcher: RwLock::new(matcher),
        skip: AtomicBool::new(false),
        finished: AtomicBool::new(false),
        clock: EpochClock::new(),
        wait: Mutex::new(None),
        cx: cx.clone(),
    });
    tracing::debug!(conversation = %conversation.id, "conversation started");

    let mut state = conversation.state.lock();
    conversation.step_locked(&mut state, Event::Start);

    if !conversation.is_finished() {
        let observed = Arc::downgrade(&conversation);
        let live = ScopeMatcher::custom(move |scope| {
            observed
                .upgrade()
                .is_some_and(|conversation| conversation.matcher.read().matches(Some(scope)))
        });
        let target = conversation.clone();
        let id = cx
            .registry
            .register(live, move |scope, message| target.on_event(scope, message));
        *conversation.wait.lock() = Some(id);
    }
    drop(state);

    ConversationHandle {
        inner: conversation,
    }
}

/// Handle to a running (or finished) conversation
#[derive(Clone)]
pub struct ConversationHandle {
    inner: Arc<Conversation>,
}

impl ConversationHandle {
    /// Conversation identifier
    pub fn id(&self) -> ConversationId {
        self.inner.id
    }

    /// Whether the script has ended, by completion, giving up, failure or cancel
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Wait the conversation is registered under, if it ever suspended
    pub fn wait_id(&self) -> Option<WaitId> {
        self.inner.wait_id()
    }

    /// Finish the conversation and remove its wait.
    ///
    /// Returns `false` if it had already finished.
    pub fn cancel(&self) -> bool {
        let cancelled = self.inner.finish(true);
        if cancelled {
            tracing::debug!(conversation = %self.inner.id, "conversation cancelled");
        }
        cancelled
    }
}

impl std::fmt::Debug for ConversationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationHandle")
            .field("id", &self.inner.id)
            .field("wait", &self.inner.wait_id())
            .field("finished", &self.is_finished())
            .finish()
    }
}
