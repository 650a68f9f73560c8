//! One-shot waits resolved as futures
//!
//! [`await_reply`] registers a single wait and hands back a [`PendingReply`]
//! that resolves with the first matching event, or `None` on timeout. Only
//! one of the two ever resolves it.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::error::{EngineError, Fault, panic_message};
use super::event::{ConversationId, Envelope, Message, Scope, WaitId};
use super::matcher::ScopeMatcher;
use super::registry::{WaitRegistry, WaitResult};

/// Filter applied to candidate replies
pub type MessagePredicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

struct ReplyState {
    sender: Option<oneshot::Sender<Option<Envelope>>>,
    wait: Option<WaitId>,
}

impl ReplyState {
    fn resolve(&mut self, outcome: Option<Envelope>) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(outcome);
        }
    }
}

/// Wait for the next event matching `matcher` (and `predicate`, if given).
///
/// Events rejected by the predicate are passed on to other waits and do not
/// push back the deadline. A zero or absent timeout waits indefinitely.
/// A panicking predicate resolves the reply with `None`, removes the wait
/// and reports a [`Fault`].
pub fn await_reply(
    registry: &WaitRegistry,
    matcher: ScopeMatcher,
    timeout: Option<Duration>,
    predicate: Option<MessagePredicate>,
) -> PendingReply {
    let (sender, receiver) = oneshot::channel();
    let conversation = ConversationId::new();
    let state = Arc::new(Mutex::new(ReplyState {
        sender: Some(sender),
        wait: None,
    }));

    let reply_state = state.clone();
    let faults = registry.clone();
    let resume = move |scope: &Scope, message: &Message| {
        let mut state = reply_state.lock();
        if state.sender.is_none() {
            return WaitResult::Reject;
        }
        if let Some(predicate) = &predicate {
            match panic::catch_unwind(AssertUnwindSafe(|| predicate(message))) {
                Ok(true) => {}
                Ok(false) => return WaitResult::PassThrough,
                Err(payload) => {
                    let err = EngineError::ScriptPanicked {
                        conversation,
                        message: panic_message(payload.as_ref()),
                    };
                    tracing::error!(conversation = %conversation, error = %err, "reply predicate failed");
                    state.resolve(None);
                    faults.report_fault(Fault::new(conversation, state.wait, err));
                    return WaitResult::Reject;
                }
            }
        }
        state.resolve(Some(Envelope {
            scope: *scope,
            message: message.clone(),
        }));
        WaitResult::Complete
    };

    // Held across registration so a resume racing it sees the wait id.
    let mut registering = state.lock();
    let id = match timeout.filter(|timeout| !timeout.is_zero()) {
        Some(timeout) => {
            let expired = state.clone();
            registry.register_with_timeout(matcher, timeout, resume, move || {
                expired.lock().resolve(None);
            })
        }
        None => registry.register(matcher, resume),
    };
    registering.wait = Some(id);
    drop(registering);

    PendingReply {
        id,
        conversation,
        registry: registry.clone(),
        receiver,
        resolved: false,
    }
}

/// Future resolving to the awaited event, or `None` on timeout.
///
/// Dropping it before it resolves unregisters the wait.
#[must_use = "a pending reply does nothing unless awaited"]
pub struct PendingReply {
    id: WaitId,
    conversation: ConversationId,
    registry: WaitRegistry,
    receiver: oneshot::Receiver<Option<Envelope>>,
    resolved: bool,
}

impl PendingReply {
    /// Identifier of the underlying wait
    pub fn wait_id(&self) -> WaitId {
        self.id
    }

    /// Identifier faults raised by this wait are attributed to
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation
    }
}

impl Future for PendingReply {
    type Output = Option<Envelope>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(outcome) => {
                self.resolved = true;
                // A dropped sender means the wait was removed externally.
                Poll::Ready(outcome.ok().flatten())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.resolved {
            self.registry.unregister(self.id);
        }
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("wait", &self.id)
            .field("resolved", &self.resolved)
            .finish()
    }
}
