//! Async conversation helper
//!
//! A [`Dialogue`] is the `async fn` counterpart of a scripted conversation:
//! it sends to one scope and awaits replies through one-shot waits. Each
//! wait uses the dialogue's current `target` and `timeout`.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use super::Engine;
use super::error::Result;
use super::event::{Envelope, Message, MessageId, Scope};
use super::matcher::ScopeMatcher;
use super::reply::{MessagePredicate, PendingReply};

/// Send-and-wait helper bound to a source scope
#[derive(Debug, Clone)]
pub struct Dialogue {
    engine: Engine,
    scope: Scope,
    /// Which scopes replies are accepted from
    pub target: ScopeMatcher,
    /// How long each wait lasts; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl Dialogue {
    pub(crate) fn new(engine: Engine, scope: Scope) -> Self {
        Self {
            engine,
            scope,
            target: ScopeMatcher::from_scope(&scope),
            timeout: None,
        }
    }

    /// Set the per-wait timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Accept replies from other scopes
    pub fn with_target(mut self, target: ScopeMatcher) -> Self {
        self.target = target;
        self
    }

    /// The scope messages are sent to
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Send text to the dialogue's scope
    pub fn send(&self, text: &str) -> Result<MessageId> {
        self.engine.send(&self.scope, text)
    }

    fn pending(&self, predicate: Option<MessagePredicate>) -> PendingReply {
        self.engine
            .await_reply(self.target.clone(), self.timeout, predicate)
    }

    /// Next message from the target, or `None` on timeout
    pub async fn wait(&self) -> Option<Envelope> {
        self.pending(None).await
    }

    /// Next message whose text equals `text`
    pub async fn wait_for(&self, text: &str) -> Option<Envelope> {
        let expected = text.to_string();
        self.wait_matching(move |message| message.text == expected)
            .await
    }

    /// Next message whose text matches `pattern`
    pub async fn wait_for_regex(&self, pattern: &Regex) -> Option<Envelope> {
        let pattern = pattern.clone();
        self.wait_matching(move |message| pattern.is_match(&message.text))
            .await
    }

    /// Next message accepted by `predicate`
    pub async fn wait_matching<P>(&self, predicate: P) -> Option<Envelope>
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.pending(Some(Arc::new(predicate))).await
    }

    /// Send, then wait for any reply
    pub async fn send_and_wait(&self, text: &str) -> Result<Option<Envelope>> {
        let pending = self.pending(None);
        self.send(text)?;
        Ok(pending.await)
    }

    /// Send, then wait for a reply whose text equals `expected`
    pub async fn send_and_wait_for(&self, text: &str, expected: &str) -> Result<Option<Envelope>> {
        let expected = expected.to_string();
        let pending = self.pending(Some(Arc::new(move |message: &Message| {
            message.text == expected
        })));
        self.send(text)?;
        Ok(pending.await)
    }

    /// Wait repeatedly until `select` produces a value `accept` approves.
    ///
    /// `select` sees `None` for a timed-out wait; if `accept` keeps refusing
    /// timeouts this loops until it approves something.
    pub async fn wait_and_select<T, S, A>(
        &self,
        select: S,
        message_predicate: Option<MessagePredicate>,
        accept: A,
    ) -> T
    where
        S: Fn(Option<&Envelope>) -> T,
        A: Fn(&T) -> bool,
    {
        loop {
            let envelope = self.pending(message_predicate.clone()).await;
            let value = select(envelope.as_ref());
            if accept(&value) {
                return value;
            }
        }
    }
}
