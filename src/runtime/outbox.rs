//! Outbound message delivery
//!
//! The engine never talks to a chat backend directly. Everything it sends
//! goes through an [`Outbox`], optionally wrapped in send filters that may
//! rewrite or veto content.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::error::{SendError, SendResult};
use super::event::{MessageId, Scope};

/// Sends text to a scope on the chat backend
pub trait Outbox: Send + Sync {
    /// Deliver `content` to `scope`, returning the backend message id
    fn send(&self, scope: &Scope, content: &str) -> SendResult<MessageId>;
}

/// Inspects outgoing content before it reaches the backend
pub trait SendFilter: Send + Sync {
    /// Name reported when the filter vetoes a send
    fn name(&self) -> &str;

    /// Return the (possibly rewritten) content, or `None` to veto
    fn filter(&self, scope: &Scope, content: String) -> Option<String>;
}

struct FnFilter<F> {
    name: String,
    filter: F,
}

impl<F> SendFilter for FnFilter<F>
where
    F: Fn(&Scope, String) -> Option<String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self, scope: &Scope, content: String) -> Option<String> {
        (self.filter)(scope, content)
    }
}

/// Build a send filter from a closure
pub fn filter_fn<F>(name: impl Into<String>, filter: F) -> Arc<dyn SendFilter>
where
    F: Fn(&Scope, String) -> Option<String> + Send + Sync + 'static,
{
    Arc::new(FnFilter {
        name: name.into(),
        filter,
    })
}

/// Outbox applying filters in order before delegating
pub struct FilteredOutbox {
    inner: Arc<dyn Outbox>,
    filters: Vec<Arc<dyn SendFilter>>,
}

impl FilteredOutbox {
    /// Wrap an outbox with no filters
    pub fn new(inner: Arc<dyn Outbox>) -> Self {
        Self {
            inner,
            filters: Vec::new(),
        }
    }

    /// Append a filter; filters run in insertion order
    pub fn with_filter(mut self, filter: Arc<dyn SendFilter>) -> Self {
        self.filters.push(filter);
        self
    }
}

impl Outbox for FilteredOutbox {
    fn send(&self, scope: &Scope, content: &str) -> SendResult<MessageId> {
        let mut content = content.to_string();
        for filter in &self.filters {
            content = filter
                .filter(scope, content)
                .ok_or_else(|| SendError::Filtered {
                    filter: filter.name().to_string(),
                })?;
        }
        self.inner.send(scope, &content)
    }
}

/// A message recorded by [`MemoryOutbox`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Assigned message id
    pub id: MessageId,
    /// Destination
    pub scope: Scope,
    /// Content as sent
    pub text: String,
}

/// In-memory outbox that records every send
#[derive(Default)]
pub struct MemoryOutbox {
    sent: Mutex<Vec<SentMessage>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<SentMessage>>>,
    next_id: AtomicI64,
}

impl MemoryOutbox {
    /// Create an empty outbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Texts sent so far, in order
    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|sent| sent.text.clone()).collect()
    }

    /// Drain the record
    pub fn take(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Receive every subsequent send as it happens
    pub fn watch(&self) -> mpsc::UnboundedReceiver<SentMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push(tx);
        rx
    }
}

impl Outbox for MemoryOutbox {
    fn send(&self, scope: &Scope, content: &str) -> SendResult<MessageId> {
        let sent = SentMessage {
            id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
            scope: *scope,
            text: content.to_string(),
        };
        self.watchers
            .lock()
            .retain(|watcher| watcher.send(sent.clone()).is_ok());
        let id = sent.id;
        self.sent.lock().push(sent);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_outbox_records() {
        let outbox = MemoryOutbox::new();
        let first = outbox.send(&Scope::private(1), "hello").unwrap();
        let second = outbox.send(&Scope::private(2), "world").unwrap();
        assert_ne!(first, second);
        assert_eq!(outbox.texts(), vec!["hello", "world"]);
        assert_eq!(outbox.take().len(), 2);
        assert!(outbox.sent().is_empty());
    }

    #[test]
    fn test_filters_rewrite_in_order() {
        let memory = Arc::new(MemoryOutbox::new());
        let outbox = FilteredOutbox::new(memory.clone())
            .with_filter(filter_fn("upper", |_, text| Some(text.to_uppercase())))
            .with_filter(filter_fn("bang", |_, text| Some(format!("{text}!"))));

        outbox.send(&Scope::private(1), "hi").unwrap();
        assert_eq!(memory.texts(), vec!["HI!"]);
    }

    #[test]
    fn test_filter_veto() {
        let memory = Arc::new(MemoryOutbox::new());
        let outbox = FilteredOutbox::new(memory.clone()).with_filter(filter_fn(
            "no-groups",
            |scope, text| (!scope.is_group()).then_some(text),
        ));

        let err = outbox.send(&Scope::in_group(5, 1), "hi").unwrap_err();
        assert!(matches!(err, SendError::Filtered { filter } if filter == "no-groups"));
        assert!(memory.texts().is_empty());
    }

    #[tokio::test]
    async fn test_watch_sees_sends() {
        let outbox = MemoryOutbox::new();
        let mut watcher = outbox.watch();
        outbox.send(&Scope::private(1), "ping").unwrap();
        assert_eq!(watcher.recv().await.unwrap().text, "ping");
    }
}
