//! Conversation engine and public API
//!
//! This module provides the main `Engine` struct that ties the wait registry,
//! the conversation runner and the outbound channel together, and exposes the
//! entry points collaborators use to start conversations and await replies.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// Submodules
pub mod conversation;
pub mod dialogue;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod matcher;
pub mod outbox;
pub mod registry;
pub mod reply;
pub mod scheduler;
pub mod script;

/// Configuration for the conversation engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Grace added to every timeout, in milliseconds
    pub timeout_grace_ms: u64,

    /// Deepest allowed nesting of sub-scripts
    pub max_script_depth: usize,

    /// Capacity of the fault broadcast channel
    pub fault_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout_grace_ms: 10,
            max_script_depth: 32,
            fault_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_script_depth == 0 {
            return Err(ConfigError::Invalid(
                "max_script_depth must be greater than zero".into(),
            ));
        }
        if self.fault_capacity == 0 {
            return Err(ConfigError::Invalid(
                "fault_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Grace period as a duration
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.timeout_grace_ms)
    }
}

use conversation::ConversationContext;
use dialogue::Dialogue;
use error::{ConfigError, ConfigResult};
use reply::{MessagePredicate, PendingReply};
use tokio::runtime::Handle;
use tokio::sync::broadcast;

struct EngineInner {
    config: EngineConfig,
    conversations: ConversationContext,
}

/// The conversation engine
///
/// Cheap to clone; clones share the same registry and outbox.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine on the tokio runtime the caller is running in
    pub fn new(config: EngineConfig, outbox: Arc<dyn Outbox>) -> Result<Self> {
        let handle =
            Handle::try_current().map_err(|err| EngineError::NoRuntime(err.to_string()))?;
        Self::with_handle(config, outbox, handle)
    }

    /// Create an engine that schedules timers and background work on `handle`
    pub fn with_handle(
        config: EngineConfig,
        outbox: Arc<dyn Outbox>,
        handle: Handle,
    ) -> Result<Self> {
        config.validate()?;

        // Timers and background computations share one scheduler
        let scheduler = Scheduler::new(handle, config.grace());

        // The registry owns every pending wait
        let registry = WaitRegistry::new(scheduler, config.fault_capacity);

        let conversations = ConversationContext {
            registry,
            outbox,
            max_depth: config.max_script_depth,
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                conversations,
            }),
        })
    }

    /// Start a conversation listening to exactly `scope`
    pub fn start<S: Script>(&self, scope: &Scope, script: S) -> ConversationHandle {
        conversation::start(
            &self.inner.conversations,
            ScopeMatcher::from_scope(scope),
            Some(*scope),
            Box::new(script),
        )
    }

    /// Start a conversation with an explicit matcher.
    ///
    /// Text emitted before the first event is dropped, as there is no peer yet.
    pub fn start_with<S: Script>(&self, matcher: ScopeMatcher, script: S) -> ConversationHandle {
        conversation::start(&self.inner.conversations, matcher, None, Box::new(script))
    }

    /// Wait once for the next matching event
    pub fn await_reply(
        &self,
        matcher: ScopeMatcher,
        timeout: Option<Duration>,
        predicate: Option<MessagePredicate>,
    ) -> PendingReply {
        reply::await_reply(self.registry(), matcher, timeout, predicate)
    }

    /// Async helper bound to `scope`
    pub fn dialogue(&self, scope: &Scope) -> Dialogue {
        Dialogue::new(self.clone(), *scope)
    }

    /// Send text through the outbox
    pub fn send(&self, scope: &Scope, text: &str) -> Result<MessageId> {
        let id = self.inner.conversations.outbox.send(scope, text)?;
        tracing::debug!(scope = %scope, message = %id, "sent message");
        Ok(id)
    }

    /// The wait registry
    pub fn registry(&self) -> &WaitRegistry {
        &self.inner.conversations.registry
    }

    /// Get the current configuration
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribe to contained conversation failures
    pub fn subscribe_faults(&self) -> broadcast::Receiver<Fault> {
        self.registry().subscribe_faults()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .field("registry", self.registry())
            .finish()
    }
}

// Re-export commonly used types
pub use conversation::ConversationHandle;
pub use error::{EngineError, Fault, Result, SendError};
pub use event::{Envelope, GroupId, Message, MessageId, Reply, Scope, UserId, WaitId};
pub use matcher::ScopeMatcher;
pub use outbox::{MemoryOutbox, Outbox};
pub use registry::{DispatchOutcome, WaitRegistry, WaitResult};
pub use scheduler::Scheduler;
pub use script::{Directive, Input, Script};
