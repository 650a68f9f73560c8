//! Error types for the conversation engine
//!
//! Domain errors use thiserror. User-supplied code (scripts and handlers)
//! returns `anyhow::Result` and is wrapped into [`EngineError`] at the engine
//! boundary.

use std::io;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::event::{ConversationId, WaitId};

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was constructed outside a tokio runtime
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// A script returned an error
    #[error("script failed in conversation {conversation}: {source}")]
    Script {
        /// Conversation whose script failed
        conversation: ConversationId,
        /// Error returned by the script
        #[source]
        source: anyhow::Error,
    },

    /// A script panicked while resuming
    #[error("script panicked in conversation {conversation}: {message}")]
    ScriptPanicked {
        /// Conversation whose script panicked
        conversation: ConversationId,
        /// Panic payload, when it was a string
        message: String,
    },

    /// A script drove the engine into a state it cannot represent
    #[error("malformed script state in conversation {conversation}: {detail}")]
    MalformedScript {
        /// Offending conversation
        conversation: ConversationId,
        /// What went wrong
        detail: String,
    },

    /// A conversation failed while resuming for a dispatched event
    #[error("conversation {conversation} failed: {source}")]
    Conversation {
        /// Failed conversation
        conversation: ConversationId,
        /// Wait it was registered under
        wait: Option<WaitId>,
        /// The contained failure
        #[source]
        source: Arc<EngineError>,
    },

    /// A route handler failed
    #[error("handler '{name}' failed: {source}")]
    Handler {
        /// Route name
        name: String,
        /// Error returned by the handler
        #[source]
        source: anyhow::Error,
    },

    /// Outbound send failed
    #[error("send failed: {0}")]
    Send(#[from] SendError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Outbound send errors
#[derive(Debug, Error)]
pub enum SendError {
    /// A send filter vetoed the message
    #[error("message vetoed by filter '{filter}'")]
    Filtered {
        /// Name of the vetoing filter
        filter: String,
    },

    /// The backend refused the message
    #[error("backend rejected message: {0}")]
    Rejected(String),

    /// The backend could not be reached
    #[error("transport error: {0}")]
    Transport(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error while reading the config file
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A value failed validation
    #[error("invalid value: {0}")]
    Invalid(String),
}

/// A contained conversation failure, broadcast to fault subscribers
#[derive(Debug, Clone)]
pub struct Fault {
    /// Conversation that failed
    pub conversation: ConversationId,
    /// Wait the conversation was registered under, if any
    pub wait: Option<WaitId>,
    /// The failure
    pub error: Arc<EngineError>,
    /// When the failure was contained
    pub at: DateTime<Utc>,
}

impl Fault {
    /// Record a failure for a conversation
    pub fn new(conversation: ConversationId, wait: Option<WaitId>, error: EngineError) -> Self {
        Self {
            conversation,
            wait,
            error: Arc::new(error),
            at: Utc::now(),
        }
    }

    /// Error attributing this failure to its conversation
    pub fn into_error(self) -> EngineError {
        EngineError::Conversation {
            conversation: self.conversation,
            wait: self.wait,
            source: self.error,
        }
    }
}

/// Render a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Convenience result alias for send operations
pub type SendResult<T> = std::result::Result<T, SendError>;

/// Convenience result alias for configuration loading
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
