//! Scopes, messages, and identifiers
//!
//! A scope names a conversational endpoint: a user, optionally inside a group.
//! Events arriving from the chat backend are `(Scope, Message)` pairs; a
//! suspended script observes them as a [`Reply`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Group (multi-user chat) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub i64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier the chat backend assigns to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A conversational endpoint: a user, optionally within a group.
///
/// `group == None` denotes a private conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    group: Option<GroupId>,
    user: UserId,
}

impl Scope {
    /// Create a scope from typed identifiers
    pub fn new(group: Option<GroupId>, user: UserId) -> Self {
        Self { group, user }
    }

    /// Private conversation with a user
    pub fn private(user: i64) -> Self {
        Self::new(None, UserId(user))
    }

    /// A user speaking inside a group
    pub fn in_group(group: i64, user: i64) -> Self {
        Self::new(Some(GroupId(group)), UserId(user))
    }

    /// Group identifier, if this is a group scope
    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    /// User identifier
    pub fn user(&self) -> UserId {
        self.user
    }

    /// Whether the scope belongs to a group conversation
    pub fn is_group(&self) -> bool {
        self.group.is_some()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.group {
            Some(group) => write!(f, "group:{}/user:{}", group, self.user),
            None => write!(f, "user:{}", self.user),
        }
    }
}

/// Plain-text view of an incoming chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Backend message identifier, when known
    pub id: Option<MessageId>,
    /// Plain text content
    pub text: String,
}

impl Message {
    /// Create a message without a backend identifier
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
        }
    }

    /// Attach a backend identifier
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Plain text content
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// One delivered event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Where the message came from
    pub scope: Scope,
    /// The message itself
    pub message: Message,
}

/// What a receiving script observes when it resumes.
///
/// Both fields are `None` when the wait ended because of a timeout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Scope of the delivered event
    pub scope: Option<Scope>,
    /// Delivered message
    pub message: Option<Message>,
}

impl Reply {
    /// Reply carrying a delivered event
    pub fn delivered(scope: Scope, message: Message) -> Self {
        Self {
            scope: Some(scope),
            message: Some(message),
        }
    }

    /// Reply marking a timeout
    pub fn timed_out() -> Self {
        Self::default()
    }

    /// Whether the wait ended by timeout rather than by a message
    pub fn is_timeout(&self) -> bool {
        self.scope.is_none() && self.message.is_none()
    }

    /// Text of the delivered message, if any
    pub fn text(&self) -> Option<&str> {
        self.message.as_ref().map(Message::text)
    }

    /// Convert into an envelope when a message was delivered
    pub fn into_envelope(self) -> Option<Envelope> {
        match (self.scope, self.message) {
            (Some(scope), Some(message)) => Some(Envelope { scope, message }),
            _ => None,
        }
    }
}

/// Registry-assigned identifier of a pending wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WaitId(pub u64);

impl fmt::Display for WaitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wait-{}", self.0)
    }
}

/// Conversation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    /// Create a new random ConversationId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
