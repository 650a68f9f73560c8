//! Scope matching rules
//!
//! A [`ScopeMatcher`] decides whether a registered interest applies to an
//! incoming event. It never owns the scope it was built from; it is purely a
//! lookup rule.

use std::fmt;
use std::sync::Arc;

use super::event::{GroupId, Scope, UserId};

/// Predicate signature used by [`ScopeMatcher::Custom`]
pub type ScopePredicate = Arc<dyn Fn(&Scope) -> bool + Send + Sync>;

/// Rule selecting which event scopes a wait or conversation listens to
#[derive(Clone, Default)]
pub enum ScopeMatcher {
    /// Every scope matches
    #[default]
    All,
    /// Any user inside the given group
    Group(GroupId),
    /// The given user, in any group or in private
    User(UserId),
    /// Exactly this group and user; a private scope matches private events only
    Exact(Scope),
    /// Arbitrary predicate
    Custom(ScopePredicate),
}

impl ScopeMatcher {
    /// Listen to exactly the endpoint described by `scope`
    pub fn from_scope(scope: &Scope) -> Self {
        Self::Exact(*scope)
    }

    /// Listen to any user of a group
    pub fn group(group: i64) -> Self {
        Self::Group(GroupId(group))
    }

    /// Listen to a user wherever they speak
    pub fn user(user: i64) -> Self {
        Self::User(UserId(user))
    }

    /// Listen to one user within one group
    pub fn group_user(group: i64, user: i64) -> Self {
        Self::Exact(Scope::in_group(group, user))
    }

    /// Build a matcher from an arbitrary predicate
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&Scope) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(predicate))
    }

    /// Decide whether an event scope applies.
    ///
    /// `None` always matches: timeout and background resumptions carry no
    /// scope and must reach the waiting step regardless of origin.
    pub fn matches(&self, scope: Option<&Scope>) -> bool {
        let Some(scope) = scope else {
            return true;
        };

        match self {
            Self::All => true,
            Self::Group(group) => scope.group() == Some(*group),
            Self::User(user) => scope.user() == *user,
            Self::Exact(target) => {
                target.group() == scope.group() && target.user() == scope.user()
            }
            Self::Custom(predicate) => predicate(scope),
        }
    }
}

impl From<Scope> for ScopeMatcher {
    fn from(scope: Scope) -> Self {
        Self::Exact(scope)
    }
}

impl fmt::Debug for ScopeMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Group(group) => f.debug_tuple("Group").field(group).finish(),
            Self::User(user) => f.debug_tuple("User").field(user).finish(),
            Self::Exact(scope) => f.debug_tuple("Exact").field(scope).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
