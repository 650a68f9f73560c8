//! Huddle – stateful chat conversations over an out-of-order event stream
//!
//! This crate routes incoming chat events to suspended conversation scripts:
//! - A wait registry offering each event to pending waits, newest first
//! - Resumable, nestable conversation scripts with per-turn timeouts
//! - Epoch-based timer invalidation so late timers never resume a script twice
//! - One-shot reply futures and an async dialogue helper
//! - An explicit route table with middleware and completion observers

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Conversation engine, wait registry and dispatcher
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{Engine, EngineConfig};

/// Current version of huddle
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
