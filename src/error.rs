//! # Error Types
//!
//! The core engine (`Change`, `Topic`, `StateMachine`) is a library whose
//! callers need to match on error *kind*, not just print a message, so it
//! uses `thiserror` rather than the `anyhow`-only style the teacher uses at
//! its binary boundary. `anyhow` is still used in `main.rs`/`transport.rs`
//! for I/O and startup failures.

use thiserror::Error;

/// Result type alias used throughout the core engine.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors produced by the transactional state machine and its topics.
///
/// See spec §7 "Error Handling Design" for the propagation policy associated
/// with each variant.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// A validator rejected a change, or a change's precondition failed
    /// (duplicate `append`, missing `remove`/`pop` key, string mismatch on
    /// `delete`, out-of-range position, ...).
    #[error("invalid change for topic '{topic}': {reason}")]
    InvalidChange { topic: String, reason: String },

    /// A nested `record()` without `allow_reentry`. Programmer error.
    #[error("cannot call record() while already recording")]
    Reentry,

    /// Unknown topic name.
    #[error("no such topic: '{0}'")]
    UnknownTopic(String),

    /// A topic already exists under that name.
    #[error("topic already exists: '{0}'")]
    TopicExists(String),

    /// Failure during manual-listener notification, event-change
    /// notification, or recovery itself. The state machine marks itself
    /// `CRITICAL` and refuses further recovery; the caller should consider
    /// process state undefined.
    #[error("critical failure in state machine: {0}")]
    Critical(String),

    /// A change's wire representation could not be parsed.
    #[error("malformed change: {0}")]
    Deserialize(String),
}

impl BrokerError {
    pub fn invalid(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        BrokerError::InvalidChange {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}
