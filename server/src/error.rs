//! Error types for the matching engine and its persistence sink.
//!
//! Every [`MatchError`] is reported only to the connection that caused it;
//! none of them leave shared state partially mutated.

use thiserror::Error;

use crate::matching::Category;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// Malformed input: bad device id, nickname, or message text.
    #[error("{0}")]
    Validation(String),

    /// The daily quota for a specific filter is spent.
    #[error("Daily limit reached for {0}")]
    QuotaExceeded(Category),

    #[error("Rate limit exceeded. Try again in a moment.")]
    RateLimited,

    #[error("Device banned: {reason}")]
    Banned { reason: String },

    #[error("Cooldown: wait before re-joining")]
    Cooldown,

    /// Device is already waiting in the queue or paired.
    #[error("Already queued or in a chat")]
    AlreadyActive,
}

impl MatchError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Failure applying a write-behind command. Always logged and swallowed.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("writer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
