//! Error types for Huddle
//!
//! Contention and no-op outcomes are never errors; only malformed input and
//! lifecycle misuse surface here.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HuddleError {
    #[error("Malformed resource key: {0}")]
    MalformedKey(String),

    #[error("Invalid lock TTL: {0}")]
    InvalidTtl(String),

    #[error("Coordinator is shutting down")]
    ShuttingDown,
}

pub type HuddleResult<T> = Result<T, HuddleError>;
