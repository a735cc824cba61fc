//! Cache error types

use redis::RedisError;

/// Cache-related errors
///
/// Remote variants are resolved by the orchestrator's fallback and never reach
/// callers of [`CacheOrchestrator`](crate::CacheOrchestrator). Errors produced
/// by a wrapped data operation are not represented here; the memoization
/// wrappers return the operation's own error type untouched.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Remote cache unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Remote cache protocol error: {0}")]
    RemoteProtocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// Whether the error originated in the remote tier.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_) | Self::RemoteProtocol(_))
    }

    /// Only connectivity failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_))
    }
}

impl From<RedisError> for CacheError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error()
            || e.is_connection_refusal()
            || e.is_connection_dropped()
            || e.is_timeout()
            || e.is_cluster_error()
        {
            Self::RemoteUnavailable(e.to_string())
        } else {
            Self::RemoteProtocol(e.to_string())
        }
    }
}
