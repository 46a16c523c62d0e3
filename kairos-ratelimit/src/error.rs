//! Error types for rate limiting

use thiserror::Error;

/// Result type for rate limiting operations
pub type RateLimitResult<T> = Result<T, RateLimitError>;

/// Rate limiting errors
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// Store error (Redis, memory, etc.)
    #[error("Rate limit store error: {0}")]
    StoreError(String),

    /// Configuration error
    #[error("Rate limit configuration error: {0}")]
    ConfigError(String),

    /// Redis connection error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
}

impl RateLimitError {
    /// Create a new store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::StoreError(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }
}
