//! Rate limit storage backends
//!
//! - **Memory**: In-memory storage using DashMap (single process)
//! - **Redis**: Shared storage for worker pools spread over several processes

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis::RedisStore;

use crate::error::RateLimitResult;
use async_trait::async_trait;
use std::time::Duration;

/// A recorded admission inside a sliding window.
///
/// Holding a permit means one start has been counted against the window.
/// Handing it back with [`RateLimitStore::refund`] removes that start again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permit {
    /// Limiter key the permit was recorded under
    pub key: String,
    /// Store-specific identity of the recorded entry
    pub member: String,
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The start was recorded
    Granted(Permit),
    /// The window is full; the oldest entry leaves it after `retry_after`
    Deferred {
        /// Time until the window admits another start
        retry_after: Duration,
    },
}

/// Trait for rate limit storage backends
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically check the sliding window log for `key` and record a start
    /// when fewer than `max_requests` fall inside the trailing `window`.
    async fn sliding_window_acquire(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> RateLimitResult<Decision>;

    /// Remove a previously granted entry from its window.
    async fn refund(&self, permit: &Permit) -> RateLimitResult<()>;

    /// Reset rate limit state for a key
    async fn reset(&self, key: &str) -> RateLimitResult<()>;

    /// Get store type name for debugging
    fn store_type(&self) -> &'static str;
}
