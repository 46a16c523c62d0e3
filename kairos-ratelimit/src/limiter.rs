//! Dispatch limiter: "at most `max` starts in any rolling `window`".

use crate::error::{RateLimitError, RateLimitResult};
use crate::stores::{Decision, MemoryStore, Permit, RateLimitStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sliding-window limiter bound to one key of a store.
///
/// Over-limit callers of [`DispatchLimiter::acquire`] wait until the window
/// admits them instead of being rejected.
#[derive(Clone)]
pub struct DispatchLimiter {
    store: Arc<dyn RateLimitStore>,
    key: String,
    max: u64,
    window: Duration,
}

impl DispatchLimiter {
    /// Create a limiter over `store`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `max` is 0 or `window` is zero.
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        key: impl Into<String>,
        max: u64,
        window: Duration,
    ) -> RateLimitResult<Self> {
        if max == 0 {
            return Err(RateLimitError::config("max must be greater than 0"));
        }
        if window.is_zero() {
            return Err(RateLimitError::config("window must be non-zero"));
        }

        let key = key.into();
        debug!(
            key = %key,
            max = max,
            window = ?window,
            store = store.store_type(),
            "Creating dispatch limiter"
        );

        Ok(Self {
            store,
            key,
            max,
            window,
        })
    }

    /// Create a limiter backed by a fresh in-memory store.
    pub fn in_memory(key: impl Into<String>, max: u64, window: Duration) -> RateLimitResult<Self> {
        Self::new(Arc::new(MemoryStore::new()), key, max, window)
    }

    /// Record a start if the window allows one right now.
    pub async fn try_acquire(&self) -> RateLimitResult<Decision> {
        self.store
            .sliding_window_acquire(&self.key, self.max, self.window)
            .await
    }

    /// Wait until the window admits a start and record it.
    pub async fn acquire(&self) -> RateLimitResult<Permit> {
        loop {
            match self.try_acquire().await? {
                Decision::Granted(permit) => return Ok(permit),
                Decision::Deferred { retry_after } => {
                    debug!(key = %self.key, retry_after = ?retry_after, "Dispatch deferred by rate limit");
                    tokio::time::sleep(retry_after).await;
                }
            }
        }
    }

    /// Give back a start that did not happen.
    pub async fn refund(&self, permit: Permit) -> RateLimitResult<()> {
        self.store.refund(&permit).await
    }

    /// Maximum starts per window
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Window length
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl std::fmt::Debug for DispatchLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchLimiter")
            .field("key", &self.key)
            .field("max", &self.max)
            .field("window", &self.window)
            .field("store", &self.store.store_type())
            .finish()
    }
}
