//! # Kairos Rate Limiting
//!
//! Sliding-window-log limiting of job dispatch starts: at most `max` starts
//! inside any rolling `window`. Over-limit dispatch is deferred until the
//! window drains, never dropped.
//!
//! ## Storage Backends
//!
//! - [`stores::MemoryStore`]: in-process (DashMap)
//! - `stores::RedisStore`: shared between processes (feature `redis`)
//!
//! ## Quick Start
//!
//! ```rust
//! use kairos_ratelimit::DispatchLimiter;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), kairos_ratelimit::RateLimitError> {
//! let limiter = DispatchLimiter::in_memory("emails", 100, Duration::from_secs(1))?;
//!
//! let permit = limiter.acquire().await?;
//! // ... nothing to dispatch after all
//! limiter.refund(permit).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod limiter;
pub mod stores;

pub use error::{RateLimitError, RateLimitResult};
pub use limiter::DispatchLimiter;
pub use stores::{Decision, MemoryStore, Permit, RateLimitStore};

#[cfg(feature = "redis")]
pub use stores::RedisStore;
