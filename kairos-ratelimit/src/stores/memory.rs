//! In-memory rate limit store
//!
//! Uses DashMap for thread-safe concurrent access. Only limits the process it
//! lives in; pools spread over several processes need the Redis store.

use crate::error::RateLimitResult;
use crate::stores::{Decision, Permit, RateLimitStore};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
struct Entry {
    at: Instant,
    id: u64,
}

/// In-memory rate limit store
pub struct MemoryStore {
    /// Sliding window logs
    sliding_logs: DashMap<String, VecDeque<Entry>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        debug!("Creating new in-memory rate limit store");
        Self {
            sliding_logs: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of starts currently counted for `key`, including stale ones not
    /// yet pruned.
    pub fn recorded(&self, key: &str) -> usize {
        self.sliding_logs.get(key).map(|log| log.len()).unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn sliding_window_acquire(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> RateLimitResult<Decision> {
        trace!(key = %key, max_requests = max_requests, window = ?window, "Sliding window acquire");

        let now = Instant::now();
        let mut entry = self.sliding_logs.entry(key.to_string()).or_default();

        // An entry counts for [at, at + window)
        while let Some(front) = entry.front() {
            if front.at + window <= now {
                entry.pop_front();
            } else {
                break;
            }
        }

        if (entry.len() as u64) < max_requests {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            entry.push_back(Entry { at: now, id });
            trace!(key = %key, in_window = entry.len(), "Sliding window: granted");
            return Ok(Decision::Granted(Permit {
                key: key.to_string(),
                member: id.to_string(),
            }));
        }

        let retry_after = entry
            .front()
            .map(|oldest| (oldest.at + window).saturating_duration_since(now))
            .unwrap_or(window)
            .max(Duration::from_millis(1));

        trace!(key = %key, retry_after = ?retry_after, "Sliding window: deferred");
        Ok(Decision::Deferred { retry_after })
    }

    async fn refund(&self, permit: &Permit) -> RateLimitResult<()> {
        if let Some(mut log) = self.sliding_logs.get_mut(&permit.key) {
            log.retain(|e| e.id.to_string() != permit.member);
        }
        Ok(())
    }

    async fn reset(&self, key: &str) -> RateLimitResult<()> {
        debug!(key = %key, "Resetting rate limit state");
        self.sliding_logs.remove(key);
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
