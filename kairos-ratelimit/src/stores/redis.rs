//! Redis rate limit store
//!
//! Uses Redis so that every worker process sharing a queue draws from the same
//! window. Requires the `redis` feature to be enabled.

use crate::error::{RateLimitError, RateLimitResult};
use crate::stores::{Decision, Permit, RateLimitStore};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};
use uuid::Uuid;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local max_requests = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local window_ms = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window_ms)

local count = redis.call('ZCARD', key)
if count < max_requests then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window_ms + 1000)
    return {1, 0}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local retry = tonumber(oldest[2]) + window_ms - now
if retry < 1 then
    retry = 1
end
return {0, retry}
"#;

/// Redis-backed rate limit store
///
/// Each window is a sorted set scored by admission time in milliseconds;
/// pruning, counting and recording run in one Lua script.
pub struct RedisStore {
    /// Redis connection manager
    conn: ConnectionManager,
    /// Key prefix
    prefix: String,
}

impl RedisStore {
    /// Create a new Redis store
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn new(url: &str) -> RateLimitResult<Self> {
        debug!(url = %url, "Connecting to Redis for rate limiting");

        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            prefix: "ratelimit".to_string(),
        })
    }

    /// Create a store on top of an existing connection
    pub fn from_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    /// Get the full key with prefix
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }
}

fn now_millis() -> RateLimitResult<i64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .map_err(|e| RateLimitError::store(e.to_string()))
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn sliding_window_acquire(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> RateLimitResult<Decision> {
        trace!(key = %key, max_requests = max_requests, window = ?window, "Redis sliding window acquire");

        let full_key = self.key(&format!("sw:{}", key));
        let member = Uuid::new_v4().to_string();
        let script = redis::Script::new(SLIDING_WINDOW_SCRIPT);

        let mut conn = self.conn.clone();
        let (granted, retry_ms): (i32, i64) = script
            .key(&full_key)
            .arg(max_requests)
            .arg(now_millis()?)
            .arg(window.as_millis() as i64)
            .arg(&member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::store(e.to_string()))?;

        if granted == 1 {
            trace!(key = %key, "Redis sliding window: granted");
            Ok(Decision::Granted(Permit {
                key: key.to_string(),
                member,
            }))
        } else {
            trace!(key = %key, retry_ms = retry_ms, "Redis sliding window: deferred");
            Ok(Decision::Deferred {
                retry_after: Duration::from_millis(retry_ms.max(1) as u64),
            })
        }
    }

    async fn refund(&self, permit: &Permit) -> RateLimitResult<()> {
        let full_key = self.key(&format!("sw:{}", permit.key));
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(&full_key, &permit.member).await?;
        Ok(())
    }

    async fn reset(&self, key: &str) -> RateLimitResult<()> {
        debug!(key = %key, "Resetting Redis rate limit state");
        let full_key = self.key(&format!("sw:{}", key));
        let mut conn = self.conn.clone();
        let _: () = conn.del(&full_key).await?;
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}
