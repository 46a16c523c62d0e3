//! Redis store
//!
//! Key layout under the queue prefix:
//!
//! | Key | Type | Content |
//! |---|---|---|
//! | `{prefix}:job:{id}` | hash | `data` (job JSON), `state` |
//! | `{prefix}:state:{state}` | zset | job ids scored by `run_at` ms |
//! | `{prefix}:timers` | zset | delayed job ids scored by due time |
//! | `{prefix}:ready` | list | job ids ready for dispatch |
//! | `{prefix}:leases` | zset | leased job ids scored by expiry |
//! | `{prefix}:lease-tokens` | hash | job id to current lease token |
//! | `{prefix}:repeat` | hash | series key to series JSON |
//!
//! The `state` field of the job hash is authoritative: scripts that move a
//! job between states update it without rewriting the JSON.

use super::{Claim, JobStore, LeaseToken, score};
use crate::duration::to_chrono;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobId, JobState};
use crate::schedule::RepeatSeries;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::Script;
use redis::aio::ConnectionManager;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

static WRITE_JOB: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local prefix, id, data, state, score = ARGV[1], ARGV[2], ARGV[3], ARGV[4], ARGV[5]
local old = redis.call('HGET', KEYS[1], 'state')
if old and old ~= state then
    redis.call('ZREM', prefix .. ':state:' .. old, id)
end
redis.call('HSET', KEYS[1], 'data', data, 'state', state)
redis.call('ZADD', prefix .. ':state:' .. state, score, id)
return 1
"#,
    )
});

static REMOVE_JOB: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local prefix, id = ARGV[1], ARGV[2]
local state = redis.call('HGET', KEYS[1], 'state')
if not state then
    return 0
end
redis.call('ZREM', prefix .. ':state:' .. state, id)
redis.call('DEL', KEYS[1])
redis.call('ZREM', prefix .. ':timers', id)
redis.call('LREM', prefix .. ':ready', 0, id)
redis.call('ZREM', prefix .. ':leases', id)
redis.call('HDEL', prefix .. ':lease-tokens', id)
return 1
"#,
    )
});

static PROMOTE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local prefix, now, limit = ARGV[1], ARGV[2], tonumber(ARGV[3])
local timers = prefix .. ':timers'
local ids = redis.call('ZRANGEBYSCORE', timers, '-inf', now, 'LIMIT', 0, limit)
local promoted = {}
for _, id in ipairs(ids) do
    redis.call('ZREM', timers, id)
    local job = prefix .. ':job:' .. id
    local state = redis.call('HGET', job, 'state')
    if state then
        if state == 'delayed' then
            local at = redis.call('ZSCORE', prefix .. ':state:delayed', id) or now
            redis.call('ZREM', prefix .. ':state:delayed', id)
            redis.call('ZADD', prefix .. ':state:waiting', at, id)
            redis.call('HSET', job, 'state', 'waiting')
        end
        redis.call('RPUSH', prefix .. ':ready', id)
        table.insert(promoted, id)
    end
end
return promoted
"#,
    )
});

static CLAIM: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local prefix, expires, token = ARGV[1], ARGV[2], ARGV[3]
local tokens = prefix .. ':lease-tokens'
while true do
    local id = redis.call('LPOP', prefix .. ':ready')
    if not id then
        return false
    end
    local job = prefix .. ':job:' .. id
    local state = redis.call('HGET', job, 'state')
    if state == 'waiting' and redis.call('HEXISTS', tokens, id) == 0 then
        redis.call('ZADD', prefix .. ':leases', expires, id)
        redis.call('HSET', tokens, id, token)
        return {id, redis.call('HGET', job, 'data')}
    end
end
"#,
    )
});

static RENEW: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local prefix, id, token, expires = ARGV[1], ARGV[2], ARGV[3], ARGV[4]
if redis.call('HGET', prefix .. ':lease-tokens', id) ~= token then
    return 0
end
redis.call('ZADD', prefix .. ':leases', expires, id)
return 1
"#,
    )
});

static RELEASE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local prefix, id, token, data, state, score, rearm = ARGV[1], ARGV[2], ARGV[3], ARGV[4], ARGV[5], ARGV[6], ARGV[7]
local tokens = prefix .. ':lease-tokens'
if redis.call('HGET', tokens, id) ~= token then
    return 0
end
redis.call('HDEL', tokens, id)
redis.call('ZREM', prefix .. ':leases', id)
local old = redis.call('HGET', KEYS[1], 'state')
if old and old ~= state then
    redis.call('ZREM', prefix .. ':state:' .. old, id)
end
redis.call('HSET', KEYS[1], 'data', data, 'state', state)
redis.call('ZADD', prefix .. ':state:' .. state, score, id)
if rearm ~= '' then
    redis.call('ZADD', prefix .. ':timers', rearm, id)
end
return 1
"#,
    )
});

static EXPIRED: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local prefix, now = ARGV[1], ARGV[2]
local ids = redis.call('ZRANGEBYSCORE', prefix .. ':leases', '-inf', now)
local expired = {}
for _, id in ipairs(ids) do
    local token = redis.call('HGET', prefix .. ':lease-tokens', id)
    if token then
        table.insert(expired, id)
        table.insert(expired, token)
    end
end
return expired
"#,
    )
});

static RECLAIM: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local prefix, id, token, now, data, state, score = ARGV[1], ARGV[2], ARGV[3], ARGV[4], ARGV[5], ARGV[6], ARGV[7]
local tokens, leases = prefix .. ':lease-tokens', prefix .. ':leases'
if redis.call('HGET', tokens, id) ~= token then
    return 0
end
local expires = redis.call('ZSCORE', leases, id)
if expires and tonumber(expires) > tonumber(now) then
    return 0
end
redis.call('HDEL', tokens, id)
redis.call('ZREM', leases, id)
local old = redis.call('HGET', KEYS[1], 'state')
if data ~= '' and old then
    if old ~= state then
        redis.call('ZREM', prefix .. ':state:' .. old, id)
    end
    redis.call('HSET', KEYS[1], 'data', data, 'state', state)
    redis.call('ZADD', prefix .. ':state:' .. state, score, id)
    if state == 'waiting' then
        redis.call('RPUSH', prefix .. ':ready', id)
    end
end
return 1
"#,
    )
});

// KEYS[1] job hash. ARGV prefix, id, data, state, score.
static ADD_JOB: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local prefix, id, data, state, score = ARGV[1], ARGV[2], ARGV[3], ARGV[4], ARGV[5]
redis.call('HSET', KEYS[1], 'data', data, 'state', state)
redis.call('ZADD', prefix .. ':state:' .. state, score, id)
if state == 'delayed' then
    redis.call('ZADD', prefix .. ':timers', score, id)
else
    redis.call('RPUSH', prefix .. ':ready', id)
end
return 1
"#,
    )
});

// KEYS[1] series hash, KEYS[2] job hash.
// ARGV prefix, series key, series JSON, id, data, state, score.
static ADD_SERIES: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local prefix, key, series = ARGV[1], ARGV[2], ARGV[3]
local id, data, state, score = ARGV[4], ARGV[5], ARGV[6], ARGV[7]
if redis.call('HEXISTS', KEYS[1], key) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], key, series)
redis.call('HSET', KEYS[2], 'data', data, 'state', state)
redis.call('ZADD', prefix .. ':state:' .. state, score, id)
if state == 'delayed' then
    redis.call('ZADD', prefix .. ':timers', score, id)
else
    redis.call('RPUSH', prefix .. ':ready', id)
end
return 1
"#,
    )
});

// As ADD_SERIES, with ARGV[8] the `produced` count the stored series must have.
static ADVANCE_SERIES: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
local prefix, key, series = ARGV[1], ARGV[2], ARGV[3]
local id, data, state, score, expected = ARGV[4], ARGV[5], ARGV[6], ARGV[7], ARGV[8]
local current = redis.call('HGET', KEYS[1], key)
if not current then
    return 0
end
if tonumber(cjson.decode(current)['produced']) ~= tonumber(expected) then
    return 0
end
redis.call('HSET', KEYS[1], key, series)
redis.call('HSET', KEYS[2], 'data', data, 'state', state)
redis.call('ZADD', prefix .. ':state:' .. state, score, id)
if state == 'delayed' then
    redis.call('ZADD', prefix .. ':timers', score, id)
else
    redis.call('RPUSH', prefix .. ':ready', id)
end
return 1
"#,
    )
});

/// Redis-backed job store
pub struct RedisStore {
    /// Redis connection manager
    conn: ConnectionManager,
    /// Key prefix
    prefix: String,
}

impl RedisStore {
    /// Connect to Redis and use keys under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the connection fails.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let prefix = prefix.into();
        debug!(url = %url, prefix = %prefix, "Connecting job store to Redis");

        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, prefix })
    }

    /// Create a store on top of an existing connection.
    pub fn from_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    /// Key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn job_key(&self, id: JobId) -> String {
        self.key(&format!("job:{}", id))
    }

    fn encode<T: serde::Serialize>(value: &T) -> QueueResult<String> {
        serde_json::to_string(value).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    fn decode_job(data: &str, state: Option<&str>) -> QueueResult<Job> {
        let mut job: Job =
            serde_json::from_str(data).map_err(|e| QueueError::Deserialization(e.to_string()))?;
        if let Some(state) = state {
            job.state = state.parse()?;
        }
        Ok(job)
    }

    fn decode_series(data: &str) -> QueueResult<RepeatSeries> {
        serde_json::from_str(data).map_err(|e| QueueError::Deserialization(e.to_string()))
    }

    fn parse_ids(&self, raw: Vec<String>) -> Vec<JobId> {
        raw.into_iter()
            .filter_map(|id| match Uuid::parse_str(&id) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(prefix = %self.prefix, id = %id, error = %e, "Ignoring malformed job id");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn write_job(&self, job: &Job) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: i32 = WRITE_JOB
            .key(self.job_key(job.id))
            .arg(&self.prefix)
            .arg(job.id.to_string())
            .arg(Self::encode(job)?)
            .arg(job.state.as_str())
            .arg(score(job.run_at))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_job(&self, id: JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let (data, state): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.job_key(id))
            .arg("data")
            .arg("state")
            .query_async(&mut conn)
            .await?;

        match data {
            Some(data) => Ok(Some(Self::decode_job(&data, state.as_deref())?)),
            None => Ok(None),
        }
    }

    async fn list_jobs(&self, states: &[JobState]) -> QueueResult<Vec<Job>> {
        let mut conn = self.conn.clone();
        let mut jobs = Vec::new();

        for state in states {
            let raw: Vec<String> = conn
                .zrange(self.key(&format!("state:{}", state)), 0, -1)
                .await?;
            let ids = self.parse_ids(raw);
            if ids.is_empty() {
                continue;
            }

            let mut pipe = redis::pipe();
            for id in &ids {
                pipe.cmd("HMGET").arg(self.job_key(*id)).arg("data").arg("state");
            }
            let rows: Vec<(Option<String>, Option<String>)> = pipe.query_async(&mut conn).await?;

            for (data, current) in rows {
                let Some(data) = data else { continue };
                let job = Self::decode_job(&data, current.as_deref())?;
                // moved on between the range read and the fetch
                if job.state == *state {
                    jobs.push(job);
                }
            }
        }

        Ok(jobs)
    }

    async fn remove_job(&self, id: JobId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i32 = REMOVE_JOB
            .key(self.job_key(id))
            .arg(&self.prefix)
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn add_job(&self, job: &Job) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: i32 = ADD_JOB
            .key(self.job_key(job.id))
            .arg(&self.prefix)
            .arg(job.id.to_string())
            .arg(Self::encode(job)?)
            .arg(job.state.as_str())
            .arg(score(job.run_at))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn promote_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<JobId>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = PROMOTE
            .arg(&self.prefix)
            .arg(score(now))
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        if !raw.is_empty() {
            trace!(prefix = %self.prefix, count = raw.len(), "Promoted due timers");
        }
        Ok(self.parse_ids(raw))
    }

    async fn claim_next(&self, lease: Duration) -> QueueResult<Option<Claim>> {
        let now = Utc::now();
        let token = Uuid::new_v4();

        let mut conn = self.conn.clone();
        let claimed: Option<(String, String)> = CLAIM
            .arg(&self.prefix)
            .arg(score(now + to_chrono(lease)))
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await?;

        let Some((id, data)) = claimed else {
            return Ok(None);
        };

        let mut job = Self::decode_job(&data, Some(JobState::Waiting.as_str()))?;
        job.mark_active(now)?;
        // the lease is ours, so the record can be written without a script
        self.write_job(&job).await?;

        trace!(job_id = %id, "Claimed job");
        Ok(Some(Claim { job, token }))
    }

    async fn renew_lease(
        &self,
        id: JobId,
        token: LeaseToken,
        lease: Duration,
    ) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let renewed: i32 = RENEW
            .arg(&self.prefix)
            .arg(id.to_string())
            .arg(token.to_string())
            .arg(score(Utc::now() + to_chrono(lease)))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release_lease(
        &self,
        job: &Job,
        token: LeaseToken,
        rearm_at: Option<DateTime<Utc>>,
    ) -> QueueResult<bool> {
        let rearm = rearm_at.map(|at| score(at).to_string()).unwrap_or_default();

        let mut conn = self.conn.clone();
        let released: i32 = RELEASE
            .key(self.job_key(job.id))
            .arg(&self.prefix)
            .arg(job.id.to_string())
            .arg(token.to_string())
            .arg(Self::encode(job)?)
            .arg(job.state.as_str())
            .arg(score(job.run_at))
            .arg(rearm)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> QueueResult<Vec<(JobId, LeaseToken)>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = EXPIRED
            .arg(&self.prefix)
            .arg(score(now))
            .invoke_async(&mut conn)
            .await?;

        let mut expired = Vec::with_capacity(raw.len() / 2);
        for pair in raw.chunks_exact(2) {
            match (Uuid::parse_str(&pair[0]), Uuid::parse_str(&pair[1])) {
                (Ok(id), Ok(token)) => expired.push((id, token)),
                _ => warn!(prefix = %self.prefix, id = %pair[0], "Ignoring malformed lease"),
            }
        }
        Ok(expired)
    }

    async fn reclaim_lease(
        &self,
        id: JobId,
        token: LeaseToken,
        now: DateTime<Utc>,
        recovered: Option<&Job>,
    ) -> QueueResult<bool> {
        let (data, state, at) = match recovered {
            Some(job) => (Self::encode(job)?, job.state.as_str(), score(job.run_at)),
            None => (String::new(), "", 0),
        };

        let mut conn = self.conn.clone();
        let reclaimed: i32 = RECLAIM
            .key(self.job_key(id))
            .arg(&self.prefix)
            .arg(id.to_string())
            .arg(token.to_string())
            .arg(score(now))
            .arg(data)
            .arg(state)
            .arg(at)
            .invoke_async(&mut conn)
            .await?;
        Ok(reclaimed == 1)
    }

    async fn add_series(&self, series: &RepeatSeries, first: &Job) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let added: i32 = ADD_SERIES
            .key(self.key("repeat"))
            .key(self.job_key(first.id))
            .arg(&self.prefix)
            .arg(&series.key)
            .arg(Self::encode(series)?)
            .arg(first.id.to_string())
            .arg(Self::encode(first)?)
            .arg(first.state.as_str())
            .arg(score(first.run_at))
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn advance_series(
        &self,
        series: &RepeatSeries,
        expected_produced: u32,
        next: &Job,
    ) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let advanced: i32 = ADVANCE_SERIES
            .key(self.key("repeat"))
            .key(self.job_key(next.id))
            .arg(&self.prefix)
            .arg(&series.key)
            .arg(Self::encode(series)?)
            .arg(next.id.to_string())
            .arg(Self::encode(next)?)
            .arg(next.state.as_str())
            .arg(score(next.run_at))
            .arg(expected_produced)
            .invoke_async(&mut conn)
            .await?;
        Ok(advanced == 1)
    }

    async fn get_series(&self, key: &str) -> QueueResult<Option<RepeatSeries>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn.hget(self.key("repeat"), key).await?;
        data.as_deref().map(Self::decode_series).transpose()
    }

    async fn remove_series(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i32 = conn.hdel(self.key("repeat"), key).await?;
        Ok(removed > 0)
    }

    async fn list_series(&self) -> QueueResult<Vec<RepeatSeries>> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.hvals(self.key("repeat")).await?;
        let mut series = values
            .iter()
            .map(|data| Self::decode_series(data))
            .collect::<QueueResult<Vec<_>>>()?;
        series.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(series)
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}
