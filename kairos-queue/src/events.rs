//! Queue lifecycle events and the buses that deliver them.

use crate::error::{QueueError, QueueResult};
use crate::job::{JobData, JobId};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace};

/// Event emitted on a job transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum QueueEvent {
    /// Job became ready for dispatch
    Waiting { job_id: JobId },
    /// A worker started the job
    Active { job_id: JobId },
    /// Handler succeeded
    Completed { job_id: JobId, result: JobData },
    /// Job failed permanently
    Failed {
        job_id: JobId,
        reason: String,
        attempts_made: u32,
    },
    /// Job is waiting for its timer (first run or retry)
    Delayed { job_id: JobId, delay_ms: u64 },
    /// Lease expired while the job was active
    Stalled { job_id: JobId, attempts_made: u32 },
    /// Job record was deleted
    Removed { job_id: JobId },
}

impl QueueEvent {
    /// Event name.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueEvent::Waiting { .. } => "waiting",
            QueueEvent::Active { .. } => "active",
            QueueEvent::Completed { .. } => "completed",
            QueueEvent::Failed { .. } => "failed",
            QueueEvent::Delayed { .. } => "delayed",
            QueueEvent::Stalled { .. } => "stalled",
            QueueEvent::Removed { .. } => "removed",
        }
    }

    /// Job the event is about.
    pub fn job_id(&self) -> JobId {
        match self {
            QueueEvent::Waiting { job_id }
            | QueueEvent::Active { job_id }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Delayed { job_id, .. }
            | QueueEvent::Stalled { job_id, .. }
            | QueueEvent::Removed { job_id } => *job_id,
        }
    }
}

/// Publish side of an event bus.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver an event to current subscribers.
    async fn publish(&self, event: QueueEvent) -> QueueResult<()>;
}

/// In-process bus on a tokio broadcast channel.
///
/// Subscribers that fall behind by more than the capacity miss events.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl BroadcastEventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: QueueEvent) -> QueueResult<()> {
        trace!(event = event.kind(), job_id = %event.job_id(), "Publishing event");
        // no subscribers is not an error
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Bus on a Redis pub/sub channel, shared by every process of a queue.
pub struct RedisEventBus {
    client: redis::Client,
    conn: ConnectionManager,
    channel: String,
}

impl RedisEventBus {
    /// Connect and publish on `channel`.
    pub async fn connect(url: &str, channel: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            channel: channel.into(),
        })
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Subscribe to the channel.
    ///
    /// Messages that are not queue events are logged and skipped. The
    /// receiving task ends when the returned receiver is dropped.
    pub async fn subscribe(&self) -> QueueResult<mpsc::Receiver<QueueEvent>> {
        let (tx, rx) = mpsc::channel(100);

        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        info!(channel = %self.channel, "Subscribed to queue events");

        let channel = self.channel.clone();
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.on_message());
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        error!(error = %e, "Failed to get event payload");
                        continue;
                    }
                };

                let event: QueueEvent = match serde_json::from_str(&payload) {
                    Ok(event) => event,
                    Err(e) => {
                        error!(channel = %channel, error = %e, "Skipping malformed queue event");
                        continue;
                    }
                };

                if tx.send(event).await.is_err() {
                    debug!(channel = %channel, "Event receiver dropped");
                    break;
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: QueueEvent) -> QueueResult<()> {
        let payload =
            serde_json::to_string(&event).map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(&self.channel, payload).await?;

        trace!(
            channel = %self.channel,
            event = event.kind(),
            job_id = %event.job_id(),
            receivers = receivers,
            "Published event"
        );
        Ok(())
    }
}
