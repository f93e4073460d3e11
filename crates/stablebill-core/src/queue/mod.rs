//! Internal task queues backed by Redis
//!
//! Two queues drive the engine: the charge queue (scheduler → payment
//! processor) and the webhook queue (emitter → delivery worker). Both get
//! the same discipline:
//! - at-least-once delivery with a visibility timeout
//! - explicit ack/nack with delayed redelivery
//! - bounded redeliveries, then a dead-letter list
//!
//! Keys per queue: `{ns}/pending` (list), `{ns}/delayed` (zset, score =
//! ready-at), `{ns}/processing` (zset, score = visibility deadline),
//! `{ns}/dead` (list). Members are the serialized task envelope, so a task
//! moves between structures without a second lookup.

pub mod memory;

use async_trait::async_trait;
use redis::{Cmd, Pipeline};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheError, RedisPool};

/// Queue error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("Task serialization error: {0}")]
    Serialization(String),

    #[error("Task deserialization error: {0}")]
    Deserialization(String),

    #[error("Queue backend error: {0}")]
    Backend(String),
}

/// Queue result type
pub type QueueResult<T> = Result<T, QueueError>;

impl From<CacheError> for QueueError {
    fn from(err: CacheError) -> Self {
        QueueError::Backend(err.to_string())
    }
}

impl From<QueueError> for crate::Error {
    fn from(err: QueueError) -> Self {
        crate::Error::Queue(err.to_string())
    }
}

/// Charge-queue message: one scheduled charge attempt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChargeMessage {
    pub order_id: i64,
    pub provider: String,
}

/// Per-queue retry discipline
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Seconds an unacked task stays invisible before redelivery
    pub visibility_timeout_secs: u64,

    /// Deliveries before a task is dead-lettered
    pub max_redeliveries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 60,
            max_redeliveries: 10,
        }
    }
}

/// Serialized task envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask<T> {
    pub id: Uuid,
    /// Completed deliveries so far
    pub attempts: u32,
    pub enqueued_at: i64,
    pub payload: T,
}

/// A dequeued task plus the exact bytes it is tracked under
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub task: QueuedTask<T>,
    raw: String,
}

impl<T> Delivery<T> {
    /// Delivery attempt number, 1-based
    pub fn attempt(&self) -> u32 {
        self.task.attempts + 1
    }
}

/// Redis-backed task queue
pub struct TaskQueue<T> {
    pool: RedisPool,
    name: String,
    namespace: String,
    config: QueueConfig,
    _payload: PhantomData<fn() -> T>,
}

impl<T> TaskQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Create a new task queue
    pub fn new(pool: RedisPool, name: impl Into<String>, config: QueueConfig) -> Self {
        let name = name.into();
        Self {
            pool,
            namespace: format!("queue:{}", name),
            name,
            config,
            _payload: PhantomData,
        }
    }

    /// Get queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a task for immediate delivery
    pub async fn enqueue(&self, payload: &T) -> QueueResult<()> {
        let task = QueuedTask {
            id: Uuid::new_v4(),
            attempts: 0,
            enqueued_at: chrono::Utc::now().timestamp(),
            payload,
        };
        let raw = serde_json::to_string(&task)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self.pool.get().await?;
        let mut cmd = Cmd::new();
        cmd.arg("LPUSH").arg(self.pending_key()).arg(&raw);
        conn.execute::<i64>(cmd).await?;

        debug!(queue = %self.name, task_id = %task.id, "task enqueued");
        Ok(())
    }

    /// Pop one task, registering it in-flight until acked
    ///
    /// Promotes due delayed tasks and expired in-flight tasks first, so a
    /// single consumer loop keeps the whole queue moving.
    pub async fn dequeue(&self) -> QueueResult<Option<Delivery<T>>> {
        self.promote_due().await?;

        let mut conn = self.pool.get().await?;
        let mut cmd = Cmd::new();
        cmd.arg("RPOP").arg(self.pending_key());
        let raw: Option<String> = conn.execute(cmd).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let task: QueuedTask<T> = serde_json::from_str(&raw)
            .map_err(|e| QueueError::Deserialization(e.to_string()))?;

        let deadline =
            chrono::Utc::now().timestamp() + self.config.visibility_timeout_secs as i64;
        let mut cmd = Cmd::new();
        cmd.arg("ZADD").arg(self.processing_key()).arg(deadline).arg(&raw);
        conn.execute::<i64>(cmd).await?;

        Ok(Some(Delivery { task, raw }))
    }

    /// Acknowledge a task: remove it from the in-flight set
    pub async fn ack(&self, delivery: &Delivery<T>) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        let mut cmd = Cmd::new();
        cmd.arg("ZREM").arg(self.processing_key()).arg(&delivery.raw);
        conn.execute::<i64>(cmd).await?;
        Ok(())
    }

    /// Negative-acknowledge a task: redeliver after `delay_secs`, or
    /// dead-letter it once redeliveries are exhausted
    pub async fn nack(&self, delivery: &Delivery<T>, delay_secs: u64) -> QueueResult<NackOutcome> {
        let next = QueuedTask {
            id: delivery.task.id,
            attempts: delivery.task.attempts + 1,
            enqueued_at: delivery.task.enqueued_at,
            payload: &delivery.task.payload,
        };

        let mut conn = self.pool.get().await?;
        let mut pipeline = Pipeline::new();
        pipeline
            .cmd("ZREM")
            .arg(self.processing_key())
            .arg(&delivery.raw);

        let outcome = if next.attempts >= self.config.max_redeliveries {
            let raw = serde_json::to_string(&next)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            pipeline.cmd("LPUSH").arg(self.dead_key()).arg(&raw);
            warn!(
                queue = %self.name,
                task_id = %next.id,
                attempts = next.attempts,
                "task dead-lettered"
            );
            NackOutcome::DeadLettered
        } else {
            let raw = serde_json::to_string(&next)
                .map_err(|e| QueueError::Serialization(e.to_string()))?;
            let ready_at = chrono::Utc::now().timestamp() + delay_secs as i64;
            pipeline
                .cmd("ZADD")
                .arg(self.delayed_key())
                .arg(ready_at)
                .arg(&raw);
            NackOutcome::Requeued {
                attempts: next.attempts,
            }
        };

        conn.execute_pipeline(&pipeline).await?;
        Ok(outcome)
    }

    /// Move due delayed tasks and visibility-expired in-flight tasks back
    /// onto the pending list
    pub async fn promote_due(&self) -> QueueResult<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut promoted = 0;

        for source in [self.delayed_key(), self.processing_key()] {
            let mut conn = self.pool.get().await?;
            let mut cmd = Cmd::new();
            cmd.arg("ZRANGEBYSCORE")
                .arg(&source)
                .arg("-inf")
                .arg(now)
                .arg("LIMIT")
                .arg(0)
                .arg(100);
            let due: Vec<String> = conn.execute(cmd).await?;

            if due.is_empty() {
                continue;
            }

            let mut pipeline = Pipeline::new();
            for raw in &due {
                pipeline.cmd("ZREM").arg(&source).arg(raw);
                pipeline.cmd("LPUSH").arg(self.pending_key()).arg(raw);
            }
            conn.execute_pipeline(&pipeline).await?;
            promoted += due.len();
        }

        if promoted > 0 {
            debug!(queue = %self.name, promoted, "tasks promoted");
        }
        Ok(promoted)
    }

    /// Pending depth (ready tasks only)
    pub async fn len(&self) -> QueueResult<usize> {
        let mut conn = self.pool.get().await?;
        let mut cmd = Cmd::new();
        cmd.arg("LLEN").arg(self.pending_key());
        let len: i64 = conn.execute(cmd).await?;
        Ok(len as usize)
    }

    /// Dead-letter depth
    pub async fn dead_len(&self) -> QueueResult<usize> {
        let mut conn = self.pool.get().await?;
        let mut cmd = Cmd::new();
        cmd.arg("LLEN").arg(self.dead_key());
        let len: i64 = conn.execute(cmd).await?;
        Ok(len as usize)
    }

    /// Drop every key owned by this queue
    pub async fn clear(&self) -> QueueResult<()> {
        let mut conn = self.pool.get().await?;
        for key in [
            self.pending_key(),
            self.delayed_key(),
            self.processing_key(),
            self.dead_key(),
        ] {
            conn.del(&key).await?;
        }
        Ok(())
    }

    fn pending_key(&self) -> String {
        format!("{}/pending", self.namespace)
    }

    fn delayed_key(&self) -> String {
        format!("{}/delayed", self.namespace)
    }

    fn processing_key(&self) -> String {
        format!("{}/processing", self.namespace)
    }

    fn dead_key(&self) -> String {
        format!("{}/dead", self.namespace)
    }
}

/// Result of a nack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { attempts: u32 },
    DeadLettered,
}

/// Producer-side seam: anything a component can push tasks into.
///
/// The scheduler and the webhook emitter hold a sink rather than the
/// concrete queue so tests can capture pushes in memory.
#[async_trait]
pub trait MessageSink<T>: Send + Sync {
    async fn push(&self, payload: &T) -> crate::Result<()>;
}

#[async_trait]
impl<T> MessageSink<T> for TaskQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn push(&self, payload: &T) -> crate::Result<()> {
        self.enqueue(payload).await.map_err(crate::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;

    // Redis-backed tests no-op when no local Redis is reachable.
    #[tokio::test]
    async fn test_enqueue_dequeue_ack() {
        if let Ok(pool) = RedisPool::new(RedisConfig::default()).await {
            let queue: TaskQueue<ChargeMessage> =
                TaskQueue::new(pool, "test_charge", QueueConfig::default());
            queue.clear().await.unwrap();

            let msg = ChargeMessage {
                order_id: 42,
                provider: "base".to_string(),
            };
            queue.enqueue(&msg).await.unwrap();
            assert_eq!(queue.len().await.unwrap(), 1);

            let delivery = queue.dequeue().await.unwrap().unwrap();
            assert_eq!(delivery.task.payload, msg);
            assert_eq!(delivery.attempt(), 1);

            queue.ack(&delivery).await.unwrap();
            assert_eq!(queue.len().await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_nack_dead_letters_after_max_redeliveries() {
        if let Ok(pool) = RedisPool::new(RedisConfig::default()).await {
            let config = QueueConfig {
                visibility_timeout_secs: 60,
                max_redeliveries: 1,
            };
            let queue: TaskQueue<ChargeMessage> = TaskQueue::new(pool, "test_dlq", config);
            queue.clear().await.unwrap();

            let msg = ChargeMessage {
                order_id: 7,
                provider: "base".to_string(),
            };
            queue.enqueue(&msg).await.unwrap();

            let delivery = queue.dequeue().await.unwrap().unwrap();
            let outcome = queue.nack(&delivery, 0).await.unwrap();
            assert_eq!(outcome, NackOutcome::DeadLettered);
            assert_eq!(queue.dead_len().await.unwrap(), 1);
        }
    }

    #[tokio::test]
    async fn test_nack_requeues_with_delay() {
        if let Ok(pool) = RedisPool::new(RedisConfig::default()).await {
            let queue: TaskQueue<ChargeMessage> =
                TaskQueue::new(pool, "test_requeue", QueueConfig::default());
            queue.clear().await.unwrap();

            let msg = ChargeMessage {
                order_id: 9,
                provider: "base".to_string(),
            };
            queue.enqueue(&msg).await.unwrap();

            let delivery = queue.dequeue().await.unwrap().unwrap();
            let outcome = queue.nack(&delivery, 0).await.unwrap();
            assert_eq!(outcome, NackOutcome::Requeued { attempts: 1 });

            // delay 0 means immediately promotable
            let redelivered = queue.dequeue().await.unwrap().unwrap();
            assert_eq!(redelivered.task.payload, msg);
            assert_eq!(redelivered.attempt(), 2);
            queue.ack(&redelivered).await.unwrap();
        }
    }
}
