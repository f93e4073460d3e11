//! Order scheduler
//!
//! Transforms a future due-at into a one-shot enqueue of the order onto the
//! charge queue. Timers are durable rows polled by a single loop; the
//! firing protocol guarantees a single enqueue per timer even when a fire
//! is retried or redelivered:
//!
//! 1. Load the record. Missing → cancelled; processed → already fired.
//! 2. Persist processed=true BEFORE the enqueue. A redelivered fire after a
//!    successful enqueue observes the flag and returns.
//! 3. Enqueue the charge message.
//! 4. Delete the record, best-effort; the processed flag still guards
//!    duplicates if this fails.
//! 5. On enqueue failure below the retry cap, revert processed and surface
//!    the error so the poll loop retries. At the cap, set failed=true and
//!    keep processed=true; operators reconcile via the store.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::{ChargeMessage, MessageSink};
use crate::repository::TimerRepository;
use crate::Result;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between due-timer polls
    pub poll_interval: Duration,

    /// Timers handled per poll
    pub batch_size: i64,

    /// Enqueue attempts per fire before the timer is marked failed
    pub max_fire_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            max_fire_retries: 3,
        }
    }
}

/// Outcome of a single fire invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Charge message enqueued
    Enqueued,
    /// Timer missing, already processed, or superseded by a reschedule
    Skipped,
    /// Enqueue attempts exhausted; timer marked failed
    GaveUp,
}

/// Per-order single-shot timer scheduler
pub struct OrderScheduler {
    timers: Arc<dyn TimerRepository>,
    charge_queue: Arc<dyn MessageSink<ChargeMessage>>,
    config: SchedulerConfig,
}

impl OrderScheduler {
    pub fn new(
        timers: Arc<dyn TimerRepository>,
        charge_queue: Arc<dyn MessageSink<ChargeMessage>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            timers,
            charge_queue,
            config,
        }
    }

    /// Create or replace the timer for `order_id`; fires once at `due_at`
    pub async fn set(&self, order_id: i64, due_at: DateTime<Utc>, provider: &str) -> Result<()> {
        self.timers.set(order_id, due_at, provider).await?;
        debug!(order_id, %due_at, "timer set");
        Ok(())
    }

    /// Reschedule while preserving the order id
    pub async fn update(
        &self,
        order_id: i64,
        due_at: Option<DateTime<Utc>>,
        provider: Option<&str>,
    ) -> Result<()> {
        self.timers.update(order_id, due_at, provider).await?;
        debug!(order_id, "timer updated");
        Ok(())
    }

    /// Cancel the timer and drop the record
    pub async fn delete(&self, order_id: i64) -> Result<()> {
        self.timers.delete(order_id).await?;
        debug!(order_id, "timer deleted");
        Ok(())
    }

    /// Fire the timer for `order_id`.
    ///
    /// Invoked by the poll loop; `retry_count` is the number of fire
    /// attempts already consumed for this due timer.
    pub async fn fire(&self, order_id: i64, is_retry: bool, retry_count: u32) -> Result<FireOutcome> {
        let Some(record) = self.timers.get(order_id).await? else {
            debug!(order_id, "fire skipped: timer cancelled");
            return Ok(FireOutcome::Skipped);
        };

        if record.processed {
            debug!(order_id, "fire skipped: already processed");
            return Ok(FireOutcome::Skipped);
        }

        // The processed flag must be durable before the enqueue; a
        // redelivered fire then short-circuits above.
        if !self
            .timers
            .try_mark_processed(order_id, record.generation)
            .await?
        {
            debug!(order_id, "fire skipped: lost processed race");
            return Ok(FireOutcome::Skipped);
        }

        let message = ChargeMessage {
            order_id,
            provider: record.provider.clone(),
        };

        match self.charge_queue.push(&message).await {
            Ok(()) => {
                info!(order_id, is_retry, "charge enqueued");

                if let Err(e) = self.timers.delete(order_id).await {
                    // processed=true still guards against a duplicate fire
                    warn!(order_id, error = %e, "timer cleanup failed");
                }

                Ok(FireOutcome::Enqueued)
            }
            Err(e) => {
                if retry_count + 1 < self.config.max_fire_retries {
                    warn!(
                        order_id,
                        retry_count,
                        error = %e,
                        "charge enqueue failed; will retry"
                    );
                    self.timers
                        .revert_processed(order_id, record.generation)
                        .await?;
                    Err(e)
                } else {
                    error!(
                        order_id,
                        retry_count,
                        error = %e,
                        "charge enqueue failed at retry cap; marking timer failed"
                    );
                    self.timers.mark_failed(order_id).await?;
                    Ok(FireOutcome::GaveUp)
                }
            }
        }
    }

    /// Fire one due timer, driving the bounded retry loop
    async fn fire_with_retries(&self, order_id: i64, is_retry: bool) {
        for attempt in 0..self.config.max_fire_retries {
            match self.fire(order_id, is_retry, attempt).await {
                Ok(_) => return,
                Err(e) => {
                    debug!(order_id, attempt, error = %e, "fire attempt failed");
                }
            }
        }
    }

    /// Poll loop: fire every due timer until shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("order scheduler running");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let due = match self
                .timers
                .due_timers(Utc::now(), self.config.batch_size)
                .await
            {
                Ok(due) => due,
                Err(e) => {
                    error!(error = %e, "failed to load due timers");
                    continue;
                }
            };

            for timer in due {
                self.fire_with_retries(timer.order_id, false).await;
            }
        }

        info!("order scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::{FailingSink, MemorySink};
    use crate::repository::MemoryTimerRepository;

    fn scheduler_with(
        timers: Arc<MemoryTimerRepository>,
        sink: Arc<dyn MessageSink<ChargeMessage>>,
    ) -> OrderScheduler {
        OrderScheduler::new(timers, sink, SchedulerConfig::default())
    }

    #[tokio::test]
    async fn test_fire_twice_enqueues_once() {
        let timers = Arc::new(MemoryTimerRepository::new());
        let sink = Arc::new(MemorySink::<ChargeMessage>::new());
        let scheduler = scheduler_with(timers.clone(), sink.clone());

        scheduler.set(1, Utc::now(), "base").await.unwrap();

        assert_eq!(scheduler.fire(1, false, 0).await.unwrap(), FireOutcome::Enqueued);
        assert_eq!(scheduler.fire(1, false, 0).await.unwrap(), FireOutcome::Skipped);

        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn test_replay_after_cleanup_crash_is_idempotent() {
        let timers = Arc::new(MemoryTimerRepository::new());
        let sink = Arc::new(MemorySink::<ChargeMessage>::new());
        let scheduler = scheduler_with(timers.clone(), sink.clone());

        scheduler.set(2, Utc::now(), "base").await.unwrap();

        // simulate enqueue succeeded but cleanup never ran: processed stays
        // set with the record still present
        let record = timers.get(2).await.unwrap().unwrap();
        timers.try_mark_processed(2, record.generation).await.unwrap();
        sink.push(&ChargeMessage { order_id: 2, provider: "base".into() })
            .await
            .unwrap();

        // redelivered fire observes processed=true and does not enqueue
        assert_eq!(scheduler.fire(2, false, 1).await.unwrap(), FireOutcome::Skipped);
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn test_fire_missing_timer_is_cancelled() {
        let timers = Arc::new(MemoryTimerRepository::new());
        let sink = Arc::new(MemorySink::<ChargeMessage>::new());
        let scheduler = scheduler_with(timers, sink.clone());

        assert_eq!(scheduler.fire(99, false, 0).await.unwrap(), FireOutcome::Skipped);
        assert_eq!(sink.len().await, 0);
    }

    #[tokio::test]
    async fn test_enqueue_failure_reverts_processed_then_retries() {
        let timers = Arc::new(MemoryTimerRepository::new());
        let scheduler = scheduler_with(timers.clone(), Arc::new(FailingSink));

        scheduler.set(3, Utc::now(), "base").await.unwrap();

        // below the cap: error surfaces and processed is reverted
        assert!(scheduler.fire(3, false, 0).await.is_err());
        let record = timers.record(3).unwrap();
        assert!(!record.processed);
        assert!(!record.failed);
    }

    #[tokio::test]
    async fn test_enqueue_failure_at_cap_marks_failed() {
        let timers = Arc::new(MemoryTimerRepository::new());
        let scheduler = scheduler_with(timers.clone(), Arc::new(FailingSink));

        scheduler.set(4, Utc::now(), "base").await.unwrap();

        // final attempt: timer is marked failed, no further enqueues
        assert_eq!(scheduler.fire(4, false, 2).await.unwrap(), FireOutcome::GaveUp);
        let record = timers.record(4).unwrap();
        assert!(record.failed);
        assert!(record.processed);

        assert_eq!(scheduler.fire(4, false, 0).await.unwrap(), FireOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_set_then_delete_drops_fire() {
        let timers = Arc::new(MemoryTimerRepository::new());
        let sink = Arc::new(MemorySink::<ChargeMessage>::new());
        let scheduler = scheduler_with(timers, sink.clone());

        scheduler.set(5, Utc::now(), "base").await.unwrap();
        scheduler.delete(5).await.unwrap();

        assert_eq!(scheduler.fire(5, false, 0).await.unwrap(), FireOutcome::Skipped);
        assert_eq!(sink.len().await, 0);
    }
}
