//! Payment processor
//!
//! Consumes `{order_id, provider}` messages from the charge queue, charges
//! through the provider adapter, classifies the outcome, updates the store,
//! emits webhooks, and schedules what comes next: the following recurring
//! order, a dunning retry, or nothing at all.
//!
//! Idempotency rests on three guards, any of which stops a duplicate
//! charge: the scheduler's processed flag (timer-driven enqueues), the
//! store's atomic claims (swept orders), and the paid-transaction check
//! below (message redelivery after a lost ack).

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::billing::classifier::{classify, FailureCode, FailureKind};
use crate::billing::dunning::DunningSchedule;
use crate::models::{OrderDetails, OrderStatus, OrderType, SubscriptionStatus};
use crate::provider::OnchainProvider;
use crate::queue::{ChargeMessage, MessageSink, TaskQueue};
use crate::repository::BillingStore;
use crate::scheduler::OrderScheduler;
use crate::webhooks::{ErrorData, EventData, OrderData, SubscriptionData, TransactionData, WebhookEmitter};
use crate::{Error, Result};

/// Processor tuning
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Orders claimed per due-order sweep
    pub claim_limit: i64,

    /// Interval between sweeps
    pub sweep_interval: Duration,

    /// Redelivery delay after an upstream-transient failure
    pub transient_retry_delay_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            claim_limit: 50,
            sweep_interval: Duration::from_secs(60),
            transient_retry_delay_secs: 30,
        }
    }
}

/// What the consumer loop should do with the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Nack for broker-level redelivery
    Retry,
}

pub struct PaymentProcessor {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn OnchainProvider>,
    scheduler: Arc<OrderScheduler>,
    webhooks: Arc<WebhookEmitter>,
    dunning: DunningSchedule,
    config: ProcessorConfig,
}

impl PaymentProcessor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn OnchainProvider>,
        scheduler: Arc<OrderScheduler>,
        webhooks: Arc<WebhookEmitter>,
        dunning: DunningSchedule,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            provider,
            scheduler,
            webhooks,
            dunning,
            config,
        }
    }

    /// Process one charge message end to end
    pub async fn handle_charge(&self, message: &ChargeMessage) -> Result<Disposition> {
        let Some(details) = self.store.get_order_details(message.order_id).await? else {
            debug!(order_id = message.order_id, "order missing; ack");
            return Ok(Disposition::Ack);
        };

        if self.is_stale(&details) {
            debug!(
                order_id = message.order_id,
                order_status = ?details.status,
                subscription_status = ?details.subscription_status,
                "stale charge message; ack"
            );
            return Ok(Disposition::Ack);
        }

        self.store.mark_order_processing(details.order_id).await?;

        // Redelivery after a successful charge whose ack was lost: the
        // transaction already exists, so never call the provider again.
        if let Some(hash) = self.store.find_paid_transaction(details.order_id).await? {
            debug!(
                order_id = details.order_id,
                transaction_hash = %hash,
                "order already paid; ack"
            );
            return Ok(Disposition::Ack);
        }

        let charge = self
            .provider
            .charge(
                &details.subscription_id,
                details.amount,
                &details.beneficiary_address,
            )
            .await;

        match charge {
            Ok(receipt) => {
                self.handle_success(&details, &receipt.transaction_hash)
                    .await?;
                Ok(Disposition::Ack)
            }
            Err(e) => self.handle_failure(&details, e).await,
        }
    }

    /// A message is stale when billing already finished with this order or
    /// the subscription is terminal. A Failed order with a retry deadline
    /// is a scheduled dunning retry, not a stale message.
    fn is_stale(&self, details: &OrderDetails) -> bool {
        match details.subscription_status {
            SubscriptionStatus::Canceled
            | SubscriptionStatus::Unpaid
            | SubscriptionStatus::Incomplete => return true,
            _ => {}
        }

        match details.status {
            OrderStatus::Paid => true,
            OrderStatus::Failed => details.next_retry_at.is_none(),
            _ => false,
        }
    }

    async fn handle_success(&self, details: &OrderDetails, transaction_hash: &str) -> Result<()> {
        info!(
            order_id = details.order_id,
            subscription_id = %details.subscription_id,
            transaction_hash = %transaction_hash,
            "charge succeeded"
        );

        // A recovering subscription clears its retry state first
        if details.subscription_status == SubscriptionStatus::PastDue {
            self.store
                .reactivate_subscription(details.order_id, &details.subscription_id)
                .await?;
        }

        let state = self.provider.get_status(&details.subscription_id).await?;
        let next = match (state.is_subscribed, state.next_period_start) {
            (true, Some(next_start)) if state.recurring_charge > rust_decimal::Decimal::ZERO => {
                Some((
                    next_start,
                    state.recurring_charge,
                    state.period_in_seconds.unwrap_or(details.period_length_seconds),
                ))
            }
            _ => None,
        };

        let next_order_id = match details.r#type {
            OrderType::Initial => {
                let (next_due, next_amount, period) = next.ok_or_else(|| {
                    Error::provider("activation succeeded but no next period onchain")
                })?;
                Some(
                    self.store
                        .execute_subscription_activation(
                            &details.subscription_id,
                            details.order_id,
                            transaction_hash,
                            next_due,
                            next_amount,
                            period,
                        )
                        .await?,
                )
            }
            OrderType::Recurring => {
                self.store
                    .execute_recurring_success(
                        &details.subscription_id,
                        details.order_id,
                        transaction_hash,
                        next,
                    )
                    .await?
            }
        };

        if let (Some(order_id), Some((next_due, _, _))) = (next_order_id, next) {
            self.scheduler
                .set(order_id, next_due, &details.provider)
                .await?;
        }

        let data = EventData {
            subscription: self.subscription_data(details, SubscriptionStatus::Active),
            order: Some(self.order_data(details, "paid", None)),
            transaction: Some(TransactionData {
                hash: transaction_hash.to_string(),
                amount: details.amount,
                processed_at: Utc::now().timestamp(),
            }),
            error: None,
        };
        self.webhooks.emit(details.account_id, data).await;

        Ok(())
    }

    async fn handle_failure(&self, details: &OrderDetails, err: Error) -> Result<Disposition> {
        let raw = err.to_string();
        let classification = classify(&raw);

        warn!(
            order_id = details.order_id,
            subscription_id = %details.subscription_id,
            kind = ?classification.kind,
            code = %classification.code,
            "charge failed"
        );

        match classification.kind {
            FailureKind::Terminal => {
                self.cancel_after_terminal(details, classification.code, &raw)
                    .await?;
                Ok(Disposition::Ack)
            }

            FailureKind::RetryablePayment => {
                self.enter_dunning(details, classification.code, &err, &raw)
                    .await?;
                Ok(Disposition::Ack)
            }

            FailureKind::UpstreamTransient => {
                // infrastructure, not the payer: no state change, no
                // webhook, let the broker redeliver
                Ok(Disposition::Retry)
            }

            FailureKind::Other => {
                self.fail_and_continue(details, classification.code, &err, &raw)
                    .await?;
                Ok(Disposition::Ack)
            }
        }
    }

    /// Permission revoked or expired: the subscription cannot continue
    async fn cancel_after_terminal(
        &self,
        details: &OrderDetails,
        code: FailureCode,
        raw: &str,
    ) -> Result<()> {
        self.store
            .update_order(
                details.order_id,
                OrderStatus::Failed,
                Some(code.as_str()),
                Some(raw),
                None,
            )
            .await?;
        self.store
            .cancel_subscription(&details.subscription_id)
            .await?;

        self.scheduler.delete(details.order_id).await?;
        let canceled = self
            .store
            .cancel_pending_orders(&details.subscription_id)
            .await?;
        for order_id in &canceled {
            self.scheduler.delete(*order_id).await?;
        }

        info!(
            subscription_id = %details.subscription_id,
            canceled_orders = canceled.len(),
            code = %code,
            "subscription canceled on terminal error"
        );

        let failure = EventData {
            subscription: self.subscription_data(details, SubscriptionStatus::Canceled),
            order: Some(self.order_data(details, "failed", None)),
            transaction: None,
            error: Some(ErrorData {
                code: code.as_str().to_string(),
                message: raw.to_string(),
            }),
        };
        self.webhooks.emit(details.account_id, failure).await;

        let canceled_event = EventData {
            subscription: self.subscription_data(details, SubscriptionStatus::Canceled),
            order: None,
            transaction: None,
            error: None,
        };
        self.webhooks.emit(details.account_id, canceled_event).await;

        Ok(())
    }

    /// Insufficient balance: schedule a capped retry or give up
    async fn enter_dunning(
        &self,
        details: &OrderDetails,
        code: FailureCode,
        err: &Error,
        raw: &str,
    ) -> Result<()> {
        let attempts_after = details.attempts + 1;

        if !self.dunning.is_exhausted(attempts_after) {
            let next_retry_at = self
                .dunning
                .next_retry_at(details.attempts, Utc::now())
                .expect("schedule not exhausted");

            self.store
                .schedule_retry(
                    details.order_id,
                    &details.subscription_id,
                    next_retry_at,
                    Some(code.as_str()),
                    Some(raw),
                )
                .await?;
            self.scheduler
                .set(details.order_id, next_retry_at, &details.provider)
                .await?;

            info!(
                order_id = details.order_id,
                attempts = attempts_after,
                %next_retry_at,
                "dunning retry scheduled"
            );

            let data = EventData {
                subscription: self.subscription_data(details, SubscriptionStatus::PastDue),
                order: Some(self.order_data(details, "failed", Some(next_retry_at.timestamp()))),
                transaction: None,
                error: Some(ErrorData {
                    code: code.as_str().to_string(),
                    message: err.public_message(),
                }),
            };
            self.webhooks.emit(details.account_id, data).await;
        } else {
            self.store
                .exhaust_retries(details.order_id, &details.subscription_id, code.as_str(), raw)
                .await?;
            self.scheduler.delete(details.order_id).await?;

            warn!(
                order_id = details.order_id,
                attempts = attempts_after,
                "dunning exhausted; subscription unpaid"
            );

            let data = EventData {
                subscription: self.subscription_data(details, SubscriptionStatus::Unpaid),
                order: Some(self.order_data(details, "failed", None)),
                transaction: None,
                error: Some(ErrorData {
                    code: code.as_str().to_string(),
                    message: err.public_message(),
                }),
            };
            self.webhooks.emit(details.account_id, data).await;
        }

        Ok(())
    }

    /// Unclassified payment failure: record it, keep the subscription
    /// Active, and keep the cadence going if the permission still allows it
    async fn fail_and_continue(
        &self,
        details: &OrderDetails,
        code: FailureCode,
        err: &Error,
        raw: &str,
    ) -> Result<()> {
        self.store
            .update_order(
                details.order_id,
                OrderStatus::Failed,
                Some(code.as_str()),
                Some(raw),
                None,
            )
            .await?;

        match self.provider.get_status(&details.subscription_id).await {
            Ok(state) if state.is_subscribed => {
                if let Some(next_due) = state.next_period_start {
                    let amount = if state.recurring_charge > rust_decimal::Decimal::ZERO {
                        state.recurring_charge
                    } else {
                        details.amount
                    };
                    let period = state
                        .period_in_seconds
                        .unwrap_or(details.period_length_seconds);
                    let next_order_id = self
                        .store
                        .create_recurring_order(&details.subscription_id, next_due, amount, period)
                        .await?;
                    self.scheduler
                        .set(next_order_id, next_due, &details.provider)
                        .await?;
                }
            }
            Ok(_) => {
                debug!(
                    subscription_id = %details.subscription_id,
                    "permission no longer subscribed; no next order"
                );
            }
            Err(e) => {
                warn!(
                    subscription_id = %details.subscription_id,
                    error = %e,
                    "status check after payment failure failed"
                );
            }
        }

        let data = EventData {
            subscription: self.subscription_data(details, details.subscription_status),
            order: Some(self.order_data(details, "failed", None)),
            transaction: None,
            error: Some(ErrorData {
                code: code.as_str().to_string(),
                message: err.public_message(),
            }),
        };
        self.webhooks.emit(details.account_id, data).await;

        Ok(())
    }

    fn subscription_data(
        &self,
        details: &OrderDetails,
        status: SubscriptionStatus,
    ) -> SubscriptionData {
        SubscriptionData {
            id: details.subscription_id.clone(),
            status,
            amount: details.amount,
            period_in_seconds: details.period_length_seconds,
        }
    }

    fn order_data(
        &self,
        details: &OrderDetails,
        status: &str,
        next_retry_at: Option<i64>,
    ) -> OrderData {
        OrderData {
            number: details.order_number,
            r#type: details.r#type,
            amount: details.amount,
            status: status.to_string(),
            current_period_start: Some(details.due_at.timestamp()),
            current_period_end: Some(details.period_end().timestamp()),
            next_retry_at,
        }
    }

    /// One due-order sweep: claim scheduled orders and due dunning retries,
    /// feed them to the charge queue. The backstop for lost timers.
    pub async fn sweep(&self, sink: &dyn MessageSink<ChargeMessage>) -> Result<usize> {
        let mut fed = 0;

        let due = self.store.claim_due_orders(self.config.claim_limit).await?;
        for order in &due {
            sink.push(&ChargeMessage {
                order_id: order.order_id,
                provider: order.provider.clone(),
            })
            .await?;
        }
        fed += due.len();

        let retries = self.store.get_due_retries(self.config.claim_limit).await?;
        for order in &retries {
            sink.push(&ChargeMessage {
                order_id: order.order_id,
                provider: order.provider.clone(),
            })
            .await?;
        }
        fed += retries.len();

        if fed > 0 {
            info!(claimed = fed, "due-order sweep enqueued charges");
        }
        Ok(fed)
    }

    /// Charge-queue consumer loop; run one per worker
    pub async fn consume(
        self: Arc<Self>,
        queue: Arc<TaskQueue<ChargeMessage>>,
        shutdown: CancellationToken,
    ) {
        info!("payment worker running");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let delivery = match queue.dequeue().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
                    }
                }
                Err(e) => {
                    error!(error = %e, "charge dequeue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let disposition = self.handle_charge(&delivery.task.payload).await;
            let result = match disposition {
                Ok(Disposition::Ack) => queue.ack(&delivery).await.map(|_| ()),
                Ok(Disposition::Retry) => queue
                    .nack(&delivery, self.config.transient_retry_delay_secs)
                    .await
                    .map(|_| ()),
                Err(e) => {
                    // unexpected failure mid-processing: redeliver, the
                    // idempotency guards absorb the replay
                    error!(
                        order_id = delivery.task.payload.order_id,
                        error = %e,
                        "charge processing failed; redelivering"
                    );
                    queue
                        .nack(&delivery, self.config.transient_retry_delay_secs)
                        .await
                        .map(|_| ())
                }
            };

            if let Err(e) = result {
                error!(error = %e, "charge queue ack/nack failed");
            }
        }

        info!("payment worker stopped");
    }

    /// Periodic sweep loop
    pub async fn sweep_loop(
        self: Arc<Self>,
        sink: Arc<dyn MessageSink<ChargeMessage>>,
        shutdown: CancellationToken,
    ) {
        info!("due-order sweeper running");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }

            if let Err(e) = self.sweep(sink.as_ref()).await {
                error!(error = %e, "due-order sweep failed");
            }
        }

        info!("due-order sweeper stopped");
    }
}
