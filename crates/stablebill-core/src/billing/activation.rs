//! Activation orchestrator
//!
//! Drives a registration through validation, persistence, and onchain
//! verification synchronously, then completes the first charge in a
//! supervised background task so the HTTP call returns promptly. On
//! shutdown the server drains pending activations through the task
//! tracker before exit.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::billing::classifier::classify;
use crate::models::{
    validate_subscription_id, NewOrder, OrderStatus, OrderType, RegisterSubscriptionRequest,
    Subscription, SubscriptionStatus,
};
use crate::provider::{OnchainProvider, SubscriptionState};
use crate::repository::{BillingStore, CreateOutcome, NewSubscription};
use crate::scheduler::OrderScheduler;
use crate::webhooks::{
    ErrorData, EventData, OrderData, SubscriptionData, TransactionData, WebhookEmitter,
};
use crate::{Error, Result};

pub struct ActivationOrchestrator {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn OnchainProvider>,
    scheduler: Arc<OrderScheduler>,
    webhooks: Arc<WebhookEmitter>,
    /// Engine-owned wallet the permission must authorize
    spender_address: String,
    tracker: TaskTracker,
}

impl ActivationOrchestrator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn OnchainProvider>,
        scheduler: Arc<OrderScheduler>,
        webhooks: Arc<WebhookEmitter>,
        spender_address: String,
    ) -> Self {
        Self {
            store,
            provider,
            scheduler,
            webhooks,
            spender_address,
            tracker: TaskTracker::new(),
        }
    }

    /// Register a subscription and kick off its activation charge.
    ///
    /// Returns once the charge task is spawned; the merchant polls status
    /// through webhooks.
    pub async fn register(
        self: &Arc<Self>,
        account_id: Uuid,
        beneficiary: String,
        request: RegisterSubscriptionRequest,
    ) -> Result<()> {
        validate_subscription_id(&request.subscription_id)?;

        // Amounts are unknown until the onchain state is read below; the
        // initial order starts as a zero-amount placeholder.
        let initial = NewOrder {
            r#type: OrderType::Initial,
            due_at: Utc::now(),
            amount: Decimal::ZERO,
            period_length_seconds: 0,
            status: OrderStatus::Processing,
        };
        let subscription = NewSubscription {
            subscription_id: request.subscription_id.clone(),
            account_id,
            beneficiary_address: beneficiary.clone(),
            provider: request.provider.clone(),
            testnet: request.testnet,
        };

        let order_id = match self
            .store
            .create_subscription_with_order(&subscription, &initial)
            .await?
        {
            CreateOutcome::Created { order_id, .. } => order_id,
            CreateOutcome::Duplicate => {
                return Err(Error::conflict("subscription_exists"));
            }
        };

        let state = match self.verified_state(&request.subscription_id).await {
            Ok(state) => state,
            Err(e) => {
                // the registration row exists; close it out so the failure
                // is visible in the store, then surface the error
                let code = match &e {
                    Error::Forbidden(msg) => msg.clone(),
                    _ => "invalid_configuration".to_string(),
                };
                self.store
                    .mark_subscription_incomplete(
                        &request.subscription_id,
                        order_id,
                        &code,
                        &e.to_string(),
                    )
                    .await?;
                return Err(e);
            }
        };

        let amount = state
            .remaining_charge_in_period
            .expect("verified state has remaining charge");
        let period_seconds = state.period_in_seconds.expect("verified state has period");

        info!(
            subscription_id = %request.subscription_id,
            %account_id,
            %amount,
            "subscription registered"
        );

        let created = EventData {
            subscription: SubscriptionData {
                id: request.subscription_id.clone(),
                status: SubscriptionStatus::Processing,
                amount: state.recurring_charge,
                period_in_seconds: period_seconds,
            },
            order: None,
            transaction: None,
            error: None,
        };
        self.webhooks.emit(account_id, created).await;

        let this = Arc::clone(self);
        let subscription_id = request.subscription_id;
        let provider_tag = request.provider;
        self.tracker.spawn(
            async move {
                this.complete_activation(
                    account_id,
                    subscription_id,
                    provider_tag,
                    beneficiary,
                    order_id,
                    amount,
                    state,
                )
                .await;
            }
            .instrument(tracing::Span::current()),
        );

        Ok(())
    }

    /// Read and verify the permission's onchain state (§ registration
    /// steps 3a-3c)
    async fn verified_state(&self, subscription_id: &str) -> Result<SubscriptionState> {
        let state = self.provider.get_status(subscription_id).await?;

        if !state.is_subscribed {
            return Err(Error::forbidden("subscription_not_active"));
        }

        match state.subscription_owner.as_deref() {
            Some(owner) if owner.eq_ignore_ascii_case(&self.spender_address) => {}
            _ => return Err(Error::forbidden("forbidden")),
        }

        if state.remaining_charge_in_period.is_none()
            || state.next_period_start.is_none()
            || state.period_in_seconds.is_none()
            || state.recurring_charge <= Decimal::ZERO
        {
            return Err(Error::validation("invalid_configuration"));
        }

        Ok(state)
    }

    /// Background half of the activation: charge, then activate or mark
    /// incomplete
    #[allow(clippy::too_many_arguments)]
    async fn complete_activation(
        &self,
        account_id: Uuid,
        subscription_id: String,
        provider_tag: String,
        beneficiary: String,
        order_id: i64,
        amount: Decimal,
        state: SubscriptionState,
    ) {
        let result = self
            .provider
            .charge(&subscription_id, amount, &beneficiary)
            .await;

        let outcome = match result {
            Ok(receipt) => {
                self.activate(
                    account_id,
                    &subscription_id,
                    &provider_tag,
                    order_id,
                    amount,
                    &receipt.transaction_hash,
                    &state,
                )
                .await
            }
            Err(e) => {
                self.fail_activation(account_id, &subscription_id, order_id, amount, &state, e)
                    .await
            }
        };

        if let Err(e) = outcome {
            error!(
                subscription_id = %subscription_id,
                error = %e,
                "activation completion failed"
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn activate(
        &self,
        account_id: Uuid,
        subscription_id: &str,
        provider_tag: &str,
        order_id: i64,
        amount: Decimal,
        transaction_hash: &str,
        state: &SubscriptionState,
    ) -> Result<()> {
        let next_due = state.next_period_start.expect("verified state");
        let period_seconds = state.period_in_seconds.expect("verified state");

        let next_order_id = self
            .store
            .execute_subscription_activation(
                subscription_id,
                order_id,
                transaction_hash,
                next_due,
                state.recurring_charge,
                period_seconds,
            )
            .await?;

        self.scheduler
            .set(next_order_id, next_due, provider_tag)
            .await?;

        info!(
            subscription_id = %subscription_id,
            transaction_hash = %transaction_hash,
            next_order_id,
            "subscription activated"
        );

        let activated = EventData {
            subscription: SubscriptionData {
                id: subscription_id.to_string(),
                status: SubscriptionStatus::Active,
                amount: state.recurring_charge,
                period_in_seconds: period_seconds,
            },
            order: Some(OrderData {
                number: 1,
                r#type: OrderType::Initial,
                amount,
                status: "paid".to_string(),
                current_period_start: state.current_period_start.map(|t| t.timestamp()),
                current_period_end: state.next_period_start.map(|t| t.timestamp()),
                next_retry_at: None,
            }),
            transaction: Some(TransactionData {
                hash: transaction_hash.to_string(),
                amount,
                processed_at: Utc::now().timestamp(),
            }),
            error: None,
        };
        self.webhooks.emit(account_id, activated).await;

        Ok(())
    }

    async fn fail_activation(
        &self,
        account_id: Uuid,
        subscription_id: &str,
        order_id: i64,
        amount: Decimal,
        state: &SubscriptionState,
        err: Error,
    ) -> Result<()> {
        let raw = err.to_string();
        let classification = classify(&raw);

        warn!(
            subscription_id = %subscription_id,
            code = %classification.code,
            "activation charge failed"
        );

        self.store
            .mark_subscription_incomplete(
                subscription_id,
                order_id,
                classification.code.as_str(),
                &raw,
            )
            .await?;

        let failed = EventData {
            subscription: SubscriptionData {
                id: subscription_id.to_string(),
                status: SubscriptionStatus::Incomplete,
                amount: state.recurring_charge,
                period_in_seconds: state.period_in_seconds.unwrap_or(0),
            },
            order: Some(OrderData {
                number: 1,
                r#type: OrderType::Initial,
                amount,
                status: "failed".to_string(),
                current_period_start: None,
                current_period_end: None,
                next_retry_at: None,
            }),
            transaction: None,
            error: Some(ErrorData {
                code: classification.code.as_str().to_string(),
                message: err.public_message(),
            }),
        };
        self.webhooks.emit(account_id, failed).await;

        Ok(())
    }

    /// Cancel a subscription: terminal for billing. Pending orders fail,
    /// their timers drop, in-flight charges observe the status and ack as
    /// stale.
    pub async fn cancel(&self, account_id: Uuid, subscription_id: &str) -> Result<Subscription> {
        let subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .filter(|s| s.account_id == account_id)
            .ok_or_else(|| Error::not_found("subscription not found"))?;

        self.store.cancel_subscription(subscription_id).await?;
        let canceled_orders = self.store.cancel_pending_orders(subscription_id).await?;
        for order_id in &canceled_orders {
            self.scheduler.delete(*order_id).await?;
        }

        info!(
            subscription_id = %subscription_id,
            canceled_orders = canceled_orders.len(),
            "subscription canceled"
        );

        let data = EventData {
            subscription: SubscriptionData {
                id: subscription_id.to_string(),
                status: SubscriptionStatus::Canceled,
                amount: Decimal::ZERO,
                period_in_seconds: 0,
            },
            order: None,
            transaction: None,
            error: None,
        };
        self.webhooks.emit(account_id, data).await;

        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| Error::not_found("subscription not found"))
    }

    /// Stop accepting new activations and wait for in-flight ones
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
