//! In-memory repository implementations
//!
//! Mirror the PostgreSQL semantics closely enough that the engine's state
//! machine can be exercised without a database: same status transitions,
//! same gap-free order numbering, same claim behavior. Used by local
//! development and by the scenario tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::{
    DueOrder, NewOrder, Order, OrderDetails, OrderStatus, OrderType, Subscription,
    SubscriptionStatus, WebhookEndpoint,
};
use crate::repository::account::{Account, AccountRepository};
use crate::repository::billing::{BillingStore, CreateOutcome, NewSubscription};
use crate::repository::timer::{TimerRecord, TimerRepository};
use crate::repository::webhook::WebhookEndpointRepository;
use crate::{Error, Result};

#[derive(Default)]
struct BillingState {
    subscriptions: HashMap<String, Subscription>,
    orders: BTreeMap<i64, Order>,
    next_order_id: i64,
}

impl BillingState {
    fn next_order_number(&self, subscription_id: &str) -> i32 {
        self.orders
            .values()
            .filter(|o| o.subscription_id == subscription_id)
            .map(|o| o.order_number)
            .max()
            .unwrap_or(0)
            + 1
    }

    fn insert_order(&mut self, subscription_id: &str, new: &NewOrder) -> (i64, i32) {
        self.next_order_id += 1;
        let id = self.next_order_id;
        let order_number = self.next_order_number(subscription_id);
        self.orders.insert(
            id,
            Order {
                id,
                subscription_id: subscription_id.to_string(),
                order_number,
                r#type: new.r#type,
                due_at: new.due_at,
                amount: new.amount,
                period_length_seconds: new.period_length_seconds,
                status: new.status,
                attempts: 0,
                next_retry_at: None,
                failure_reason: None,
                raw_error: None,
                transaction_hash: None,
                created_at: Utc::now(),
            },
        );
        (id, order_number)
    }

    fn touch_subscription(&mut self, subscription_id: &str, status: SubscriptionStatus) {
        if let Some(sub) = self.subscriptions.get_mut(subscription_id) {
            sub.status = status;
            sub.modified_at = Utc::now();
        }
    }
}

/// In-memory billing store
pub struct MemoryBillingStore {
    state: Mutex<BillingState>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BillingState::default()),
        }
    }

    /// Test hook: read an order back
    pub fn order(&self, order_id: i64) -> Option<Order> {
        self.state.lock().unwrap().orders.get(&order_id).cloned()
    }

    /// Test hook: read a subscription back
    pub fn subscription(&self, subscription_id: &str) -> Option<Subscription> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .get(subscription_id)
            .cloned()
    }

    /// Test hook: all order numbers for a subscription, sorted
    pub fn order_numbers(&self, subscription_id: &str) -> Vec<i32> {
        let state = self.state.lock().unwrap();
        let mut numbers: Vec<i32> = state
            .orders
            .values()
            .filter(|o| o.subscription_id == subscription_id)
            .map(|o| o.order_number)
            .collect();
        numbers.sort_unstable();
        numbers
    }
}

impl Default for MemoryBillingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn create_subscription_with_order(
        &self,
        subscription: &NewSubscription,
        initial: &NewOrder,
    ) -> Result<CreateOutcome> {
        let mut state = self.state.lock().unwrap();

        if state.subscriptions.contains_key(&subscription.subscription_id) {
            return Ok(CreateOutcome::Duplicate);
        }

        let now = Utc::now();
        state.subscriptions.insert(
            subscription.subscription_id.clone(),
            Subscription {
                subscription_id: subscription.subscription_id.clone(),
                account_id: subscription.account_id,
                beneficiary_address: subscription.beneficiary_address.clone(),
                provider: subscription.provider.clone(),
                testnet: subscription.testnet,
                status: SubscriptionStatus::Processing,
                created_at: now,
                modified_at: now,
            },
        );

        let (order_id, order_number) =
            state.insert_order(&subscription.subscription_id, initial);

        Ok(CreateOutcome::Created {
            order_id,
            order_number,
        })
    }

    async fn subscription_exists(&self, subscription_id: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .subscriptions
            .contains_key(subscription_id))
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>> {
        Ok(self.subscription(subscription_id))
    }

    async fn get_order_details(&self, order_id: i64) -> Result<Option<OrderDetails>> {
        let state = self.state.lock().unwrap();
        let Some(order) = state.orders.get(&order_id) else {
            return Ok(None);
        };
        let Some(sub) = state.subscriptions.get(&order.subscription_id) else {
            return Ok(None);
        };

        Ok(Some(OrderDetails {
            order_id: order.id,
            subscription_id: order.subscription_id.clone(),
            order_number: order.order_number,
            r#type: order.r#type,
            due_at: order.due_at,
            amount: order.amount,
            period_length_seconds: order.period_length_seconds,
            status: order.status,
            attempts: order.attempts,
            next_retry_at: order.next_retry_at,
            transaction_hash: order.transaction_hash.clone(),
            subscription_status: sub.status,
            account_id: sub.account_id,
            beneficiary_address: sub.beneficiary_address.clone(),
            provider: sub.provider.clone(),
            testnet: sub.testnet,
        }))
    }

    async fn execute_subscription_activation(
        &self,
        subscription_id: &str,
        order_id: i64,
        transaction_hash: &str,
        next_due_at: DateTime<Utc>,
        next_amount: Decimal,
        period_seconds: i64,
    ) -> Result<i64> {
        let mut state = self.state.lock().unwrap();

        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| Error::not_found(format!("order {}", order_id)))?;
        order.status = OrderStatus::Paid;
        order.transaction_hash = Some(transaction_hash.to_string());

        let next = NewOrder {
            r#type: OrderType::Recurring,
            due_at: next_due_at,
            amount: next_amount,
            period_length_seconds: period_seconds,
            status: OrderStatus::Pending,
        };
        let (next_order_id, _) = state.insert_order(subscription_id, &next);

        state.touch_subscription(subscription_id, SubscriptionStatus::Active);

        Ok(next_order_id)
    }

    async fn mark_subscription_incomplete(
        &self,
        subscription_id: &str,
        order_id: i64,
        reason: &str,
        raw_error: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if let Some(order) = state.orders.get_mut(&order_id) {
            order.status = OrderStatus::Failed;
            order.failure_reason = Some(reason.to_string());
            order.raw_error = Some(raw_error.to_string());
        }
        state.touch_subscription(subscription_id, SubscriptionStatus::Incomplete);

        Ok(())
    }

    async fn execute_recurring_success(
        &self,
        subscription_id: &str,
        order_id: i64,
        transaction_hash: &str,
        next: Option<(DateTime<Utc>, Decimal, i64)>,
    ) -> Result<Option<i64>> {
        let mut state = self.state.lock().unwrap();

        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| Error::not_found(format!("order {}", order_id)))?;
        order.status = OrderStatus::Paid;
        order.transaction_hash = Some(transaction_hash.to_string());
        order.next_retry_at = None;
        order.failure_reason = None;
        order.raw_error = None;

        let next_order_id = next.map(|(due_at, amount, period_seconds)| {
            let order = NewOrder {
                r#type: OrderType::Recurring,
                due_at,
                amount,
                period_length_seconds: period_seconds,
                status: OrderStatus::Pending,
            };
            state.insert_order(subscription_id, &order).0
        });

        state.touch_subscription(subscription_id, SubscriptionStatus::Active);

        Ok(next_order_id)
    }

    async fn update_order(
        &self,
        order_id: i64,
        status: OrderStatus,
        failure_reason: Option<&str>,
        raw_error: Option<&str>,
        transaction_hash: Option<&str>,
    ) -> Result<i32> {
        let mut state = self.state.lock().unwrap();
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| Error::not_found(format!("order {}", order_id)))?;

        order.status = status;
        if let Some(reason) = failure_reason {
            order.failure_reason = Some(reason.to_string());
        }
        if let Some(raw) = raw_error {
            order.raw_error = Some(raw.to_string());
        }
        if let Some(hash) = transaction_hash {
            order.transaction_hash = Some(hash.to_string());
        }

        Ok(order.order_number)
    }

    async fn mark_order_processing(&self, order_id: i64) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(false);
        };

        if matches!(order.status, OrderStatus::Pending | OrderStatus::Failed) {
            order.status = OrderStatus::Processing;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .touch_subscription(subscription_id, status);
        Ok(())
    }

    async fn schedule_retry(
        &self,
        order_id: i64,
        subscription_id: &str,
        next_retry_at: DateTime<Utc>,
        reason: Option<&str>,
        raw_error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if let Some(order) = state.orders.get_mut(&order_id) {
            order.status = OrderStatus::Failed;
            order.attempts += 1;
            order.next_retry_at = Some(next_retry_at);
            if let Some(reason) = reason {
                order.failure_reason = Some(reason.to_string());
            }
            if let Some(raw) = raw_error {
                order.raw_error = Some(raw.to_string());
            }
        }
        state.touch_subscription(subscription_id, SubscriptionStatus::PastDue);

        Ok(())
    }

    async fn exhaust_retries(
        &self,
        order_id: i64,
        subscription_id: &str,
        reason: &str,
        raw_error: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if let Some(order) = state.orders.get_mut(&order_id) {
            order.status = OrderStatus::Failed;
            order.attempts += 1;
            order.next_retry_at = None;
            order.failure_reason = Some(reason.to_string());
            order.raw_error = Some(raw_error.to_string());
        }
        state.touch_subscription(subscription_id, SubscriptionStatus::Unpaid);

        Ok(())
    }

    async fn reactivate_subscription(&self, order_id: i64, subscription_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if let Some(order) = state.orders.get_mut(&order_id) {
            order.next_retry_at = None;
        }
        state.touch_subscription(subscription_id, SubscriptionStatus::Active);

        Ok(())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<()> {
        self.update_subscription(subscription_id, SubscriptionStatus::Canceled)
            .await
    }

    async fn cancel_pending_orders(&self, subscription_id: &str) -> Result<Vec<i64>> {
        let mut state = self.state.lock().unwrap();
        let mut canceled = Vec::new();

        for order in state.orders.values_mut() {
            if order.subscription_id == subscription_id && order.status == OrderStatus::Pending {
                order.status = OrderStatus::Failed;
                order.failure_reason = Some("canceled".to_string());
                canceled.push(order.id);
            }
        }

        Ok(canceled)
    }

    async fn claim_due_orders(&self, limit: i64) -> Result<Vec<DueOrder>> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut claimed = Vec::new();

        let due_ids: Vec<i64> = state
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending && o.due_at <= now)
            .filter(|o| {
                state
                    .subscriptions
                    .get(&o.subscription_id)
                    .map(|s| s.status == SubscriptionStatus::Active)
                    .unwrap_or(false)
            })
            .map(|o| o.id)
            .take(limit as usize)
            .collect();

        for id in due_ids {
            let subscription_id;
            let amount;
            let attempts;
            {
                let order = state.orders.get_mut(&id).unwrap();
                order.status = OrderStatus::Processing;
                subscription_id = order.subscription_id.clone();
                amount = order.amount;
                attempts = order.attempts;
            }
            let sub = state.subscriptions.get(&subscription_id).unwrap();
            claimed.push(DueOrder {
                order_id: id,
                subscription_id,
                provider: sub.provider.clone(),
                amount,
                attempts,
                testnet: sub.testnet,
            });
        }

        Ok(claimed)
    }

    async fn get_due_retries(&self, limit: i64) -> Result<Vec<DueOrder>> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();

        let due_ids: Vec<i64> = state
            .orders
            .values()
            .filter(|o| {
                o.status == OrderStatus::Failed
                    && o.next_retry_at.map(|t| t <= now).unwrap_or(false)
            })
            .filter(|o| {
                state
                    .subscriptions
                    .get(&o.subscription_id)
                    .map(|s| s.status == SubscriptionStatus::PastDue)
                    .unwrap_or(false)
            })
            .map(|o| o.id)
            .take(limit as usize)
            .collect();

        let mut claimed = Vec::new();
        for id in due_ids {
            let subscription_id;
            let amount;
            let attempts;
            {
                let order = state.orders.get_mut(&id).unwrap();
                order.status = OrderStatus::Processing;
                subscription_id = order.subscription_id.clone();
                amount = order.amount;
                attempts = order.attempts;
            }
            let sub = state.subscriptions.get(&subscription_id).unwrap();
            claimed.push(DueOrder {
                order_id: id,
                subscription_id,
                provider: sub.provider.clone(),
                amount,
                attempts,
                testnet: sub.testnet,
            });
        }

        Ok(claimed)
    }

    async fn create_recurring_order(
        &self,
        subscription_id: &str,
        due_at: DateTime<Utc>,
        amount: Decimal,
        period_seconds: i64,
    ) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        let order = NewOrder {
            r#type: OrderType::Recurring,
            due_at,
            amount,
            period_length_seconds: period_seconds,
            status: OrderStatus::Pending,
        };
        Ok(state.insert_order(subscription_id, &order).0)
    }

    async fn find_paid_transaction(&self, order_id: i64) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .get(&order_id)
            .filter(|o| o.status == OrderStatus::Paid)
            .and_then(|o| o.transaction_hash.clone()))
    }
}

/// In-memory timer repository
pub struct MemoryTimerRepository {
    timers: Mutex<HashMap<i64, TimerRecord>>,
}

impl MemoryTimerRepository {
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Test hook: read a timer back
    pub fn record(&self, order_id: i64) -> Option<TimerRecord> {
        self.timers.lock().unwrap().get(&order_id).cloned()
    }
}

impl Default for MemoryTimerRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimerRepository for MemoryTimerRepository {
    async fn set(&self, order_id: i64, due_at: DateTime<Utc>, provider: &str) -> Result<()> {
        let mut timers = self.timers.lock().unwrap();
        let generation = timers.get(&order_id).map(|t| t.generation + 1).unwrap_or(1);
        timers.insert(
            order_id,
            TimerRecord {
                order_id,
                due_at,
                provider: provider.to_string(),
                processed: false,
                failed: false,
                generation,
            },
        );
        Ok(())
    }

    async fn update(
        &self,
        order_id: i64,
        due_at: Option<DateTime<Utc>>,
        provider: Option<&str>,
    ) -> Result<()> {
        let mut timers = self.timers.lock().unwrap();
        if let Some(timer) = timers.get_mut(&order_id) {
            if let Some(due_at) = due_at {
                timer.due_at = due_at;
            }
            if let Some(provider) = provider {
                timer.provider = provider.to_string();
            }
            timer.processed = false;
            timer.failed = false;
            timer.generation += 1;
        }
        Ok(())
    }

    async fn delete(&self, order_id: i64) -> Result<()> {
        self.timers.lock().unwrap().remove(&order_id);
        Ok(())
    }

    async fn get(&self, order_id: i64) -> Result<Option<TimerRecord>> {
        Ok(self.timers.lock().unwrap().get(&order_id).cloned())
    }

    async fn try_mark_processed(&self, order_id: i64, generation: i64) -> Result<bool> {
        let mut timers = self.timers.lock().unwrap();
        match timers.get_mut(&order_id) {
            Some(timer) if timer.generation == generation && !timer.processed => {
                timer.processed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revert_processed(&self, order_id: i64, generation: i64) -> Result<()> {
        let mut timers = self.timers.lock().unwrap();
        if let Some(timer) = timers.get_mut(&order_id) {
            if timer.generation == generation && !timer.failed {
                timer.processed = false;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, order_id: i64) -> Result<()> {
        let mut timers = self.timers.lock().unwrap();
        if let Some(timer) = timers.get_mut(&order_id) {
            timer.failed = true;
            timer.processed = true;
        }
        Ok(())
    }

    async fn due_timers(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<TimerRecord>> {
        let timers = self.timers.lock().unwrap();
        let mut due: Vec<TimerRecord> = timers
            .values()
            .filter(|t| !t.processed && !t.failed && t.due_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|t| t.due_at);
        due.truncate(limit as usize);
        Ok(due)
    }
}

/// In-memory webhook endpoint repository
pub struct MemoryWebhookEndpointRepository {
    endpoints: Mutex<HashMap<Uuid, WebhookEndpoint>>,
}

impl MemoryWebhookEndpointRepository {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryWebhookEndpointRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookEndpointRepository for MemoryWebhookEndpointRepository {
    async fn upsert(&self, account_id: Uuid, url: &str, secret: &str) -> Result<()> {
        let now = Utc::now();
        self.endpoints.lock().unwrap().insert(
            account_id,
            WebhookEndpoint {
                account_id,
                url: url.to_string(),
                secret: secret.to_string(),
                enabled: true,
                created_at: now,
                modified_at: now,
            },
        );
        Ok(())
    }

    async fn get(&self, account_id: Uuid) -> Result<Option<WebhookEndpoint>> {
        Ok(self.endpoints.lock().unwrap().get(&account_id).cloned())
    }
}

/// In-memory account repository
pub struct MemoryAccountRepository {
    accounts: Mutex<HashMap<Uuid, Account>>,
    keys: Mutex<HashMap<String, Uuid>>,
}

impl MemoryAccountRepository {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert_account(&self, account: Account, key_hash: Option<&str>) {
        if let Some(hash) = key_hash {
            self.keys.lock().unwrap().insert(hash.to_string(), account.id);
        }
        self.accounts.lock().unwrap().insert(account.id, account);
    }
}

impl Default for MemoryAccountRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountRepository for MemoryAccountRepository {
    async fn find_by_api_key_hash(&self, key_hash: &str) -> Result<Option<Account>> {
        let id = self.keys.lock().unwrap().get(key_hash).copied();
        match id {
            Some(id) => Ok(self.accounts.lock().unwrap().get(&id).cloned()),
            None => Ok(None),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Account>> {
        Ok(self.accounts.lock().unwrap().get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sub_id(tag: u8) -> String {
        format!("0x{}", format!("{:02x}", tag).repeat(32))
    }

    fn new_subscription(tag: u8) -> NewSubscription {
        NewSubscription {
            subscription_id: sub_id(tag),
            account_id: Uuid::new_v4(),
            beneficiary_address: "0xbeef".to_string(),
            provider: "base".to_string(),
            testnet: false,
        }
    }

    fn initial_order(amount: Decimal) -> NewOrder {
        NewOrder {
            r#type: OrderType::Initial,
            due_at: Utc::now(),
            amount,
            period_length_seconds: 60,
            status: OrderStatus::Processing,
        }
    }

    #[tokio::test]
    async fn test_duplicate_create_leaves_store_unchanged() {
        let store = MemoryBillingStore::new();
        let sub = new_subscription(1);

        let first = store
            .create_subscription_with_order(&sub, &initial_order(dec!(0.5)))
            .await
            .unwrap();
        assert!(matches!(first, CreateOutcome::Created { order_number: 1, .. }));

        let second = store
            .create_subscription_with_order(&sub, &initial_order(dec!(0.5)))
            .await
            .unwrap();
        assert_eq!(second, CreateOutcome::Duplicate);
        assert_eq!(store.order_numbers(&sub.subscription_id), vec![1]);
        assert!(store.subscription_exists(&sub.subscription_id).await.unwrap());
        assert!(!store.subscription_exists(&sub_id(99)).await.unwrap());
    }

    #[tokio::test]
    async fn test_order_numbers_are_gap_free() {
        let store = MemoryBillingStore::new();
        let sub = new_subscription(2);

        let CreateOutcome::Created { order_id, .. } = store
            .create_subscription_with_order(&sub, &initial_order(dec!(0.5)))
            .await
            .unwrap()
        else {
            panic!("expected created");
        };

        let next = store
            .execute_subscription_activation(
                &sub.subscription_id,
                order_id,
                "0xTX1",
                Utc::now(),
                dec!(1.0),
                60,
            )
            .await
            .unwrap();

        store
            .execute_recurring_success(
                &sub.subscription_id,
                next,
                "0xTX2",
                Some((Utc::now(), dec!(1.0), 60)),
            )
            .await
            .unwrap();

        assert_eq!(store.order_numbers(&sub.subscription_id), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_claim_due_orders_requires_active_subscription() {
        let store = MemoryBillingStore::new();
        let sub = new_subscription(3);

        let CreateOutcome::Created { order_id, .. } = store
            .create_subscription_with_order(&sub, &initial_order(dec!(0.5)))
            .await
            .unwrap()
        else {
            panic!("expected created");
        };

        // subscription still Processing: the pending order is not claimable
        let next = store
            .execute_subscription_activation(
                &sub.subscription_id,
                order_id,
                "0xTX1",
                Utc::now() - chrono::Duration::seconds(1),
                dec!(1.0),
                60,
            )
            .await
            .unwrap();

        let claimed = store.claim_due_orders(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].order_id, next);

        // claimed orders are Processing now; a second claim gets nothing
        let again = store.claim_due_orders(10).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_retry_increments_attempts_and_marks_past_due() {
        let store = MemoryBillingStore::new();
        let sub = new_subscription(4);

        let CreateOutcome::Created { order_id, .. } = store
            .create_subscription_with_order(&sub, &initial_order(dec!(1.0)))
            .await
            .unwrap()
        else {
            panic!("expected created");
        };

        let retry_at = Utc::now() + chrono::Duration::days(1);
        store
            .schedule_retry(
                order_id,
                &sub.subscription_id,
                retry_at,
                Some("insufficient_balance"),
                Some("not enough"),
            )
            .await
            .unwrap();

        let order = store.order(order_id).unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(order.attempts, 1);
        assert_eq!(order.next_retry_at, Some(retry_at));
        assert_eq!(
            store.subscription(&sub.subscription_id).unwrap().status,
            SubscriptionStatus::PastDue
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_orders_returns_ids() {
        let store = MemoryBillingStore::new();
        let sub = new_subscription(5);

        let CreateOutcome::Created { order_id, .. } = store
            .create_subscription_with_order(&sub, &initial_order(dec!(0.5)))
            .await
            .unwrap()
        else {
            panic!("expected created");
        };

        let pending = store
            .execute_subscription_activation(
                &sub.subscription_id,
                order_id,
                "0xTX1",
                Utc::now() + chrono::Duration::seconds(60),
                dec!(1.0),
                60,
            )
            .await
            .unwrap();

        let canceled = store
            .cancel_pending_orders(&sub.subscription_id)
            .await
            .unwrap();
        assert_eq!(canceled, vec![pending]);
        let order = store.order(pending).unwrap();
        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(order.failure_reason.as_deref(), Some("canceled"));
    }

    #[tokio::test]
    async fn test_timer_generation_guards_stale_fires() {
        let timers = MemoryTimerRepository::new();
        timers.set(1, Utc::now(), "base").await.unwrap();

        let record = timers.get(1).await.unwrap().unwrap();
        assert_eq!(record.generation, 1);

        // reschedule bumps the generation; the stale fire loses
        timers.update(1, Some(Utc::now()), None).await.unwrap();
        assert!(!timers.try_mark_processed(1, record.generation).await.unwrap());
        assert!(timers.try_mark_processed(1, record.generation + 1).await.unwrap());
    }
}
