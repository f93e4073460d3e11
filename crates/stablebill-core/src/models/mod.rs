//! Data model for the billing engine

pub mod order;
pub mod subscription;
pub mod webhook;

pub use order::{DueOrder, NewOrder, Order, OrderDetails, OrderStatus, OrderType};
pub use subscription::{
    RegisterSubscriptionRequest, Subscription, SubscriptionStatus, validate_subscription_id,
};
pub use webhook::WebhookEndpoint;
