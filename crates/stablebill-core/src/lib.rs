pub mod billing;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod provider;
pub mod queue;
pub mod repository;
pub mod scheduler;
pub mod webhooks;

// Re-export commonly used types
pub use billing::{
    classify, ActivationOrchestrator, Classification, DunningSchedule, FailureCode, FailureKind,
    PaymentProcessor, ProcessorConfig,
};
pub use config::{BillingConfig, Config, ProviderConfig, WebhookConfig};
pub use error::{Error, Result};
pub use models::{
    Order, OrderStatus, OrderType, Subscription, SubscriptionStatus, WebhookEndpoint,
};
pub use provider::{CdpProvider, MockProvider, OnchainProvider};
pub use queue::{ChargeMessage, MessageSink, QueueConfig, TaskQueue};
pub use repository::{create_pool, BillingStore, Database};
pub use scheduler::{OrderScheduler, SchedulerConfig};
pub use webhooks::{DeliveryTask, WebhookEmitter};

/// Current version of stablebill
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
