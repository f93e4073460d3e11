//! Repository module for database access
//!
//! PostgreSQL is the single source of truth; every multi-row mutation runs
//! as one transaction or one statement. Memory implementations back local
//! development and tests.

pub mod account;
pub mod billing;
pub mod memory;
pub mod timer;
pub mod webhook;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::{Error, Result};

pub use account::{Account, AccountRepository, PostgresAccountRepository};
pub use billing::{BillingStore, CreateOutcome, NewSubscription, PostgresBillingStore};
pub use memory::{
    MemoryAccountRepository, MemoryBillingStore, MemoryTimerRepository,
    MemoryWebhookEndpointRepository,
};
pub use timer::{PostgresTimerRepository, TimerRecord, TimerRepository};
pub use webhook::{PostgresWebhookEndpointRepository, WebhookEndpointRepository};

/// Create a PostgreSQL connection pool
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.pool_size)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(Error::Database)
}

/// Handle on the database shared by repositories and the migrator
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = create_pool(config).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
