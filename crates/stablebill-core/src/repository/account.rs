//! Account lookups
//!
//! Account and API-key CRUD live outside the engine; these queries exist
//! only so the auth middleware can resolve a key to an account and the
//! activation path can default the beneficiary to the account's payout
//! address.

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    /// Default payout address for subscriptions without an explicit
    /// beneficiary
    pub payout_address: String,
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Resolve a SHA-256 API-key hash to its account
    async fn find_by_api_key_hash(&self, key_hash: &str) -> Result<Option<Account>>;

    async fn get(&self, id: Uuid) -> Result<Option<Account>>;
}

/// PostgreSQL implementation
#[derive(Clone)]
pub struct PostgresAccountRepository {
    pool: PgPool,
}

impl PostgresAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for PostgresAccountRepository {
    async fn find_by_api_key_hash(&self, key_hash: &str) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT a.id, a.name, a.payout_address
            FROM accounts a
            JOIN api_keys k ON k.account_id = a.id
            WHERE k.key_hash = $1 AND k.enabled
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(account)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, name, payout_address FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(account)
    }
}
