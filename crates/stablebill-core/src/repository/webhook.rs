//! Webhook endpoint repository

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::WebhookEndpoint;
use crate::{Error, Result};

#[async_trait]
pub trait WebhookEndpointRepository: Send + Sync {
    /// Create or replace the account's endpoint with a fresh secret
    async fn upsert(&self, account_id: Uuid, url: &str, secret: &str) -> Result<()>;

    async fn get(&self, account_id: Uuid) -> Result<Option<WebhookEndpoint>>;
}

/// PostgreSQL implementation
#[derive(Clone)]
pub struct PostgresWebhookEndpointRepository {
    pool: PgPool,
}

impl PostgresWebhookEndpointRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEndpointRepository for PostgresWebhookEndpointRepository {
    async fn upsert(&self, account_id: Uuid, url: &str, secret: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhooks (account_id, url, secret, enabled, created_at, modified_at)
            VALUES ($1, $2, $3, TRUE, NOW(), NOW())
            ON CONFLICT (account_id) DO UPDATE
            SET url = EXCLUDED.url,
                secret = EXCLUDED.secret,
                enabled = TRUE,
                modified_at = NOW()
            "#,
        )
        .bind(account_id)
        .bind(url)
        .bind(secret)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn get(&self, account_id: Uuid) -> Result<Option<WebhookEndpoint>> {
        let endpoint = sqlx::query_as::<_, WebhookEndpoint>(
            "SELECT * FROM webhooks WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(endpoint)
    }
}
