//! Redis connection management
//!
//! Thin wrapper around the redis `ConnectionManager` with bounded
//! reconnect attempts. The queues are the only consumers.

use redis::aio::ConnectionManager;
use redis::{Client as RedisClient, Cmd, FromRedisValue, Pipeline, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::cache::{CacheError, CacheResult};
use crate::config::RedisConfig;

/// Redis connection pool
#[derive(Clone)]
pub struct RedisPool {
    client: Arc<RedisClient>,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
    config: Arc<RedisConfig>,
}

impl RedisPool {
    /// Create a new Redis connection pool
    pub async fn new(config: RedisConfig) -> CacheResult<Self> {
        let client = RedisClient::open(&config.url[..])
            .map_err(|e| CacheError::ConnectionError(e.to_string()))?;

        let pool = Self {
            client: Arc::new(client),
            manager: Arc::new(RwLock::new(None)),
            config: Arc::new(config),
        };

        pool.reconnect().await?;

        info!("Redis pool created: url={}", pool.config.url);

        Ok(pool)
    }

    /// Get a connection from the pool
    pub async fn get(&self) -> CacheResult<RedisConnection> {
        {
            let manager_opt = self.manager.read().await;
            if let Some(manager) = manager_opt.as_ref() {
                return Ok(RedisConnection {
                    manager: manager.clone(),
                });
            }
        }

        self.reconnect().await?;

        let manager_opt = self.manager.read().await;
        manager_opt
            .as_ref()
            .map(|manager| RedisConnection {
                manager: manager.clone(),
            })
            .ok_or_else(|| CacheError::ConnectionError("No connection available".to_string()))
    }

    /// Reconnect to Redis with bounded retries
    pub async fn reconnect(&self) -> CacheResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!("Redis connect attempt: {}", attempt);

            match ConnectionManager::new((*self.client).clone()).await {
                Ok(manager) => {
                    *self.manager.write().await = Some(manager);
                    return Ok(());
                }
                Err(e) => {
                    error!("Redis connection attempt {} failed: {}", attempt, e);

                    if attempt >= self.config.max_retries {
                        return Err(CacheError::ConnectionError(format!(
                            "Failed to connect after {} attempts: {}",
                            attempt, e
                        )));
                    }

                    tokio::time::sleep(self.config.retry_delay()).await;
                }
            }
        }
    }

    /// Check pool health with a PING
    pub async fn health_check(&self) -> bool {
        match self.get().await {
            Ok(mut conn) => {
                let mut cmd = Cmd::new();
                cmd.arg("PING");
                matches!(conn.execute::<String>(cmd).await.as_deref(), Ok("PONG"))
            }
            Err(_) => false,
        }
    }
}

/// A live connection checked out of the pool
pub struct RedisConnection {
    manager: ConnectionManager,
}

impl RedisConnection {
    /// Execute a single command
    pub async fn execute<T: FromRedisValue>(&mut self, cmd: Cmd) -> CacheResult<T> {
        cmd.query_async(&mut self.manager)
            .await
            .map_err(CacheError::from)
    }

    /// Execute a pipeline of commands
    pub async fn execute_pipeline(&mut self, pipeline: &Pipeline) -> CacheResult<Vec<Value>> {
        pipeline
            .query_async(&mut self.manager)
            .await
            .map_err(CacheError::from)
    }

    /// GET a raw value
    pub async fn get_bytes(&mut self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut cmd = Cmd::new();
        cmd.arg("GET").arg(key);
        self.execute(cmd).await
    }

    /// SET with TTL
    pub async fn setex(&mut self, key: &str, ttl_secs: u64, value: &[u8]) -> CacheResult<()> {
        let mut cmd = Cmd::new();
        cmd.arg("SETEX").arg(key).arg(ttl_secs).arg(value);
        self.execute::<()>(cmd).await
    }

    /// DEL a key
    pub async fn del(&mut self, key: &str) -> CacheResult<bool> {
        let mut cmd = Cmd::new();
        cmd.arg("DEL").arg(key);
        let removed: i64 = self.execute(cmd).await?;
        Ok(removed > 0)
    }
}
