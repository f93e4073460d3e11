//! In-memory message sink for local development and testing

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::queue::MessageSink;
use crate::Result;

/// Captures pushed payloads in a vec instead of a broker
#[derive(Clone)]
pub struct MemorySink<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> MemorySink<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of everything pushed so far
    pub async fn drain(&self) -> Vec<T> {
        self.items.lock().await.drain(..).collect()
    }

    pub async fn items(&self) -> Vec<T> {
        self.items.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

impl<T: Clone> Default for MemorySink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> MessageSink<T> for MemorySink<T>
where
    T: Clone + Send + Sync,
{
    async fn push(&self, payload: &T) -> Result<()> {
        self.items.lock().await.push(payload.clone());
        Ok(())
    }
}

/// A sink that rejects every push; exercises enqueue-failure paths
pub struct FailingSink;

#[async_trait]
impl<T: Send + Sync> MessageSink<T> for FailingSink {
    async fn push(&self, _payload: &T) -> Result<()> {
        Err(crate::Error::queue("sink unavailable"))
    }
}
