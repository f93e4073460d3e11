//! Webhook delivery worker
//!
//! Consumes the webhook queue and POSTs each task to its merchant URL.
//! Success is any HTTP 2xx within the attempt timeout. Failures nack with
//! exponential backoff (base 5s, cap 15min); the queue dead-letters a task
//! after the configured attempt budget.
//!
//! The worker never recomputes the signature and never touches the
//! payload: the exact bytes signed at emission go out on every attempt.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WebhookConfig;
use crate::queue::{NackOutcome, TaskQueue};
use crate::webhooks::DeliveryTask;
use crate::{Error, Result};

/// Exponential backoff for delivery attempt `attempt` (1-based)
pub fn delivery_backoff(attempt: u32, base_secs: u64, cap_secs: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay = base_secs.saturating_mul(1u64 << exponent);
    Duration::from_secs(delay.min(cap_secs))
}

/// POST one task to its endpoint; true on HTTP 2xx
pub async fn attempt_delivery(client: &reqwest::Client, task: &DeliveryTask) -> bool {
    let response = client
        .post(&task.url)
        .header("Content-Type", "application/json")
        .header("X-Timestamp", task.timestamp.to_string())
        .header("X-Signature", &task.signature)
        .body(task.payload.clone())
        .send()
        .await;

    match response {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) => {
            warn!(url = %task.url, status = %resp.status(), "webhook delivery rejected");
            false
        }
        Err(e) => {
            warn!(url = %task.url, error = %e, "webhook delivery failed");
            false
        }
    }
}

/// Webhook delivery worker
pub struct DeliveryWorker {
    queue: Arc<TaskQueue<DeliveryTask>>,
    client: reqwest::Client,
    config: WebhookConfig,
}

impl DeliveryWorker {
    pub fn new(queue: Arc<TaskQueue<DeliveryTask>>, config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.delivery_timeout_secs))
            .build()
            .map_err(|e| Error::config(format!("Failed to build delivery client: {}", e)))?;

        Ok(Self {
            queue,
            client,
            config,
        })
    }

    /// Consume the webhook queue until shutdown
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("webhook delivery worker running");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let delivery = match self.queue.dequeue().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
                    }
                }
                Err(e) => {
                    error!(error = %e, "webhook dequeue failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let attempt = delivery.attempt();
            let task = &delivery.task.payload;

            if attempt_delivery(&self.client, task).await {
                debug!(url = %task.url, attempt, "webhook delivered");
                if let Err(e) = self.queue.ack(&delivery).await {
                    error!(error = %e, "webhook ack failed");
                }
            } else {
                let backoff = delivery_backoff(
                    attempt,
                    self.config.backoff_base_secs,
                    self.config.backoff_cap_secs,
                );
                match self.queue.nack(&delivery, backoff.as_secs()).await {
                    Ok(NackOutcome::DeadLettered) => {
                        error!(url = %task.url, attempt, "webhook dead-lettered");
                    }
                    Ok(NackOutcome::Requeued { attempts }) => {
                        debug!(
                            url = %task.url,
                            attempts,
                            backoff_secs = backoff.as_secs(),
                            "webhook redelivery scheduled"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "webhook nack failed");
                    }
                }
            }
        }

        info!("webhook delivery worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::sign_payload;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_task(url: String) -> DeliveryTask {
        let payload = r#"{"type":"subscription.updated","created_at":1700000000,"data":{}}"#;
        let timestamp = 1_700_000_000;
        DeliveryTask {
            url,
            payload: payload.to_string(),
            signature: sign_payload("whsec_test", timestamp, payload),
            timestamp,
        }
    }

    #[test]
    fn test_backoff_doubles_from_base_and_caps() {
        assert_eq!(delivery_backoff(1, 5, 900), Duration::from_secs(5));
        assert_eq!(delivery_backoff(2, 5, 900), Duration::from_secs(10));
        assert_eq!(delivery_backoff(3, 5, 900), Duration::from_secs(20));
        assert_eq!(delivery_backoff(8, 5, 900), Duration::from_secs(640));
        assert_eq!(delivery_backoff(9, 5, 900), Duration::from_secs(900));
        assert_eq!(delivery_backoff(10, 5, 900), Duration::from_secs(900));
    }

    #[test]
    fn test_backoff_total_window_fits_ten_attempts() {
        // 5+10+20+40+80+160+320+640+900 is about 36min of waiting across
        // ten attempts, inside the 52min window
        let total: u64 = (1..10)
            .map(|a| delivery_backoff(a, 5, 900).as_secs())
            .sum();
        assert!(total <= 52 * 60);
    }

    #[tokio::test]
    async fn test_delivery_sends_signature_headers_unchanged() {
        let server = MockServer::start().await;
        let task = test_task(format!("{}/hooks", server.uri()));

        Mock::given(method("POST"))
            .and(path("/hooks"))
            .and(header("Content-Type", "application/json"))
            .and(header("X-Timestamp", "1700000000"))
            .and(header("X-Signature", task.signature.as_str()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        assert!(attempt_delivery(&client, &task).await);
    }

    #[tokio::test]
    async fn test_repeated_attempts_present_identical_signature() {
        let server = MockServer::start().await;
        let task = test_task(format!("{}/hooks", server.uri()));

        Mock::given(method("POST"))
            .and(path("/hooks"))
            .and(header("X-Signature", task.signature.as_str()))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        // the same task retried sends the same bytes and the same header
        assert!(!attempt_delivery(&client, &task).await);
        assert!(!attempt_delivery(&client, &task).await);
    }

    #[tokio::test]
    async fn test_non_2xx_is_a_failed_attempt() {
        let server = MockServer::start().await;
        let task = test_task(format!("{}/hooks", server.uri()));

        Mock::given(method("POST"))
            .and(path("/hooks"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        assert!(!attempt_delivery(&client, &task).await);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_a_failed_attempt() {
        let task = test_task("http://127.0.0.1:1/hooks".to_string());
        let client = reqwest::Client::new();
        assert!(!attempt_delivery(&client, &task).await);
    }
}
