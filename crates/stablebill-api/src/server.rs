//! Server bootstrap
//!
//! Wires the engine together: database + migrations, Redis queues, the
//! scheduler poll loop, payment workers, the due-order sweeper, webhook
//! delivery workers, and the HTTP surface. Shutdown cancels the worker
//! loops and drains in-flight activations before exit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::middleware::api_key_auth;
use crate::routes::{health, subscriptions, webhook};
use crate::state::AppState;

use stablebill_core::billing::{
    ActivationOrchestrator, DunningSchedule, PaymentProcessor, ProcessorConfig,
};
use stablebill_core::cache::RedisPool;
use stablebill_core::db::Migrator;
use stablebill_core::provider::{CdpProvider, OnchainProvider};
use stablebill_core::queue::{ChargeMessage, MessageSink, QueueConfig, TaskQueue};
use stablebill_core::repository::{
    AccountRepository, BillingStore, Database, PostgresAccountRepository, PostgresBillingStore,
    PostgresTimerRepository, PostgresWebhookEndpointRepository, TimerRepository,
    WebhookEndpointRepository,
};
use stablebill_core::scheduler::{OrderScheduler, SchedulerConfig};
use stablebill_core::webhooks::delivery::DeliveryWorker;
use stablebill_core::webhooks::{DeliveryTask, WebhookEmitter};
use stablebill_core::{Config, Error, Result};

pub async fn run(config: Config) -> Result<()> {
    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .map_err(|e| Error::Config(format!("Invalid host: {}", e)))?,
        config.server.port,
    ));

    // Database
    let db = Database::connect(&config.database).await?;
    Migrator::new(db.pool().clone()).migrate().await?;
    let pool = db.pool().clone();

    // Queues
    let redis = RedisPool::new(config.redis.clone()).await?;
    let charge_queue = Arc::new(TaskQueue::<ChargeMessage>::new(
        redis.clone(),
        "charges",
        QueueConfig {
            visibility_timeout_secs: 60,
            max_redeliveries: 10,
        },
    ));
    let webhook_queue = Arc::new(TaskQueue::<DeliveryTask>::new(
        redis,
        "webhooks",
        QueueConfig {
            visibility_timeout_secs: 60,
            max_redeliveries: config.webhooks.max_delivery_attempts,
        },
    ));

    // Repositories
    let store: Arc<dyn BillingStore> = Arc::new(PostgresBillingStore::new(pool.clone()));
    let timers: Arc<dyn TimerRepository> = Arc::new(PostgresTimerRepository::new(pool.clone()));
    let endpoints: Arc<dyn WebhookEndpointRepository> =
        Arc::new(PostgresWebhookEndpointRepository::new(pool.clone()));
    let accounts: Arc<dyn AccountRepository> = Arc::new(PostgresAccountRepository::new(pool));

    // Engine components
    let provider: Arc<dyn OnchainProvider> = Arc::new(CdpProvider::new(&config.provider)?);

    let charge_sink: Arc<dyn MessageSink<ChargeMessage>> = charge_queue.clone();
    let scheduler = Arc::new(OrderScheduler::new(
        timers,
        charge_sink.clone(),
        SchedulerConfig {
            poll_interval: Duration::from_secs(config.billing.timer_poll_interval_secs),
            batch_size: config.billing.claim_limit,
            max_fire_retries: config.billing.max_fire_retries,
        },
    ));

    let webhook_sink: Arc<dyn MessageSink<DeliveryTask>> = webhook_queue.clone();
    let emitter = Arc::new(WebhookEmitter::new(endpoints.clone(), webhook_sink));

    let processor = Arc::new(PaymentProcessor::new(
        store.clone(),
        provider.clone(),
        scheduler.clone(),
        emitter.clone(),
        DunningSchedule::from_config(&config.billing),
        ProcessorConfig {
            claim_limit: config.billing.claim_limit,
            sweep_interval: Duration::from_secs(config.billing.sweep_interval_secs),
            transient_retry_delay_secs: 30,
        },
    ));

    let activation = Arc::new(ActivationOrchestrator::new(
        store,
        provider,
        scheduler.clone(),
        emitter,
        config.provider.spender_address.clone(),
    ));

    // Background workers
    let shutdown = CancellationToken::new();
    let mut workers = Vec::new();

    workers.push(tokio::spawn(scheduler.run(shutdown.clone())));

    for _ in 0..config.billing.charge_workers {
        workers.push(tokio::spawn(
            processor
                .clone()
                .consume(charge_queue.clone(), shutdown.clone()),
        ));
    }
    workers.push(tokio::spawn(
        processor.clone().sweep_loop(charge_sink, shutdown.clone()),
    ));

    let delivery_worker = Arc::new(DeliveryWorker::new(
        webhook_queue.clone(),
        config.webhooks.clone(),
    )?);
    for _ in 0..config.webhooks.delivery_workers {
        workers.push(tokio::spawn(
            delivery_worker.clone().run(shutdown.clone()),
        ));
    }

    // HTTP surface
    let state = AppState::new(activation.clone(), accounts, endpoints);
    let protected = Router::new()
        .merge(subscriptions::router())
        .merge(webhook::router())
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            api_key_auth,
        ));
    let app = Router::new()
        .merge(protected)
        .merge(health::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("stablebill API server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    // Drain: stop the loops, finish in-flight activations
    info!("shutting down; draining pending activations");
    shutdown.cancel();
    activation.drain().await;

    let deadline = Duration::from_secs(config.server.graceful_shutdown_timeout_secs);
    if tokio::time::timeout(deadline, join_workers(workers))
        .await
        .is_err()
    {
        error!("workers did not stop within the shutdown deadline");
    }

    Ok(())
}

async fn join_workers(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "worker task panicked");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
