//! Settlement reconciliation service
//!
//! ```text
//! executions topic ──▶ OrderReconciler  ──┐
//! cancel topic     ──▶ CancelReconciler ──┼──▶ PostgreSQL ──▶ stream / notifications
//! interval tick    ──▶ FundingScheduler ──┘         ▲
//!                        └─▶ clearing broker, bank aggregator
//! ```
//!
//! Usage: `settlement_recon [--env dev]` (reads `config/<env>.yaml`)

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use settlement_recon::clients::{HttpAggregator, HttpClearingBroker};
use settlement_recon::config::{AppConfig, PublisherKind};
use settlement_recon::db::Database;
use settlement_recon::execution::{CancelReconciler, OrderReconciler};
use settlement_recon::failure::FailureRecorder;
use settlement_recon::funding::{
    FundingScheduler, FundingWorker, RelationshipHandler, TransferHandler,
};
use settlement_recon::logging::init_logging;
use settlement_recon::notify::{
    BroadcastHub, EventPublisher, HttpPublisher, Notifier, TracingNotifier,
};
use settlement_recon::queue::KafkaSubscription;
use settlement_recon::store::{PgStore, Store};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn build_publisher(config: &AppConfig) -> anyhow::Result<Arc<dyn EventPublisher>> {
    let publisher: Arc<dyn EventPublisher> = match config.publisher.kind {
        PublisherKind::Broadcast => Arc::new(BroadcastHub::new(config.publisher.capacity)),
        PublisherKind::Http => Arc::new(
            HttpPublisher::new(
                &config.publisher.base_url,
                &config.publisher.api_key,
                std::time::Duration::from_millis(config.publisher.timeout_ms),
            )
            .context("Failed to build stream publisher")?,
        ),
    };
    Ok(publisher)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = init_logging(&config);

    tracing::info!(
        env = %env,
        mode = ?config.mode,
        git_hash = env!("GIT_HASH"),
        "Starting settlement reconciliation"
    );

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------
    let db = Database::connect(&config.postgres_url, config.max_connections)
        .await
        .context("Failed to connect to PostgreSQL")?;
    if config.run_migrations {
        db.migrate().await.context("Failed to apply migrations")?;
    }
    db.health_check().await.context("PostgreSQL health check failed")?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(db.pool().clone()));
    let recorder = Arc::new(FailureRecorder::new(store.clone()));

    // ------------------------------------------------------------------
    // Collaborators
    // ------------------------------------------------------------------
    let publisher = build_publisher(&config)?;
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let broker = Arc::new(
        HttpClearingBroker::new(
            &config.broker.base_url,
            &config.broker.api_key,
            &config.broker.api_secret,
            config.broker.timeout(),
        )
        .context("Failed to build clearing broker client")?,
    );
    let aggregator = Arc::new(
        HttpAggregator::new(
            &config.aggregator.base_url,
            &config.aggregator.client_id,
            &config.aggregator.secret,
            config.aggregator.timeout(),
        )
        .context("Failed to build aggregator client")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // ------------------------------------------------------------------
    // Reconciliation engines
    // ------------------------------------------------------------------
    let execution_sub = KafkaSubscription::connect(&config.execution, &config.execution.queue)
        .context("Failed to subscribe to execution topic")?;
    let cancel_sub =
        KafkaSubscription::connect(&config.execution, &config.execution.cancel_queue)
            .context("Failed to subscribe to cancel-rejection topic")?;

    let order_reconciler = Arc::new(OrderReconciler::new(
        &config.execution.queue,
        store.clone(),
        recorder.clone(),
        publisher.clone(),
        notifier.clone(),
    ));
    let cancel_reconciler = Arc::new(CancelReconciler::new(
        &config.execution.cancel_queue,
        store.clone(),
        recorder.clone(),
        publisher.clone(),
    ));

    {
        let engine = order_reconciler.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            engine.run(execution_sub, shutdown).await;
        }));
    }
    {
        let engine = cancel_reconciler.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            engine.run(cancel_sub, shutdown).await;
        }));
    }

    // ------------------------------------------------------------------
    // Funding sweep
    // ------------------------------------------------------------------
    let relationships = RelationshipHandler::new(
        store.clone(),
        broker.clone(),
        notifier.clone(),
        config.funding.micro_deposit_max_attempts,
    );
    let transfers = TransferHandler::new(store.clone(), broker, aggregator, notifier, config.mode);
    let worker = Arc::new(FundingWorker::new(store, relationships, transfers));
    let scheduler = Arc::new(FundingScheduler::new(
        worker,
        config.funding.sweep_interval(),
        config.funding.single_flight_wait(),
    ));
    tasks.push(tokio::spawn(scheduler.run(shutdown_rx)));

    tracing::info!(
        execution_topic = %config.execution.queue,
        cancel_topic = %config.execution.cancel_queue,
        brokers = %config.execution.brokers,
        sweep_interval_ms = config.funding.sweep_interval_ms,
        "Workers started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, draining workers");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Worker task ended abnormally");
        }
    }

    tracing::info!(
        self_tests_seen = order_reconciler.liveness().count(),
        "Settlement reconciliation stopped"
    );
    Ok(())
}
