//! ChatRelay Worker - Main Entry Point
//!
//! Loads configuration, connects to the broker and record store, and relays
//! chat requests through the worker pool until a shutdown signal arrives.

use anyhow::Context;
use chatrelay_common::{RelayConfig, METRICS};
use chatrelay_worker::broker::forward_deliveries;
use chatrelay_worker::{
    AmqpAcker, BrokerConnection, ChatWorker, HttpGenerator, RecordStore, RelaySettings, WorkerPool,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = RelayConfig::from_env().context("loading configuration")?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter_directive().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let worker_config = &config.worker;
    info!(worker_id = %worker_config.worker_id, "Starting ChatRelay worker");

    let generator = HttpGenerator::new(&config.generation)?;
    info!(
        endpoint = %generator.endpoint(),
        model = %config.generation.model_path().display(),
        tokenizer = %config.generation.tokenizer_path().display(),
        "Generation client ready"
    );

    let store = RecordStore::connect(config.store.as_ref())
        .await
        .context("connecting to record store")?;

    let broker = BrokerConnection::connect(&config.broker, worker_config.ack_mode, config.prefetch_count())
        .await
        .context("connecting to broker")?;

    let worker = Arc::new(ChatWorker::new(
        generator,
        broker.publisher(),
        store,
        RelaySettings::from_config(&config)?,
        METRICS.relay.clone(),
    ));

    let pool = WorkerPool::<AmqpAcker>::spawn(
        worker.clone(),
        worker_config.concurrency,
        worker_config.queue_capacity,
        METRICS.pool.clone(),
    );

    let consumer = broker
        .consume(&worker_config.worker_id)
        .await
        .context("subscribing to request queue")?;

    info!("ChatRelay worker running");

    let result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            Ok(())
        }
        result = forward_deliveries(consumer, &pool, broker.ack_mode()) => result,
    };

    // Release resources in reverse order of acquisition
    pool.shutdown().await;
    if let Err(e) = broker.close().await {
        warn!("Error closing broker connection: {}", e);
    }
    match Arc::try_unwrap(worker) {
        Ok(worker) => worker.into_store().close().await,
        Err(_) => warn!("Worker still referenced at shutdown, store left open"),
    }

    debug!("Final metrics:\n{}", METRICS.gather());

    if let Err(e) = &result {
        error!("Consumer stopped: {}", e);
    }
    result?;

    info!("ChatRelay worker shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
