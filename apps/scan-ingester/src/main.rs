mod cache;
mod config;
mod ingest;
mod pipeline;
mod scan;
mod store;
mod subscriber;

use crate::cache::{RecordCache, RedisCache};
use crate::config::Config;
use crate::ingest::Ingester;
use crate::pipeline::{IngestStats, MessageRequest, PipelineHandle, UpsertWorker};
use crate::store::{build_pool, PgStore, UpsertStore};
use crate::subscriber::Subscription;
use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Deadline for deleting the subscription once the drain starts.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_output.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config);

    tracing::info!("starting scan ingester");

    let pool = build_pool(&config.database_url(), config.db_pool_size)
        .await
        .context("failed to connect to postgres")?;
    sqlx::migrate!()
        .run(&pool)
        .await
        .context("failed to run database migrations")?;
    let store: Arc<dyn UpsertStore> = Arc::new(PgStore::new(pool));

    let subscription = Subscription::create(&config.broker_addr, &config.topic_id, &config.project_id)
        .await
        .context("failed to create subscription")?;

    let cache: Option<Arc<dyn RecordCache>> = if config.redis_enabled {
        let cache = RedisCache::connect(&config.redis_url(), config.redis_ttl())
            .await
            .context("failed to connect to redis")?;
        Some(Arc::new(cache))
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let stats = Arc::new(IngestStats::new());
    let (tx, rx) = async_channel::bounded::<MessageRequest>(config.worker_count);

    tracing::info!(worker_count = config.worker_count, "starting upsert workers");
    let mut workers = Vec::with_capacity(config.worker_count);
    for _ in 0..config.worker_count {
        let worker = UpsertWorker::new(
            rx.clone(),
            store.clone(),
            cache.clone(),
            stats.clone(),
            config.flush_interval(),
            config.max_batch_size,
        );
        workers.push(worker.spawn(cancel.clone()));
    }
    drop(rx);

    let ingester = Arc::new(Ingester::new(
        PipelineHandle::new(tx, stats.clone()),
        config.ack_timeout(),
    ));
    let receive_handle = {
        let subscription = subscription.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = subscription.receive(cancel, ingester).await {
                tracing::error!(error = %err, "subscription receive loop exited");
            }
        })
    };

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install signal handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    tracing::info!("shutdown signal received, finishing up");
    cancel.cancel();

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, subscription.delete()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error = %err, "failed to delete subscription"),
        Err(_) => tracing::error!("timed out deleting subscription"),
    }

    let _ = receive_handle.await;
    for worker in workers {
        let _ = worker.await;
    }

    tracing::info!(
        last_batch_len = stats.last_batch_len.load(Ordering::Relaxed),
        last_flush_unix_ms = stats.last_flush_unix_ms.load(Ordering::Relaxed),
        failed_flushes = stats.failed_flushes.load(Ordering::Relaxed),
        "goodbye"
    );
    Ok(())
}
