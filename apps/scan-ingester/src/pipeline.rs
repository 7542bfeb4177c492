use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::RecordCache;
use crate::scan::Scan;
use crate::store::UpsertStore;

/// Ceiling on one storage flush. Detached from the shutdown latch so a drain
/// cannot orphan a half-written batch.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(60);

/// Terminal outcome of a failed batch flush, fanned out to every request
/// that was in the batch. Cloneable because one failure answers many waiters.
#[derive(Debug, Clone, Error)]
#[error("batch flush failed: {reason}")]
pub struct FlushError {
    reason: String,
}

impl FlushError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// One in-flight observation: the decoded scan plus the single-use reply
/// slot its coordinator task is waiting on.
#[derive(Debug)]
pub struct MessageRequest {
    pub(crate) scan: Scan,
    pub(crate) reply: oneshot::Sender<Result<(), FlushError>>,
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub failed_flushes: AtomicU64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Producer side of the worker pool. Clone one per coordinator task.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: async_channel::Sender<MessageRequest>,
    stats: Arc<IngestStats>,
}

impl PipelineHandle {
    pub fn new(tx: async_channel::Sender<MessageRequest>, stats: Arc<IngestStats>) -> Self {
        Self { tx, stats }
    }

    /// Queue one scan for upsert. The returned receiver resolves exactly once,
    /// after the record is persisted, rejected as stale, or its batch fails.
    /// May block on worker backpressure.
    pub async fn dispatch(&self, scan: Scan) -> Result<oneshot::Receiver<Result<(), FlushError>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth = depth, key = %scan.key(), "queued scan");
        if self
            .tx
            .send(MessageRequest {
                scan,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(anyhow!("worker channel closed"));
        }
        Ok(reply_rx)
    }
}

/// Consumes decoded scans from the shared channel, gates them against the
/// ordering cache, and batches admitted records into set-based upserts.
pub struct UpsertWorker {
    rx: async_channel::Receiver<MessageRequest>,
    store: Arc<dyn UpsertStore>,
    cache: Option<Arc<dyn RecordCache>>,
    stats: Arc<IngestStats>,
    flush_interval: Duration,
    max_batch_size: usize,
}

impl UpsertWorker {
    pub fn new(
        rx: async_channel::Receiver<MessageRequest>,
        store: Arc<dyn UpsertStore>,
        cache: Option<Arc<dyn RecordCache>>,
        stats: Arc<IngestStats>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        if cache.is_none() {
            tracing::info!("no ordering cache configured, relying on storage for ordering");
        }
        Self {
            rx,
            store,
            cache,
            stats,
            flush_interval,
            max_batch_size,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let mut batch: Vec<MessageRequest> = Vec::with_capacity(self.max_batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        // the first tick completes immediately; the flush cadence starts one
        // full interval from now
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("shutdown requested, draining batch");
                    self.flush(&mut batch).await;
                    return;
                }
                _ = ticker.tick() => {
                    self.flush(&mut batch).await;
                }
                msg = self.rx.recv() => {
                    let Ok(msg) = msg else {
                        self.flush(&mut batch).await;
                        return;
                    };
                    self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    if !self.should_store(&msg.scan).await {
                        // stale by the ordering gate: acknowledged without a write
                        let _ = msg.reply.send(Ok(()));
                        continue;
                    }
                    batch.push(msg);
                    if batch.len() > self.max_batch_size {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }
    }

    async fn should_store(&self, scan: &Scan) -> bool {
        let Some(cache) = &self.cache else {
            return true;
        };
        match cache.record_is_new(scan).await {
            Ok(fresh) => fresh,
            Err(err) => {
                // fail-open: a cache outage must not block ingestion
                tracing::error!(error = %err, "ordering cache lookup failed, treating record as new");
                true
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<MessageRequest>) {
        let drained = std::mem::take(batch);
        let scans: Vec<Scan> = drained.iter().map(|msg| msg.scan.clone()).collect();
        tracing::debug!(count = scans.len(), "flushing batch to storage");

        let started = Instant::now();
        let result = match tokio::time::timeout(FLUSH_TIMEOUT, self.store.upsert_many(&scans)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(FlushError::new(err.to_string())),
            Err(_) => Err(FlushError::new(format!(
                "storage deadline of {FLUSH_TIMEOUT:?} exceeded"
            ))),
        };

        match &result {
            Ok(()) => {
                self.stats
                    .last_batch_len
                    .store(scans.len() as u64, Ordering::Relaxed);
                self.stats
                    .last_flush_unix_ms
                    .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
                tracing::debug!(
                    count = scans.len(),
                    micros = started.elapsed().as_micros() as u64,
                    queue_depth = self.stats.queue_depth.load(Ordering::Relaxed),
                    "flushed batch"
                );
            }
            Err(err) => {
                let failed = self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::error!(error = %err, count = scans.len(), failed_flushes = failed, "failed to flush batch to storage");
                self.rollback_cache(&scans).await;
            }
        }

        for msg in drained {
            // the coordinator may have timed out and dropped its end
            let _ = msg.reply.send(result.clone());
        }
    }

    /// Revert the optimistic cache advances for a failed batch so the nacked
    /// messages re-gate cleanly when the transport redelivers them.
    async fn rollback_cache(&self, scans: &[Scan]) {
        let Some(cache) = &self.cache else {
            return;
        };
        match cache.remove_records(scans).await {
            Ok(removed) => {
                tracing::warn!(removed, "rolled back cache entries for failed batch");
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to roll back cache entries");
            }
        }
    }
}
