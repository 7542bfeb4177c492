use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::scan::Scan;

/// Admission check that drops out-of-order observations before they reach
/// storage. Best-effort: callers treat any error as "record is new", so an
/// unavailable cache never blocks ingestion.
#[async_trait]
pub trait RecordCache: Send + Sync {
    /// Returns true iff this scan should advance the state for its key, and
    /// remembers the new timestamp when it does.
    async fn record_is_new(&self, record: &Scan) -> Result<bool>;

    /// Drops the entries for the given scans, returning how many keys were
    /// removed. Used to revert optimistic advances after a failed flush.
    async fn remove_records(&self, records: &[Scan]) -> Result<u64>;
}

pub struct RedisCache {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisCache {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis address")?;
        let mut conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis ping failed")?;
        tracing::debug!(%pong, "ordering cache connected");

        Ok(Self { conn, ttl })
    }
}

#[async_trait]
impl RecordCache for RedisCache {
    async fn record_is_new(&self, record: &Scan) -> Result<bool> {
        let key = record.key();
        let mut conn = self.conn.clone();

        let stored: Option<String> = conn.get(&key).await?;
        let Some(stored) = stored else {
            conn.set_ex::<_, _, ()>(&key, record.timestamp, self.ttl.as_secs())
                .await?;
            return Ok(true);
        };

        let stored: i64 = stored
            .parse()
            .context("non-integer timestamp stored in cache")?;

        // An equal or newer sighting is already recorded for this key.
        if stored >= record.timestamp {
            return Ok(false);
        }

        conn.set_ex::<_, _, ()>(&key, record.timestamp, self.ttl.as_secs())
            .await?;
        Ok(true)
    }

    async fn remove_records(&self, records: &[Scan]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = records.iter().map(Scan::key).collect();
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }
}
