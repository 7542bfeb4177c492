use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ingest::{Delivery, Ingester};

/// How long a delivery may sit unacknowledged before the reclaim pass hands
/// it out again. Must exceed the coordinator's ack timeout so an in-flight
/// message is never claimed twice.
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline for in-flight coordinator tasks to settle their deliveries once
/// the receive loop stops. Covers the coordinator's ack timeout.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
const READ_BLOCK: Duration = Duration::from_secs(1);
const READ_COUNT: usize = 64;
/// Stream entry field carrying the scan payload.
const PAYLOAD_FIELD: &str = "data";

struct StreamEntry {
    id: String,
    payload: Vec<u8>,
}

/// A process-unique consumer group on the scan stream. Every instance sees
/// the full topic; deliveries compete only among the instance's own
/// coordinator tasks. The group is destroyed on shutdown, so there is no
/// cross-restart backlog replay.
#[derive(Clone)]
pub struct Subscription {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
}

impl Subscription {
    pub async fn create(broker_addr: &str, stream: &str, project_id: &str) -> Result<Self> {
        let client = redis::Client::open(broker_addr).context("invalid broker address")?;
        let mut conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to broker")?;

        let group = format!("{}-{}", project_id, Uuid::new_v4().simple());
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(&group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        created.context("failed to create subscription group")?;
        tracing::info!(stream, group = %group, "subscription created");

        Ok(Self {
            conn,
            stream: stream.to_string(),
            group,
            consumer: format!("scan-ingester-{}", std::process::id()),
        })
    }

    /// Receive until cancellation, spawning one coordinator task per
    /// delivery. Each iteration first reclaims deliveries whose previous
    /// claim went unacknowledged past the visibility deadline (nacked or
    /// expired), then blocks briefly for fresh entries. Coordinator tasks
    /// still in flight when the loop stops are drained before returning, so
    /// every dispatched delivery gets its chance to settle.
    pub async fn receive(&self, cancel: CancellationToken, ingester: Arc<Ingester>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut tasks = JoinSet::new();

        while !cancel.is_cancelled() {
            // reap coordinator tasks that have already settled
            while tasks.try_join_next().is_some() {}

            for entry in self.reclaim(&mut conn).await {
                self.dispatch(entry, &ingester, &mut tasks);
            }

            let mut cmd = redis::cmd("XREADGROUP");
            cmd.arg("GROUP")
                .arg(&self.group)
                .arg(&self.consumer)
                .arg("COUNT")
                .arg(READ_COUNT)
                .arg("BLOCK")
                .arg(READ_BLOCK.as_millis() as u64)
                .arg("STREAMS")
                .arg(&self.stream)
                .arg(">");

            let read: redis::RedisResult<Value> = tokio::select! {
                _ = cancel.cancelled() => break,
                res = cmd.query_async(&mut conn) => res,
            };
            match read {
                Ok(value) => {
                    for entry in parse_stream_entries(value) {
                        self.dispatch(entry, &ingester, &mut tasks);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "stream read failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }

        drain_in_flight(tasks).await;
        Ok(())
    }

    async fn reclaim(&self, conn: &mut ConnectionManager) -> Vec<StreamEntry> {
        let claimed: redis::RedisResult<Value> = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(VISIBILITY_TIMEOUT.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(READ_COUNT)
            .query_async(conn)
            .await;
        match claimed {
            Ok(value) => parse_claimed_entries(value),
            Err(err) => {
                tracing::warn!(error = %err, "reclaim pass failed");
                Vec::new()
            }
        }
    }

    fn dispatch(&self, entry: StreamEntry, ingester: &Arc<Ingester>, tasks: &mut JoinSet<()>) {
        let StreamEntry { id, payload } = entry;
        let delivery = StreamDelivery {
            conn: self.conn.clone(),
            stream: self.stream.clone(),
            group: self.group.clone(),
            consumer: self.consumer.clone(),
            id,
        };
        let ingester = ingester.clone();
        tasks.spawn(async move {
            ingester.handle_message(&payload, delivery).await;
        });
    }

    pub async fn delete(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let destroyed: redis::RedisResult<i64> = redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(&self.stream)
            .arg(&self.group)
            .query_async(&mut conn)
            .await;
        destroyed.context("failed to delete subscription group")?;
        tracing::info!(group = %self.group, "subscription deleted");
        Ok(())
    }
}

/// Wait for in-flight coordinator tasks to settle their deliveries; tasks
/// still running at the deadline are aborted rather than left to die with
/// the runtime.
async fn drain_in_flight(mut tasks: JoinSet<()>) {
    if tasks.is_empty() {
        return;
    }
    tracing::debug!(in_flight = tasks.len(), "waiting for in-flight deliveries to settle");
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            in_flight = tasks.len(),
            "abandoning deliveries unsettled at the drain deadline"
        );
        tasks.abort_all();
    }
}

pub struct StreamDelivery {
    conn: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    id: String,
}

#[async_trait]
impl Delivery for StreamDelivery {
    async fn ack(mut self) -> Result<()> {
        let acked: redis::RedisResult<i64> = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.id)
            .query_async(&mut self.conn)
            .await;
        acked.context("failed to ack delivery")?;
        Ok(())
    }

    /// Hand the entry back for redelivery: claim it to ourselves with its
    /// idle time pre-aged past the visibility deadline, which makes it
    /// eligible for the very next reclaim pass.
    async fn nack(mut self) -> Result<()> {
        let claimed: redis::RedisResult<Value> = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(&self.id)
            .arg("IDLE")
            .arg(VISIBILITY_TIMEOUT.as_millis() as u64)
            .arg("JUSTID")
            .query_async(&mut self.conn)
            .await;
        claimed.context("failed to nack delivery")?;
        Ok(())
    }
}

/// XREADGROUP replies as [[stream, [[id, [field, value, ...]], ...]], ...];
/// a BLOCK timeout with nothing to read returns nil.
fn parse_stream_entries(value: Value) -> Vec<StreamEntry> {
    let Value::Array(streams) = value else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    for stream in streams {
        let Value::Array(parts) = stream else {
            continue;
        };
        let Some(Value::Array(messages)) = parts.into_iter().nth(1) else {
            continue;
        };
        collect_entries(messages, &mut entries);
    }
    entries
}

/// XAUTOCLAIM replies as [cursor, [[id, [field, value, ...]], ...], ...].
fn parse_claimed_entries(value: Value) -> Vec<StreamEntry> {
    let Value::Array(parts) = value else {
        return Vec::new();
    };
    let mut entries = Vec::new();
    if let Some(Value::Array(messages)) = parts.into_iter().nth(1) {
        collect_entries(messages, &mut entries);
    }
    entries
}

fn collect_entries(messages: Vec<Value>, out: &mut Vec<StreamEntry>) {
    for message in messages {
        let Value::Array(parts) = message else {
            continue;
        };
        let mut parts = parts.into_iter();
        let Some(id) = parts.next().and_then(as_string) else {
            continue;
        };
        let Some(Value::Array(fields)) = parts.next() else {
            continue;
        };

        let mut payload = None;
        let mut fields = fields.into_iter();
        while let (Some(field), Some(value)) = (fields.next(), fields.next()) {
            if as_string(field).as_deref() == Some(PAYLOAD_FIELD) {
                if let Value::BulkString(bytes) = value {
                    payload = Some(bytes);
                }
                break;
            }
        }
        if let Some(payload) = payload {
            out.push(StreamEntry { id, payload });
        }
    }
}

fn as_string(value: Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes).ok(),
        Value::SimpleString(text) => Some(text),
        _ => None,
    }
}
