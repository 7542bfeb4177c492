use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::pipeline::PipelineHandle;
use crate::scan::Scan;

/// A transport delivery that can be settled exactly once. The subscription
/// binding implements this for real deliveries; tests substitute their own,
/// which keeps the coordinator logic broker-free.
#[async_trait]
pub trait Delivery: Send {
    async fn ack(self) -> Result<()>;
    async fn nack(self) -> Result<()>;
}

/// Dispatches each received message to the worker pool and settles the
/// delivery from the reply: ack once the record is persisted (or rejected by
/// design), nack on failure or when the reply outlives the ack timeout.
#[derive(Clone)]
pub struct Ingester {
    pipeline: PipelineHandle,
    ack_timeout: Duration,
}

impl Ingester {
    pub fn new(pipeline: PipelineHandle, ack_timeout: Duration) -> Self {
        Self {
            pipeline,
            ack_timeout,
        }
    }

    pub async fn handle_message<D: Delivery>(&self, payload: &[u8], delivery: D) {
        tracing::debug!("received subscription message");

        let scan = match Scan::decode(payload) {
            Ok(scan) => scan,
            Err(err) => {
                // the producer sent something we can never store; redelivery
                // would fail the same way
                tracing::error!(error = %err, "discarding undecodable message");
                return;
            }
        };

        let reply = match self.pipeline.dispatch(scan).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(error = %err, "failed to queue message, leaving it for redelivery");
                Self::settle(delivery.nack().await);
                return;
            }
        };

        let settled = match tokio::time::timeout(self.ack_timeout, reply).await {
            Ok(Ok(Ok(()))) => delivery.ack().await,
            Ok(Ok(Err(err))) => {
                tracing::error!(error = %err, "failed to save message");
                delivery.nack().await
            }
            Ok(Err(_)) => {
                tracing::error!("worker dropped the reply channel");
                delivery.nack().await
            }
            Err(_) => {
                tracing::debug!("timed out waiting for persistence");
                delivery.nack().await
            }
        };
        Self::settle(settled);
    }

    fn settle(result: Result<()>) {
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to settle delivery");
        }
    }
}
