//! Batch processing loop driving the aggregation engine.
//!
//! Each iteration waits (bounded by the batch budget) for the queue to have
//! data, drains greedily until the batch is full, the budget is spent or the
//! queue runs dry, then hands the batch to [`AggregationEngine`]. An empty
//! wait falls back to a short idle sleep so the loop never spins.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::engine::{AggregationEngine, EngineStats};
use super::queue::IngestionQueue;
use crate::config::EngineConfig;
use crate::types::Reading;

/// Owns the engine for the lifetime of the loop.
///
/// Built with [`new()`](ProcessingLoop::new) and consumed by
/// [`run()`](ProcessingLoop::run).
pub struct ProcessingLoop {
    engine: AggregationEngine,
    queue: Arc<IngestionQueue>,
    max_batch_size: usize,
    max_batch_wait: Duration,
    idle_sleep: Duration,
    cancel_token: CancellationToken,
}

impl ProcessingLoop {
    pub fn new(
        engine: AggregationEngine,
        queue: Arc<IngestionQueue>,
        config: &EngineConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            engine,
            queue,
            max_batch_size: config.max_batch_size.max(1),
            max_batch_wait: config.max_batch_wait(),
            idle_sleep: config.idle_sleep(),
            cancel_token,
        }
    }

    /// Collect one batch. The time budget starts when the first reading is in
    /// hand; an empty result means the wait timed out.
    async fn next_batch(&self) -> Vec<Reading> {
        let mut batch = self
            .queue
            .dequeue_batch(self.max_batch_size, self.max_batch_wait)
            .await;
        if batch.is_empty() {
            return batch;
        }

        self.drain_until(&mut batch, Instant::now() + self.max_batch_wait);
        batch
    }

    /// Top up `batch` with readings already queued until it is full, the
    /// queue runs dry or `deadline` passes.
    fn drain_until(&self, batch: &mut Vec<Reading>, deadline: Instant) {
        while batch.len() < self.max_batch_size && Instant::now() < deadline {
            let more = self.queue.try_dequeue(self.max_batch_size - batch.len());
            if more.is_empty() {
                break;
            }
            batch.extend(more);
        }
    }

    /// Run until cancelled. Returns final engine statistics.
    pub async fn run(mut self) -> EngineStats {
        info!(
            max_batch_size = self.max_batch_size,
            max_batch_wait_ms = self.max_batch_wait.as_millis(),
            windows = ?self.engine.windows(),
            "Aggregation engine started"
        );

        loop {
            let batch = tokio::select! {
                () = self.cancel_token.cancelled() => break,
                batch = self.next_batch() => batch,
            };

            if batch.is_empty() {
                tokio::select! {
                    () = self.cancel_token.cancelled() => break,
                    () = tokio::time::sleep(self.idle_sleep) => continue,
                }
            }

            let outcome = self.engine.process_batch(batch, Utc::now());
            if !outcome.anomalies.is_empty() {
                debug!(count = outcome.anomalies.len(), "Batch contained anomalies");
            }
        }

        let stats = self.engine.stats();
        let queue = self.queue.stats();
        info!(
            batches = stats.batches,
            readings = stats.readings,
            rejected = stats.rejected,
            anomalies = stats.anomalies,
            aggregates = stats.aggregates,
            sensors = stats.sensors,
            queue_dropped = queue.dropped,
            queue_pending = queue.pending,
            "Aggregation engine stopped"
        );
        stats
    }
}
