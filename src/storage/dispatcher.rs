//! Fire-and-forget persistence
//!
//! The aggregation loop hands results to [`PersistenceDispatcher`] and moves
//! on. Jobs go through a bounded channel to a single worker task that calls
//! the [`StorageSink`]. When the channel is full the job is dropped and
//! counted; sink failures are logged and counted, never retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StorageSink;
use crate::types::{Aggregate, Alert, Reading};

#[derive(Debug, Clone)]
pub enum PersistJob {
    Reading(Reading),
    Aggregate(Aggregate),
    Alert(Alert),
}

impl PersistJob {
    fn op(&self) -> &'static str {
        match self {
            Self::Reading(_) => "store_reading",
            Self::Aggregate(_) => "store_aggregate",
            Self::Alert(_) => "store_alert",
        }
    }

    fn sensor(&self) -> &str {
        match self {
            Self::Reading(r) => r.sensor_id(),
            Self::Aggregate(a) => a.sensor_id.as_deref().unwrap_or(super::GLOBAL_SENSOR_KEY),
            Self::Alert(a) => &a.sensor_id,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    stored: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Jobs accepted onto the channel
    pub submitted: u64,
    /// Jobs rejected because the channel was full or closed
    pub dropped: u64,
    /// Jobs the sink completed
    pub stored: u64,
    /// Jobs the sink reported an error for
    pub failed: u64,
}

/// Cloneable handle for submitting persistence jobs.
#[derive(Clone)]
pub struct PersistenceDispatcher {
    tx: mpsc::Sender<PersistJob>,
    counters: Arc<Counters>,
}

impl PersistenceDispatcher {
    /// Start the worker. It runs until `cancel` fires, then drains whatever is
    /// still queued before exiting.
    pub fn spawn(
        sink: Arc<dyn StorageSink>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let handle = tokio::spawn(run_worker(sink, rx, Arc::clone(&counters), cancel));
        (Self { tx, counters }, handle)
    }

    pub fn submit(&self, job: PersistJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // One line per thousand drops keeps a saturated sink from flooding the log
                if dropped % 1000 == 1 {
                    warn!(op = job.op(), dropped, "Persistence queue full, dropping job");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn store_reading(&self, reading: Reading) -> bool {
        self.submit(PersistJob::Reading(reading))
    }

    pub fn store_aggregate(&self, aggregate: Aggregate) -> bool {
        self.submit(PersistJob::Aggregate(aggregate))
    }

    pub fn store_alert(&self, alert: Alert) -> bool {
        self.submit(PersistJob::Alert(alert))
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            stored: self.counters.stored.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    sink: Arc<dyn StorageSink>,
    mut rx: mpsc::Receiver<PersistJob>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    info!(backend = sink.backend_name(), "Persistence worker started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => execute(sink.as_ref(), job, &counters).await,
                None => break,
            },
        }
    }

    // Flush what was already accepted
    rx.close();
    let mut drained = 0u64;
    while let Some(job) = rx.recv().await {
        execute(sink.as_ref(), job, &counters).await;
        drained += 1;
    }

    info!(
        backend = sink.backend_name(),
        drained,
        stored = counters.stored.load(Ordering::Relaxed),
        failed = counters.failed.load(Ordering::Relaxed),
        "Persistence worker stopped"
    );
}

async fn execute(sink: &dyn StorageSink, job: PersistJob, counters: &Counters) {
    let result = match &job {
        PersistJob::Reading(r) => sink.store_reading(r).await,
        PersistJob::Aggregate(a) => sink.store_aggregate(a).await,
        PersistJob::Alert(a) => sink.store_alert(a).await,
    };
    match result {
        Ok(()) => {
            counters.stored.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(sensor = job.sensor(), op = job.op(), error = %e, "Persistence failed");
        }
    }
    debug!(op = job.op(), "Persistence job done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStore, StorageError};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FailingSink;

    #[async_trait]
    impl StorageSink for FailingSink {
        async fn store_reading(&self, _: &Reading) -> Result<(), StorageError> {
            Err(StorageError::Database("unavailable".to_string()))
        }
        async fn store_aggregate(&self, _: &Aggregate) -> Result<(), StorageError> {
            Ok(())
        }
        async fn store_alert(&self, _: &Alert) -> Result<(), StorageError> {
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    /// Blocks every write until released, so the channel can be filled.
    struct GatedSink(tokio::sync::Semaphore);

    #[async_trait]
    impl StorageSink for GatedSink {
        async fn store_reading(&self, _: &Reading) -> Result<(), StorageError> {
            let _permit = self.0.acquire().await.map_err(|e| StorageError::Database(e.to_string()))?;
            Ok(())
        }
        async fn store_aggregate(&self, _: &Aggregate) -> Result<(), StorageError> {
            Ok(())
        }
        async fn store_alert(&self, _: &Alert) -> Result<(), StorageError> {
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "gated"
        }
    }

    fn reading(v: f64) -> Reading {
        Reading::now("s1", v).expect("valid")
    }

    #[tokio::test]
    async fn test_jobs_reach_sink_and_drain_on_cancel() {
        let store = Arc::new(InMemoryStore::default());
        let cancel = CancellationToken::new();
        let (dispatcher, handle) =
            PersistenceDispatcher::spawn(store.clone(), 16, cancel.clone());

        for i in 0..5 {
            assert!(dispatcher.store_reading(reading(f64::from(i))));
        }
        cancel.cancel();
        handle.await.expect("worker join");

        assert_eq!(store.list("readings:s1").len(), 5);
        let stats = dispatcher.stats();
        assert_eq!(stats.submitted, 5);
        assert_eq!(stats.stored, 5);
        assert_eq!(stats.dropped, 0);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_propagated() {
        let cancel = CancellationToken::new();
        let (dispatcher, handle) =
            PersistenceDispatcher::spawn(Arc::new(FailingSink), 16, cancel.clone());

        dispatcher.store_reading(reading(1.0));
        dispatcher.store_reading(reading(2.0));
        cancel.cancel();
        handle.await.expect("worker join");

        let stats = dispatcher.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.stored, 0);
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let sink = Arc::new(GatedSink(tokio::sync::Semaphore::new(0)));
        let cancel = CancellationToken::new();
        let (dispatcher, handle) = PersistenceDispatcher::spawn(sink.clone(), 2, cancel.clone());

        // First job is pulled by the worker and parks on the gate
        assert!(dispatcher.store_reading(reading(0.0)));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(dispatcher.store_reading(reading(1.0)));
        assert!(dispatcher.store_reading(reading(2.0)));
        assert!(!dispatcher.store_reading(reading(3.0)));
        assert_eq!(dispatcher.stats().dropped, 1);

        sink.0.add_permits(16);
        cancel.cancel();
        handle.await.expect("worker join");
        assert_eq!(dispatcher.stats().stored, 3);
    }
}
