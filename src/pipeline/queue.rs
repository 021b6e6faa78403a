//! Ingestion Queue - bounded MPMC buffer with drop-oldest overflow
//!
//! Producers never block and are never rejected: when the queue is full the
//! oldest pending reading is evicted to admit the new one. Consumers wait for
//! data with a timeout and then take whatever is already available.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::types::Reading;

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub pending: usize,
}

pub struct IngestionQueue {
    items: Mutex<VecDeque<Reading>>,
    capacity: usize,
    notify: Notify,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl IngestionQueue {
    /// Create a queue holding at most `capacity` pending readings (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            notify: Notify::new(),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Reading>> {
        self.items.lock().unwrap_or_else(|e| {
            warn!("Ingestion queue mutex poisoned, recovering");
            e.into_inner()
        })
    }

    /// Admit a reading, evicting the oldest pending one when full.
    ///
    /// Returns `true` when an older reading was dropped to make room.
    pub fn enqueue(&self, reading: Reading) -> bool {
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front().is_some()
            } else {
                false
            };
            items.push_back(reading);
            evicted
        };

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    /// Take up to `max_items` readings that are already pending, without waiting.
    pub fn try_dequeue(&self, max_items: usize) -> Vec<Reading> {
        let mut items = self.lock();
        let n = items.len().min(max_items);
        items.drain(..n).collect()
    }

    /// Wait until at least one reading is pending or `max_wait` elapses, then
    /// return up to `max_items` of the readings already available.
    ///
    /// Returns an empty batch on timeout.
    pub async fn dequeue_batch(&self, max_items: usize, max_wait: Duration) -> Vec<Reading> {
        if max_items == 0 {
            return Vec::new();
        }
        let deadline = Instant::now() + max_wait;

        loop {
            // Register interest before checking so a concurrent enqueue is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.try_dequeue(max_items);
            if !batch.is_empty() {
                // Another consumer may be waiting on what we left behind.
                if !self.is_empty() {
                    self.notify.notify_one();
                }
                return batch;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn reading(i: usize) -> Reading {
        Reading::now("s1", i as f64).expect("valid reading")
    }

    fn values(batch: &[Reading]) -> Vec<f64> {
        batch.iter().map(Reading::value).collect()
    }

    #[test]
    fn test_drop_oldest_keeps_last_capacity_items() {
        let q = IngestionQueue::new(5);
        for i in 0..8 {
            q.enqueue(reading(i));
            assert!(q.len() <= 5);
        }
        assert_eq!(q.len(), 5);
        assert_eq!(values(&q.try_dequeue(10)), vec![3.0, 4.0, 5.0, 6.0, 7.0]);

        let stats = q.stats();
        assert_eq!(stats.enqueued, 8);
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_enqueue_reports_eviction() {
        let q = IngestionQueue::new(1);
        assert!(!q.enqueue(reading(0)));
        assert!(q.enqueue(reading(1)));
        assert_eq!(values(&q.try_dequeue(1)), vec![1.0]);
    }

    #[test]
    fn test_try_dequeue_respects_max_and_order() {
        let q = IngestionQueue::new(100);
        for i in 0..10 {
            q.enqueue(reading(i));
        }
        assert_eq!(values(&q.try_dequeue(3)), vec![0.0, 1.0, 2.0]);
        assert_eq!(q.len(), 7);
        assert_eq!(values(&q.try_dequeue(100)), vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_batch_times_out_empty() {
        let q = IngestionQueue::new(10);
        let started = Instant::now();
        let batch = q.dequeue_batch(10, Duration::from_millis(50)).await;
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_dequeue_batch_returns_immediately_when_pending() {
        let q = IngestionQueue::new(10);
        q.enqueue(reading(1));
        q.enqueue(reading(2));
        let batch = q.dequeue_batch(10, Duration::from_secs(30)).await;
        assert_eq!(values(&batch), vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_dequeue_batch_wakes_on_enqueue() {
        let q = Arc::new(IngestionQueue::new(10));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.dequeue_batch(10, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.enqueue(reading(42));
        let batch = consumer.await.expect("consumer task");
        assert_eq!(values(&batch), vec![42.0]);
    }

    #[tokio::test]
    async fn test_enqueue_wakes_parked_consumer() {
        let q = IngestionQueue::new(10);
        let mut consumer = tokio_test::task::spawn(q.dequeue_batch(10, Duration::from_secs(30)));
        tokio_test::assert_pending!(consumer.poll());

        q.enqueue(reading(7));
        assert!(consumer.is_woken());
        let batch = tokio_test::assert_ready!(consumer.poll());
        assert_eq!(values(&batch), vec![7.0]);
    }

    #[tokio::test]
    async fn test_concurrent_producers_preserve_per_producer_order() {
        let q = Arc::new(IngestionQueue::new(10_000));
        let mut handles = Vec::new();
        for p in 0..4 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                for i in 0..250 {
                    let r = Reading::now(format!("p{p}"), f64::from(i)).expect("valid");
                    q.enqueue(r);
                }
            }));
        }
        for h in handles {
            h.await.expect("producer");
        }

        let all = q.try_dequeue(usize::MAX);
        assert_eq!(all.len(), 1000);
        for p in 0..4 {
            let id = format!("p{p}");
            let seq: Vec<f64> = all
                .iter()
                .filter(|r| r.sensor_id() == id)
                .map(Reading::value)
                .collect();
            assert_eq!(seq.len(), 250);
            assert!(seq.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
