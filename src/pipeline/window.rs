//! Per-sensor trailing window of (timestamp, value) samples.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Timestamp-ordered samples retained while `now - ts <= retention`.
///
/// Only the aggregation engine's loop touches a `WindowBuffer`, so it carries
/// no synchronisation. Eviction runs once per batch via [`evict_older_than`].
///
/// [`evict_older_than`]: WindowBuffer::evict_older_than
#[derive(Debug, Clone, Default)]
pub struct WindowBuffer {
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl WindowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a sample keeping timestamp order. In-order arrivals are O(1).
    pub fn push(&mut self, timestamp: DateTime<Utc>, value: f64) {
        match self.samples.back() {
            Some((last, _)) if *last > timestamp => {
                let idx = self.samples.partition_point(|(ts, _)| *ts <= timestamp);
                self.samples.insert(idx, (timestamp, value));
            }
            _ => self.samples.push_back((timestamp, value)),
        }
    }

    /// Drop samples with `timestamp < cutoff`. Returns how many were removed.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.samples.len();
        while matches!(self.samples.front(), Some((ts, _)) if *ts < cutoff) {
            self.samples.pop_front();
        }
        before - self.samples.len()
    }

    /// Evict everything that fell out of `retention` as of `now`.
    pub fn evict_expired(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        self.evict_older_than(now - retention)
    }

    /// Values with `timestamp >= cutoff`, oldest first.
    pub fn values_since(&self, cutoff: DateTime<Utc>) -> Vec<f64> {
        let start = self.samples.partition_point(|(ts, _)| *ts < cutoff);
        self.samples.range(start..).map(|(_, v)| *v).collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.samples.front().map(|(ts, _)| *ts)
    }
}
