//! Per-sensor frame coalescing on a fixed tick
//!
//! `add` appends to the sensor's buffer under that sensor's lock. Every
//! flush tick swaps each non-empty buffer for an empty one and publishes the
//! taken readings as a single frame to the sensor's group. The lock is never
//! held across `publish`.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{group_for, Frame, FrameSink, FrameTransport};
use crate::types::Reading;

type SensorBuffer = Arc<Mutex<Vec<Reading>>>;

/// Initial capacity of a freshly created per-sensor buffer
const BUFFER_CAPACITY: usize = 256;

/// Outcome of one flush tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub frames_sent: usize,
    pub points_sent: usize,
    pub send_errors: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalescerStats {
    pub ticks: u64,
    pub frames_sent: u64,
    pub points_sent: u64,
    pub send_errors: u64,
}

pub struct BroadcastCoalescer {
    buffers: DashMap<String, SensorBuffer>,
    transport: Arc<dyn FrameTransport>,
    flush_interval: Duration,
    ticks: AtomicU64,
    frames_sent: AtomicU64,
    points_sent: AtomicU64,
    send_errors: AtomicU64,
}

fn lock_buffer<'a>(sensor_id: &str, buffer: &'a SensorBuffer) -> MutexGuard<'a, Vec<Reading>> {
    buffer.lock().unwrap_or_else(|e| {
        warn!(sensor = %sensor_id, "Frame buffer mutex poisoned, recovering");
        e.into_inner()
    })
}

impl BroadcastCoalescer {
    pub fn new(transport: Arc<dyn FrameTransport>, flush_interval: Duration) -> Self {
        Self {
            buffers: DashMap::new(),
            transport,
            flush_interval,
            ticks: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            points_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        }
    }

    pub const fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Readings currently waiting for the next tick across all sensors.
    pub fn pending(&self) -> usize {
        self.buffers
            .iter()
            .map(|entry| lock_buffer(entry.key(), entry.value()).len())
            .sum()
    }

    /// Publish every non-empty buffer once.
    ///
    /// Buffer handles are snapshotted first so no map shard lock is held while
    /// taking a sensor lock or awaiting the transport. A failed publish is
    /// logged and counted; the remaining sensors are still flushed.
    pub async fn flush(&self) -> FlushReport {
        let handles: Vec<(String, SensorBuffer)> = self
            .buffers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut report = FlushReport::default();
        for (sensor_id, buffer) in handles {
            let readings = {
                let mut guard = lock_buffer(&sensor_id, &buffer);
                if guard.is_empty() {
                    continue;
                }
                std::mem::replace(&mut *guard, Vec::with_capacity(BUFFER_CAPACITY))
            };

            let points = readings.len();
            let group = group_for(&sensor_id);
            let frame = Frame {
                sensor_id,
                readings,
            };
            match self.transport.publish(&group, frame).await {
                Ok(()) => {
                    report.frames_sent += 1;
                    report.points_sent += points;
                    debug!(group = %group, points, "Sent frame");
                }
                Err(e) => {
                    report.send_errors += 1;
                    warn!(group = %group, points, error = %e, "Failed to send frame");
                }
            }
        }

        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.frames_sent.fetch_add(report.frames_sent as u64, Ordering::Relaxed);
        self.points_sent.fetch_add(report.points_sent as u64, Ordering::Relaxed);
        self.send_errors.fetch_add(report.send_errors as u64, Ordering::Relaxed);
        report
    }

    /// Flush on every tick until `cancel` fires. Late ticks are skipped, not
    /// bunched, so a slow publish never triggers a burst of flushes.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> CoalescerStats {
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        interval.tick().await;

        info!(interval_ms = self.flush_interval.as_millis(), "Broadcast coalescer started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.flush().await;
                }
            }
        }

        let stats = self.stats();
        info!(
            ticks = stats.ticks,
            frames_sent = stats.frames_sent,
            points_sent = stats.points_sent,
            send_errors = stats.send_errors,
            "Broadcast coalescer stopped"
        );
        stats
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            points_sent: self.points_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

impl FrameSink for BroadcastCoalescer {
    fn add(&self, reading: Reading) {
        // Clone the handle out so the map shard is released before locking
        let buffer = match self.buffers.get(reading.sensor_id()) {
            Some(entry) => Arc::clone(entry.value()),
            None => Arc::clone(
                self.buffers
                    .entry(reading.sensor_id().to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(Vec::with_capacity(BUFFER_CAPACITY))))
                    .value(),
            ),
        };
        lock_buffer(reading.sensor_id(), &buffer).push(reading);
    }
}
