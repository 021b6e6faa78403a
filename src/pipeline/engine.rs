//! Aggregation engine
//!
//! Single-owner state machine driven by the processing loop. For every
//! reading in a batch, in arrival order:
//!
//! 1. fold the value into the sensor's [`OnlineStats`]
//! 2. hand the reading to the frame sink
//! 3. submit the raw reading for persistence (fire-and-forget)
//! 4. append it to the sensor's [`WindowBuffer`]
//! 5. evaluate the z-score rule and log a detection
//!
//! After the batch, every buffer is trimmed to the longest configured window
//! and one aggregate per (sensor, window) plus one global aggregate per
//! window is built from what remains. Sensors whose buffer is empty produce
//! no per-sensor aggregate.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::anomaly::{self, AnomalyDetection};
use super::window::WindowBuffer;
use crate::broadcast::FrameSink;
use crate::stats::{summarize, OnlineStats};
use crate::storage::PersistenceDispatcher;
use crate::types::{Aggregate, AggregateWindow, Reading};

#[derive(Debug, Default)]
struct SensorState {
    stats: OnlineStats,
    window: WindowBuffer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub batches: u64,
    pub readings: u64,
    /// Readings dropped for a non-finite value
    pub rejected: u64,
    pub anomalies: u64,
    pub aggregates: u64,
    pub sensors: usize,
}

/// What one batch produced.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub anomalies: Vec<AnomalyDetection>,
    pub aggregates: Vec<Aggregate>,
}

impl BatchOutcome {
    /// Aggregate for `sensor_id` (or the global one for `None`) over `window`.
    pub fn aggregate(&self, sensor_id: Option<&str>, window: AggregateWindow) -> Option<&Aggregate> {
        self.aggregates
            .iter()
            .find(|a| a.window == window && a.sensor_id.as_deref() == sensor_id)
    }
}

pub struct AggregationEngine {
    sensors: HashMap<String, SensorState>,
    frames: Arc<dyn FrameSink>,
    persistence: Option<PersistenceDispatcher>,
    /// Sorted shortest to longest, never empty
    windows: Vec<AggregateWindow>,
    /// Running totals; `sensors` is filled in by [`AggregationEngine::stats`]
    totals: EngineStats,
}

impl AggregationEngine {
    /// Engine aggregating over `windows`; an empty list falls back to one minute.
    pub fn new(frames: Arc<dyn FrameSink>, windows: &[AggregateWindow]) -> Self {
        let mut windows = windows.to_vec();
        windows.sort_by_key(|w| w.duration());
        windows.dedup();
        if windows.is_empty() {
            windows.push(AggregateWindow::OneMinute);
        }
        Self {
            sensors: HashMap::new(),
            frames,
            persistence: None,
            windows,
            totals: EngineStats::default(),
        }
    }

    #[must_use]
    pub fn with_persistence(mut self, dispatcher: PersistenceDispatcher) -> Self {
        self.persistence = Some(dispatcher);
        self
    }

    pub fn windows(&self) -> &[AggregateWindow] {
        &self.windows
    }

    fn retention(&self) -> AggregateWindow {
        self.windows
            .last()
            .copied()
            .unwrap_or(AggregateWindow::OneMinute)
    }

    /// Process one batch with `now` as the reference time for window cutoffs.
    pub fn process_batch(&mut self, batch: Vec<Reading>, now: DateTime<Utc>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let batch_len = batch.len();

        for reading in batch {
            if let Some(detection) = self.process_reading(reading) {
                outcome.anomalies.push(detection);
            }
        }

        outcome.aggregates = self.build_aggregates(now);

        if let Some(dispatcher) = &self.persistence {
            for aggregate in &outcome.aggregates {
                dispatcher.store_aggregate(aggregate.clone());
            }
        }

        self.totals.batches += 1;
        self.totals.anomalies += outcome.anomalies.len() as u64;
        self.totals.aggregates += outcome.aggregates.len() as u64;

        debug!(
            batch_size = batch_len,
            anomalies = outcome.anomalies.len(),
            aggregates = outcome.aggregates.len(),
            sensors = self.sensors.len(),
            "Processed batch"
        );
        outcome
    }

    fn process_reading(&mut self, reading: Reading) -> Option<AnomalyDetection> {
        let value = reading.value();
        if !value.is_finite() {
            self.totals.rejected += 1;
            debug!(sensor = %reading.sensor_id(), value, "Rejected non-finite reading");
            return None;
        }

        // Avoid allocating the key on the hot path once a sensor is known
        if !self.sensors.contains_key(reading.sensor_id()) {
            self.sensors
                .insert(reading.sensor_id().to_string(), SensorState::default());
        }
        let state = self.sensors.get_mut(reading.sensor_id())?;

        state.stats.push(value);
        self.frames.add(reading.clone());
        if let Some(dispatcher) = &self.persistence {
            dispatcher.store_reading(reading.clone());
        }
        state.window.push(reading.timestamp_utc(), value);
        self.totals.readings += 1;

        let detection = anomaly::detect(&state.stats, &reading)?;
        debug!(
            sensor = %detection.sensor_id,
            z = detection.z,
            value = detection.value,
            mean = detection.mean,
            stdev = detection.stdev,
            "Anomaly detected"
        );
        Some(detection)
    }

    fn build_aggregates(&mut self, now: DateTime<Utc>) -> Vec<Aggregate> {
        let retention_cutoff = now - self.retention().duration();
        let mut aggregates = Vec::new();
        let mut global: Vec<Vec<f64>> = vec![Vec::new(); self.windows.len()];

        for (sensor_id, state) in &mut self.sensors {
            state.window.evict_older_than(retention_cutoff);
            if state.window.is_empty() {
                continue;
            }

            for (idx, window) in self.windows.iter().enumerate() {
                let values = state.window.values_since(now - window.duration());
                let Some(summary) = summarize(&values) else {
                    continue;
                };
                aggregates.push(Aggregate::from_summary(Some(sensor_id.clone()), *window, summary));
                global[idx].extend_from_slice(&values);
            }
        }

        for (window, values) in self.windows.iter().zip(&global) {
            if let Some(summary) = summarize(values) {
                aggregates.push(Aggregate::from_summary(None, *window, summary));
            }
        }

        aggregates
    }

    /// Lifetime statistics for one sensor.
    pub fn sensor_stats(&self, sensor_id: &str) -> Option<OnlineStats> {
        self.sensors.get(sensor_id).map(|s| s.stats)
    }

    /// Samples currently held in a sensor's window buffer.
    pub fn buffered(&self, sensor_id: &str) -> usize {
        self.sensors.get(sensor_id).map_or(0, |s| s.window.len())
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            sensors: self.sensors.len(),
            ..self.totals
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<Reading>>);

    impl FrameSink for CollectingSink {
        fn add(&self, reading: Reading) {
            self.0.lock().expect("lock").push(reading);
        }
    }

    fn base() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
    }

    fn at(sensor: &str, secs: i64, value: f64) -> Reading {
        Reading::new(sensor, (base() + Duration::seconds(secs)).fixed_offset(), value)
            .expect("valid reading")
    }

    fn engine() -> (AggregationEngine, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        (AggregationEngine::new(sink.clone(), &[AggregateWindow::OneMinute]), sink)
    }

    #[test]
    fn test_per_sensor_and_global_aggregates() {
        let (mut engine, sink) = engine();
        let batch = vec![at("a", 0, 1.0), at("b", 1, 10.0), at("a", 2, 3.0), at("b", 3, 30.0)];
        let out = engine.process_batch(batch, base() + Duration::seconds(5));

        let a = out.aggregate(Some("a"), AggregateWindow::OneMinute).expect("a");
        assert_eq!(a.count, 2);
        assert!((a.mean - 2.0).abs() < 1e-12);
        assert_eq!(a.max, 3.0);

        let global = out.aggregate(None, AggregateWindow::OneMinute).expect("global");
        assert_eq!(global.count, 4);
        assert_eq!(global.min, 1.0);
        assert_eq!(global.max, 30.0);
        assert_eq!(out.aggregates.len(), 3);

        // Frame sink sees every reading in arrival order
        let seen: Vec<f64> = sink.0.lock().expect("lock").iter().map(Reading::value).collect();
        assert_eq!(seen, vec![1.0, 10.0, 3.0, 30.0]);
    }

    #[test]
    fn test_stale_samples_leave_the_window() {
        let (mut engine, _) = engine();
        engine.process_batch(vec![at("a", 0, 100.0)], base());
        let out = engine.process_batch(vec![at("a", 90, 1.0)], base() + Duration::seconds(90));

        let a = out.aggregate(Some("a"), AggregateWindow::OneMinute).expect("a");
        assert_eq!(a.count, 1);
        assert_eq!(a.max, 1.0);
        assert_eq!(engine.buffered("a"), 1);
        // Lifetime stats still include the evicted sample
        assert_eq!(engine.sensor_stats("a").map(|s| s.count()), Some(2));
    }

    #[test]
    fn test_fully_evicted_sensor_has_no_aggregate() {
        let (mut engine, _) = engine();
        engine.process_batch(vec![at("a", 0, 1.0)], base());
        let out = engine.process_batch(vec![at("b", 120, 2.0)], base() + Duration::seconds(120));
        assert!(out.aggregate(Some("a"), AggregateWindow::OneMinute).is_none());
        assert_eq!(out.aggregate(None, AggregateWindow::OneMinute).map(|g| g.count), Some(1));
    }

    #[test]
    fn test_non_finite_values_are_rejected() {
        let (mut engine, sink) = engine();
        let out = engine.process_batch(
            vec![at("a", 0, f64::NAN), at("a", 1, 2.0), at("a", 2, f64::INFINITY)],
            base() + Duration::seconds(2),
        );
        assert_eq!(out.aggregate(Some("a"), AggregateWindow::OneMinute).map(|a| a.count), Some(1));
        assert_eq!(engine.stats().rejected, 2);
        assert_eq!(engine.stats().readings, 1);
        assert_eq!(sink.0.lock().expect("lock").len(), 1);
    }

    #[test]
    fn test_multiple_windows_share_one_buffer() {
        let sink = Arc::new(CollectingSink::default());
        let mut engine = AggregationEngine::new(
            sink,
            &[AggregateWindow::FiveMinutes, AggregateWindow::OneMinute, AggregateWindow::OneMinute],
        );
        assert_eq!(engine.windows(), &[AggregateWindow::OneMinute, AggregateWindow::FiveMinutes]);

        let batch = vec![at("a", 0, 1.0), at("a", 200, 2.0), at("a", 290, 3.0)];
        let out = engine.process_batch(batch, base() + Duration::seconds(300));

        let one = out.aggregate(Some("a"), AggregateWindow::OneMinute).expect("1m");
        let five = out.aggregate(Some("a"), AggregateWindow::FiveMinutes).expect("5m");
        assert_eq!(one.count, 1);
        assert_eq!(five.count, 3);
        assert_eq!(engine.buffered("a"), 3);
    }

    #[test]
    fn test_detection_reported_in_outcome() {
        let (mut engine, _) = engine();
        let mut batch: Vec<Reading> = (0..29).map(|i| at("a", i, 0.0)).collect();
        batch.push(at("a", 29, 1.0));
        let out = engine.process_batch(batch, base() + Duration::seconds(30));
        assert_eq!(out.anomalies.len(), 1);
        assert_eq!(out.anomalies[0].sample_count, 30);
        assert_eq!(engine.stats().anomalies, 1);
    }

    #[test]
    fn test_empty_batch_still_aggregates_buffered_data() {
        let (mut engine, _) = engine();
        engine.process_batch(vec![at("a", 0, 4.0)], base());
        let out = engine.process_batch(Vec::new(), base() + Duration::seconds(10));
        assert_eq!(out.aggregates.len(), 2);
        assert_eq!(engine.stats().batches, 2);
    }
}
