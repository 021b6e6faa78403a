//! Pipeline Integration Tests
//!
//! Drives readings through the public library API: ingestion queue,
//! processing loop, aggregation engine, coalescer, subscription registry and
//! the in-memory store behind the persistence dispatcher.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sensor_stream::config::EngineConfig;
use sensor_stream::pipeline::{AggregationEngine, IngestionQueue, ProcessingLoop};
use sensor_stream::stats::{percentile, sample_std_dev, summarize, OnlineStats};
use sensor_stream::storage::{InMemoryStore, PersistenceDispatcher};
use sensor_stream::types::{Aggregate, AggregateWindow, Reading};
use sensor_stream::{BroadcastCoalescer, FrameSink, SubscriptionRegistry};
use statrs::statistics::Statistics;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Frame sink that records every reading it is handed.
#[derive(Default)]
struct RecordingSink(Mutex<Vec<Reading>>);

impl FrameSink for RecordingSink {
    fn add(&self, reading: Reading) {
        self.0.lock().expect("lock").push(reading);
    }
}

fn base() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).expect("valid timestamp")
}

fn reading_at(sensor: &str, offset_ms: i64, value: f64) -> Reading {
    let ts = base() + ChronoDuration::milliseconds(offset_ms);
    Reading::new(sensor, ts.fixed_offset(), value).expect("valid reading")
}

// ============================================================================
// Anomaly rule end to end
// ============================================================================

#[test]
fn anomaly_fires_exactly_once_on_thirtieth_sample() {
    let sink = Arc::new(RecordingSink::default());
    let mut engine = AggregationEngine::new(sink, &[AggregateWindow::OneMinute]);

    let mut detections = Vec::new();
    for i in 0..29 {
        let out = engine.process_batch(vec![reading_at("pump", i * 10, 0.0)], base());
        detections.extend(out.anomalies);
    }
    assert!(detections.is_empty(), "no detection below 30 samples");

    let out = engine.process_batch(vec![reading_at("pump", 300, 1.0)], base());
    assert_eq!(out.anomalies.len(), 1);
    let hit = &out.anomalies[0];
    assert_eq!(hit.sensor_id, "pump");
    assert_eq!(hit.sample_count, 30);
    assert!(hit.z >= 3.0, "z = {}", hit.z);
}

#[tokio::test(start_paused = true)]
async fn queued_step_change_is_detected_once_by_processing_loop() {
    let queue = Arc::new(IngestionQueue::new(1_000));
    let values = std::iter::repeat(0.0)
        .take(29)
        .chain(std::iter::once(1.0))
        .chain(std::iter::repeat(0.0).take(10));
    for value in values {
        queue.enqueue(Reading::now("S", value).expect("valid"));
    }
    assert_eq!(queue.len(), 40);

    let sink = Arc::new(RecordingSink::default());
    let engine = AggregationEngine::new(sink.clone(), &[AggregateWindow::OneMinute]);
    let cancel = CancellationToken::new();
    let loop_task = tokio::spawn(
        ProcessingLoop::new(engine, Arc::clone(&queue), &EngineConfig::default(), cancel.clone())
            .run(),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    let stats = loop_task.await.expect("engine join");

    assert_eq!(stats.readings, 40);
    assert_eq!(stats.anomalies, 1);
    assert!(queue.is_empty());
    assert_eq!(sink.0.lock().expect("lock").len(), 40);
}

#[test]
fn constant_signal_never_fires() {
    let sink = Arc::new(RecordingSink::default());
    let mut engine = AggregationEngine::new(sink, &[AggregateWindow::OneMinute]);
    let batch: Vec<Reading> = (0..500).map(|i| reading_at("flat", i, 42.0)).collect();
    let out = engine.process_batch(batch, base() + ChronoDuration::seconds(1));
    assert!(out.anomalies.is_empty());

    let agg = out
        .aggregate(Some("flat"), AggregateWindow::OneMinute)
        .expect("aggregate");
    assert_eq!(agg.stdev, 0.0);
    assert_eq!(agg.p95, 42.0);
}

// ============================================================================
// Aggregates
// ============================================================================

#[test]
fn interleaved_sensors_produce_per_sensor_and_global_aggregates() {
    let sink = Arc::new(RecordingSink::default());
    let mut engine = AggregationEngine::new(sink.clone(), &[AggregateWindow::OneMinute]);

    let mut batch = Vec::new();
    for i in 0..20 {
        batch.push(reading_at("a", i * 100, f64::from(i as i32)));
        batch.push(reading_at("b", i * 100 + 50, 100.0 + f64::from(i as i32)));
    }
    let out = engine.process_batch(batch, base() + ChronoDuration::seconds(5));

    let a = out.aggregate(Some("a"), AggregateWindow::OneMinute).expect("a");
    let b = out.aggregate(Some("b"), AggregateWindow::OneMinute).expect("b");
    let global = out.aggregate(None, AggregateWindow::OneMinute).expect("global");

    assert_eq!(a.count, 20);
    assert_eq!(b.count, 20);
    assert_eq!(global.count, a.count + b.count);
    assert_eq!(global.min, 0.0);
    assert_eq!(global.max, 119.0);
    assert_eq!(a.p95, 18.0);

    // Per-sensor order into the frame sink matches arrival order
    let seen = sink.0.lock().expect("lock");
    let a_values: Vec<f64> = seen
        .iter()
        .filter(|r| r.sensor_id() == "a")
        .map(Reading::value)
        .collect();
    let expected: Vec<f64> = (0..20).map(f64::from).collect();
    assert_eq!(a_values, expected);
}

#[test]
fn aggregate_matches_reference_statistics() {
    let values: Vec<f64> = (0..257)
        .map(|i| {
            let x = f64::from(i);
            (x * 0.37).sin() * 25.0 + x * 0.1
        })
        .collect();

    let summary = summarize(&values).expect("non-empty");
    let agg = Aggregate::from_summary(Some("ref".to_string()), AggregateWindow::OneMinute, summary);

    let reference_mean = values.iter().copied().mean();
    let reference_std = values.iter().copied().std_dev();
    assert!((agg.mean - reference_mean).abs() < 1e-9);
    assert!((agg.stdev - reference_std).abs() < 1e-9);
    assert!((sample_std_dev(&values) - reference_std).abs() < 1e-9);

    let mut online = OnlineStats::new();
    for v in &values {
        online.push(*v);
    }
    assert!((online.mean() - reference_mean).abs() < 1e-9);
    assert!((online.std_dev() - reference_std).abs() < 1e-9);
}

#[test]
fn percentile_is_nearest_rank() {
    assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0, 100.0], 0.95), 100.0);
    assert_eq!(percentile(&[7.0], 0.95), 7.0);
    assert_eq!(percentile(&[], 0.95), 0.0);
    let hundred: Vec<f64> = (1..=100).map(f64::from).collect();
    assert_eq!(percentile(&hundred, 0.95), 95.0);
}

// ============================================================================
// Full loop
// ============================================================================

#[tokio::test]
async fn readings_flow_from_queue_to_subscribers_and_storage() {
    let cancel = CancellationToken::new();
    let queue = Arc::new(IngestionQueue::new(1_000));
    let store = Arc::new(InMemoryStore::default());
    let (dispatcher, persistence) = PersistenceDispatcher::spawn(store.clone(), 1_000, cancel.clone());

    let registry = Arc::new(SubscriptionRegistry::new(64));
    let mut subscriber = registry.subscribe("sensor:s1");
    let coalescer = Arc::new(BroadcastCoalescer::new(registry.clone(), Duration::from_millis(20)));
    let engine = AggregationEngine::new(coalescer.clone(), &[AggregateWindow::OneMinute])
        .with_persistence(dispatcher.clone());

    let loop_task = tokio::spawn(
        ProcessingLoop::new(engine, Arc::clone(&queue), &EngineConfig::default(), cancel.clone()).run(),
    );
    let flush_task = tokio::spawn(Arc::clone(&coalescer).run(cancel.clone()));

    for i in 0..10 {
        queue.enqueue(Reading::now("s1", f64::from(i)).expect("valid"));
    }

    // Frames may split across ticks; collect until all ten readings arrived
    let mut received = Vec::new();
    while received.len() < 10 {
        let frame = tokio::time::timeout(Duration::from_secs(2), subscriber.recv())
            .await
            .expect("frame within timeout")
            .expect("channel open");
        assert_eq!(frame.sensor_id, "s1");
        received.extend(frame.readings.iter().map(Reading::value));
    }
    let expected: Vec<f64> = (0..10).map(f64::from).collect();
    assert_eq!(received, expected);

    cancel.cancel();
    let engine_stats = loop_task.await.expect("engine join");
    flush_task.await.expect("coalescer join");
    persistence.await.expect("persistence join");

    assert_eq!(engine_stats.readings, 10);
    assert_eq!(store.list("readings:s1").len(), 10);
    let aggregates: Vec<Aggregate> = store.list_as("aggregates:s1:1m");
    assert!(!aggregates.is_empty());
    assert!(!store.list("aggregates:all:1m").is_empty());
    assert_eq!(dispatcher.stats().failed, 0);
}

#[tokio::test]
async fn queue_overflow_keeps_newest_readings() {
    let queue = IngestionQueue::new(5);
    for i in 0..12 {
        queue.enqueue(reading_at("s", i, f64::from(i as i32)));
    }
    let stats = queue.stats();
    assert_eq!(stats.dropped, 7);
    let batch = queue.dequeue_batch(100, Duration::from_millis(10)).await;
    let values: Vec<f64> = batch.iter().map(Reading::value).collect();
    assert_eq!(values, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
}
