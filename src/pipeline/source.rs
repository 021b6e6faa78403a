//! Reading sources feeding the ingestion queue.
//!
//! Provides a unified trait over where readings come from: a built-in
//! simulator (demo and load testing) and stdin (JSON lines). The producer
//! task calls [`ReadingSource::next_reading`] in a `select!` with
//! cancellation and enqueues everything it gets.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::queue::IngestionQueue;
use crate::config::SimulatorConfig;
use crate::types::Reading;

/// Events produced by a reading source.
pub enum SourceEvent {
    Reading(Reading),
    /// No more data (EOF on stdin, exhausted replay)
    Eof,
}

/// Trait abstracting where readings come from.
///
/// Implementations handle parsing and pacing internally.
#[async_trait]
pub trait ReadingSource: Send + 'static {
    /// Next reading, `SourceEvent::Eof` when exhausted, `Err` when the source
    /// cannot continue.
    async fn next_reading(&mut self) -> Result<SourceEvent>;

    /// Human-readable name for logging
    fn source_name(&self) -> &str;
}

// ============================================================================
// Simulated Source
// ============================================================================

/// Multiplier applied to the standard deviation for injected spikes
const SPIKE_SIGMAS: f64 = 8.0;

/// Tick period for `rate_hz`, never shorter than one nanosecond.
fn tick_period(rate_hz: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(rate_hz.max(1))).max(Duration::from_nanos(1))
}

/// Emits one reading per sensor (`sensor-1..N`) every `1 / rate_hz` seconds.
///
/// Values follow a normal distribution; with `spike_probability` a value is
/// replaced by one `SPIKE_SIGMAS` standard deviations away from the mean.
pub struct SimulatedSource {
    sensor_ids: Vec<String>,
    distribution: Normal<f64>,
    mean: f64,
    std_dev: f64,
    spike_probability: f64,
    rng: StdRng,
    period: Duration,
    /// Created on the first read so a source can be built outside a runtime.
    ticker: Option<Interval>,
    pending: VecDeque<Reading>,
    limit: Option<u64>,
    emitted: u64,
}

impl SimulatedSource {
    pub fn new(config: &SimulatorConfig) -> Result<Self> {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic source for tests and reproducible runs.
    pub fn with_seed(config: &SimulatorConfig, seed: u64) -> Result<Self> {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &SimulatorConfig, rng: StdRng) -> Result<Self> {
        anyhow::ensure!(
            config.has_valid_distribution(),
            "invalid simulator distribution (mean {}, std_dev {})",
            config.mean,
            config.std_dev
        );
        let distribution = Normal::new(config.mean, config.std_dev)
            .with_context(|| format!("invalid simulator distribution (std_dev {})", config.std_dev))?;

        Ok(Self {
            sensor_ids: (1..=config.sensors.max(1)).map(|i| format!("sensor-{i}")).collect(),
            distribution,
            mean: config.mean,
            std_dev: config.std_dev,
            spike_probability: config.spike_probability.clamp(0.0, 1.0),
            rng,
            period: tick_period(config.rate_hz),
            ticker: None,
            pending: VecDeque::new(),
            limit: None,
            emitted: 0,
        })
    }

    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Stop with `Eof` after `limit` readings.
    #[must_use]
    pub const fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn sample(&mut self) -> f64 {
        if self.rng.gen_bool(self.spike_probability) {
            let sign = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            self.mean + sign * SPIKE_SIGMAS * self.std_dev
        } else {
            self.distribution.sample(&mut self.rng)
        }
    }

    fn fill_tick(&mut self) -> Result<()> {
        let ts = Utc::now().fixed_offset();
        for idx in 0..self.sensor_ids.len() {
            let value = self.sample();
            let reading = Reading::new(self.sensor_ids[idx].clone(), ts, value)?;
            self.pending.push_back(reading);
        }
        Ok(())
    }
}

#[async_trait]
impl ReadingSource for SimulatedSource {
    async fn next_reading(&mut self) -> Result<SourceEvent> {
        if self.limit.is_some_and(|limit| self.emitted >= limit) {
            return Ok(SourceEvent::Eof);
        }
        if self.pending.is_empty() {
            let period = self.period;
            let ticker = self.ticker.get_or_insert_with(|| {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });
            ticker.tick().await;
            self.fill_tick()?;
        }
        match self.pending.pop_front() {
            Some(reading) => {
                self.emitted += 1;
                Ok(SourceEvent::Reading(reading))
            }
            None => Ok(SourceEvent::Eof),
        }
    }

    fn source_name(&self) -> &str {
        "simulator"
    }
}

// ============================================================================
// Stdin Source (JSON readings, one per line)
// ============================================================================

/// Reads JSON readings from stdin, e.g.
/// `{"sensorId":"s1","ts":"2024-01-01T00:00:00Z","value":1.5}`.
///
/// Malformed lines are logged and skipped.
pub struct StdinSource {
    reader: tokio::io::BufReader<tokio::io::Stdin>,
    line_buffer: String,
    skipped: u64,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            reader: tokio::io::BufReader::new(tokio::io::stdin()),
            line_buffer: String::with_capacity(256),
            skipped: 0,
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one input line. `None` for blank lines.
pub fn parse_line(line: &str) -> Option<Result<Reading, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str(line))
}

#[async_trait]
impl ReadingSource for StdinSource {
    async fn next_reading(&mut self) -> Result<SourceEvent> {
        use tokio::io::AsyncBufReadExt;
        loop {
            self.line_buffer.clear();
            let bytes = self
                .reader
                .read_line(&mut self.line_buffer)
                .await
                .context("failed to read stdin")?;
            if bytes == 0 {
                if self.skipped > 0 {
                    warn!(skipped = self.skipped, "Stdin closed, malformed lines were skipped");
                }
                return Ok(SourceEvent::Eof);
            }
            match parse_line(&self.line_buffer) {
                None => continue,
                Some(Ok(reading)) => return Ok(SourceEvent::Reading(reading)),
                Some(Err(e)) => {
                    self.skipped += 1;
                    warn!(error = %e, "Failed to parse reading");
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        "stdin"
    }
}

// ============================================================================
// Producer
// ============================================================================

/// Pump `source` into `queue` until EOF, a source error, or cancellation.
///
/// Returns the number of readings enqueued.
pub async fn run_producer<S: ReadingSource>(
    mut source: S,
    queue: Arc<IngestionQueue>,
    cancel_token: CancellationToken,
) -> Result<u64> {
    info!(source = source.source_name(), "Producer started");
    let mut produced = 0u64;

    loop {
        let event = tokio::select! {
            () = cancel_token.cancelled() => break,
            result = source.next_reading() => result
                .with_context(|| format!("{} source failed", source.source_name()))?,
        };

        match event {
            SourceEvent::Reading(reading) => {
                queue.enqueue(reading);
                produced += 1;
            }
            SourceEvent::Eof => {
                info!(source = source.source_name(), produced, "Source reached end");
                break;
            }
        }
    }

    info!(source = source.source_name(), produced, "Producer stopped");
    Ok(produced)
}
