//! Sensor readings - the unit of data flowing through the pipeline.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status tag applied when the source does not provide one.
pub const DEFAULT_STATUS: &str = "ok";

/// One timestamped scalar sample from one sensor.
///
/// Immutable once built: fields are private and only exposed through
/// accessors. Deserialization goes through the same validation as
/// [`Reading::new`], so an empty sensor id never enters the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ReadingWire", rename_all = "camelCase")]
pub struct Reading {
    sensor_id: String,
    #[serde(rename = "ts")]
    timestamp: DateTime<FixedOffset>,
    value: f64,
    status: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadingError {
    #[error("sensor id must not be empty")]
    EmptySensorId,
}

impl Reading {
    /// Build a reading with the default `"ok"` status.
    pub fn new(
        sensor_id: impl Into<String>,
        timestamp: DateTime<FixedOffset>,
        value: f64,
    ) -> Result<Self, ReadingError> {
        let sensor_id = sensor_id.into();
        if sensor_id.trim().is_empty() {
            return Err(ReadingError::EmptySensorId);
        }
        Ok(Self {
            sensor_id,
            timestamp,
            value,
            status: DEFAULT_STATUS.to_string(),
        })
    }

    /// Convenience constructor stamping the reading with the current UTC time.
    pub fn now(sensor_id: impl Into<String>, value: f64) -> Result<Self, ReadingError> {
        Self::new(sensor_id, Utc::now().fixed_offset(), value)
    }

    /// Replace the status tag.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub const fn timestamp(&self) -> DateTime<FixedOffset> {
        self.timestamp
    }

    /// Timestamp normalised to UTC (window arithmetic runs in UTC).
    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        self.timestamp.with_timezone(&Utc)
    }

    pub const fn value(&self) -> f64 {
        self.value
    }

    pub fn status(&self) -> &str {
        &self.status
    }
}

/// Wire shape accepted from sources before validation.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadingWire {
    sensor_id: String,
    #[serde(alias = "timestamp")]
    ts: DateTime<FixedOffset>,
    value: f64,
    #[serde(default)]
    status: Option<String>,
}

impl TryFrom<ReadingWire> for Reading {
    type Error = ReadingError;

    fn try_from(wire: ReadingWire) -> Result<Self, Self::Error> {
        let reading = Self::new(wire.sensor_id, wire.ts, wire.value)?;
        Ok(match wire.status {
            Some(status) if !status.is_empty() => reading.with_status(status),
            _ => reading,
        })
    }
}
