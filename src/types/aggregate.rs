//! Window tags and windowed aggregate summaries.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::stats::Summary;

/// Trailing time span an [`Aggregate`] covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AggregateWindow {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "24h")]
    OneDay,
}

impl AggregateWindow {
    pub const ALL: [Self; 5] = [
        Self::OneMinute,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::OneHour,
        Self::OneDay,
    ];

    pub fn duration(self) -> Duration {
        match self {
            Self::OneMinute => Duration::minutes(1),
            Self::FiveMinutes => Duration::minutes(5),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::OneHour => Duration::hours(1),
            Self::OneDay => Duration::hours(24),
        }
    }

    /// Short tag used in storage keys and on the wire.
    pub const fn tag(self) -> &'static str {
        match self {
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::OneDay => "24h",
        }
    }
}

impl fmt::Display for AggregateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for AggregateWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|w| w.tag().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown window '{s}' (expected one of 1m, 5m, 15m, 1h, 24h)"))
    }
}

/// Summary of a window of readings.
///
/// `sensor_id == None` marks the cross-sensor (global) aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub sensor_id: Option<String>,
    pub window: AggregateWindow,
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stdev: f64,
    pub p95: f64,
}

impl Aggregate {
    pub fn from_summary(sensor_id: Option<String>, window: AggregateWindow, summary: Summary) -> Self {
        Self {
            sensor_id,
            window,
            count: summary.count,
            min: summary.min,
            max: summary.max,
            mean: summary.mean,
            stdev: summary.std_dev,
            p95: summary.p95,
        }
    }

    pub const fn is_global(&self) -> bool {
        self.sensor_id.is_none()
    }
}
