//! Alert records.
//!
//! The aggregation engine only detects anomalies today; an [`Alert`] is the
//! record a detection would become once alert emission is wired to storage
//! and broadcast.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub sensor_id: String,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<FixedOffset>,
    /// Detector that raised the alert (e.g. `"zscore"`).
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub severity: Severity,
    #[serde(rename = "ack")]
    pub acknowledged: bool,
}
