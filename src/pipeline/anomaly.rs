//! z-score anomaly rule over a sensor's running statistics.

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use uuid::Uuid;

use crate::config::defaults::{ANOMALY_MIN_SAMPLES, ANOMALY_MIN_STD_DEV, ANOMALY_Z_THRESHOLD};
use crate::stats::OnlineStats;
use crate::types::{Alert, Reading, Severity};

/// Detector tag carried by alerts built from a detection.
pub const ZSCORE_ALERT_KIND: &str = "zscore";

/// One flagged reading together with the statistics it was judged against.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyDetection {
    pub sensor_id: String,
    pub timestamp: DateTime<FixedOffset>,
    pub value: f64,
    pub z: f64,
    pub mean: f64,
    pub stdev: f64,
    pub sample_count: u64,
}

/// Evaluate the rule for `reading` against stats that already include it.
///
/// Skipped (returns `None`) below [`ANOMALY_MIN_SAMPLES`] samples or when the
/// standard deviation is at or below [`ANOMALY_MIN_STD_DEV`].
pub fn detect(stats: &OnlineStats, reading: &Reading) -> Option<AnomalyDetection> {
    if stats.count() < ANOMALY_MIN_SAMPLES {
        return None;
    }
    let z = stats.z_score(reading.value(), ANOMALY_MIN_STD_DEV)?;
    (z >= ANOMALY_Z_THRESHOLD).then(|| AnomalyDetection {
        sensor_id: reading.sensor_id().to_string(),
        timestamp: reading.timestamp(),
        value: reading.value(),
        z,
        mean: stats.mean(),
        stdev: stats.std_dev(),
        sample_count: stats.count(),
    })
}

impl AnomalyDetection {
    /// Build the alert record for this detection (not emitted by the engine).
    pub fn to_alert(&self) -> Alert {
        Alert {
            id: Uuid::new_v4().to_string(),
            sensor_id: self.sensor_id.clone(),
            timestamp: self.timestamp,
            kind: ZSCORE_ALERT_KIND.to_string(),
            message: format!(
                "{} reading {:.3} is {:.2} sigma from mean {:.3} (stdev {:.3})",
                self.sensor_id, self.value, self.z, self.mean, self.stdev
            ),
            severity: Severity::Warn,
            acknowledged: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(stats: &mut OnlineStats, value: f64) -> Option<AnomalyDetection> {
        let r = Reading::now("s1", value).expect("valid reading");
        stats.push(value);
        detect(stats, &r)
    }

    #[test]
    fn test_never_fires_before_sample_floor() {
        let mut stats = OnlineStats::new();
        for i in 0..29 {
            let v = if i % 2 == 0 { 0.0 } else { 1.0 };
            assert!(feed(&mut stats, v).is_none());
        }
        // 29th sample is enormous, still below the floor
        let mut stats = OnlineStats::new();
        for i in 0..28 {
            feed(&mut stats, f64::from(i % 3));
        }
        assert!(feed(&mut stats, 1e12).is_none());
        assert_eq!(stats.count(), 29);
    }

    #[test]
    fn test_constant_signal_is_suppressed() {
        let mut stats = OnlineStats::new();
        for _ in 0..100 {
            assert!(feed(&mut stats, 5.0).is_none());
        }
    }

    #[test]
    fn test_fires_on_thirtieth_sample() {
        let mut stats = OnlineStats::new();
        for _ in 0..29 {
            assert!(feed(&mut stats, 0.0).is_none());
        }
        let hit = feed(&mut stats, 1.0).expect("30th sample should fire");
        assert_eq!(hit.sample_count, 30);
        assert!(hit.z >= 3.0);
        assert!((hit.mean - 1.0 / 30.0).abs() < 1e-12);
    }

    #[test]
    fn test_within_three_sigma_is_quiet() {
        let mut stats = OnlineStats::new();
        for i in 0..100 {
            feed(&mut stats, f64::from(i % 10));
        }
        // mean ~4.5, stdev ~2.9: 9.0 is well within 3 sigma
        assert!(feed(&mut stats, 9.0).is_none());
        assert!(feed(&mut stats, 100.0).is_some());
    }

    #[test]
    fn test_alert_from_detection() {
        let mut stats = OnlineStats::new();
        for _ in 0..29 {
            feed(&mut stats, 0.0);
        }
        let alert = feed(&mut stats, 1.0).expect("detection").to_alert();
        assert_eq!(alert.sensor_id, "s1");
        assert_eq!(alert.kind, "zscore");
        assert_eq!(alert.severity, Severity::Warn);
        assert!(!alert.acknowledged);
        assert!(Uuid::parse_str(&alert.id).is_ok());
    }
}
