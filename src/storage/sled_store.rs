//! Sled-backed list store
//!
//! Records live in the `records` tree under `{list_key}\0{written_ms}{seq}`:
//! the write time (unix millis) and sled's monotonic id, both big-endian, so
//! a prefix scan is chronological and everything older than a cutoff is one
//! contiguous range. The `expiry` tree maps each list key to the instant its
//! newest record expires; it doubles as the index of lists to prune.
//!
//! [`SledStore::prune_expired`] removes every record older than the TTL and
//! forgets lists that have gone empty.
//!
//! Writes are not flushed individually; sled flushes in the background and a
//! crash loses at most the last few records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::{aggregate_key, reading_key, StorageError, StorageSink, ALERTS_KEY};
use crate::types::{Aggregate, Alert, Reading};

const RECORDS_TREE: &str = "records";
const EXPIRY_TREE: &str = "expiry";
const KEY_SEPARATOR: u8 = 0;

#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    records: sled::Tree,
    expiry: sled::Tree,
    ttl: Duration,
}

fn record_prefix_bytes(list_key: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(list_key.len() + 1);
    prefix.extend_from_slice(list_key);
    prefix.push(KEY_SEPARATOR);
    prefix
}

fn millis(ts: DateTime<Utc>) -> [u8; 8] {
    ts.timestamp_millis().to_be_bytes()
}

/// Record-key timestamp component. Pre-epoch instants sort as zero.
fn record_millis(ts: DateTime<Utc>) -> [u8; 8] {
    u64::try_from(ts.timestamp_millis()).unwrap_or(0).to_be_bytes()
}

/// `{list_key}\0{ts}`: lower bound of the records written at or after `ts`.
fn record_bound(list_key: &[u8], ts: DateTime<Utc>) -> Vec<u8> {
    let mut key = Vec::with_capacity(list_key.len() + 9);
    key.extend_from_slice(list_key);
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(&record_millis(ts));
    key
}

/// First key past every record of `list_key`.
fn list_end(list_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(list_key.len() + 1);
    key.extend_from_slice(list_key);
    key.push(KEY_SEPARATOR + 1);
    key
}

fn decode_millis(bytes: &[u8]) -> Option<i64> {
    bytes.try_into().ok().map(i64::from_be_bytes)
}

impl SledStore {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P, ttl: Duration) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        let store = Self::from_db(db, ttl)?;
        info!(path = %path.display(), records = store.records.len(), "Sled store opened");
        Ok(store)
    }

    /// Temporary store that is removed when dropped (tests, dry runs).
    pub fn temporary(ttl: Duration) -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, ttl)
    }

    fn from_db(db: sled::Db, ttl: Duration) -> Result<Self, StorageError> {
        let records = db.open_tree(RECORDS_TREE)?;
        let expiry = db.open_tree(EXPIRY_TREE)?;
        Ok(Self {
            db,
            records,
            expiry,
            ttl,
        })
    }

    fn append<T: Serialize>(&self, list_key: &str, value: &T) -> Result<(), StorageError> {
        self.append_at(list_key, value, Utc::now())
    }

    fn append_at<T: Serialize>(
        &self,
        list_key: &str,
        value: &T,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_vec(value)?;
        let mut key = record_bound(list_key.as_bytes(), now);
        key.extend_from_slice(&self.db.generate_id()?.to_be_bytes());

        let expires_at = now
            .checked_add_signed(self.ttl_chrono())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.records.insert(key, json)?;
        self.expiry.insert(list_key.as_bytes(), &millis(expires_at))?;
        Ok(())
    }

    fn ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX)
    }

    /// Records written before this instant are expired.
    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.ttl_chrono()).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn is_live(&self, list_key: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
        Ok(self
            .expiry
            .get(list_key.as_bytes())?
            .and_then(|v| decode_millis(&v))
            .is_some_and(|expires| expires >= now.timestamp_millis()))
    }

    /// Unexpired JSON entries stored under `list_key`, oldest first.
    pub fn list(&self, list_key: &str) -> Result<Vec<serde_json::Value>, StorageError> {
        self.list_at(list_key, Utc::now())
    }

    fn list_at(
        &self,
        list_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<serde_json::Value>, StorageError> {
        if !self.is_live(list_key, now)? {
            return Ok(Vec::new());
        }
        let key = list_key.as_bytes();
        self.records
            .range(record_bound(key, self.cutoff(now))..list_end(key))
            .values()
            .map(|v| Ok(serde_json::from_slice(&v?)?))
            .collect()
    }

    /// Remove every record older than the TTL. Lists whose newest record has
    /// expired are dropped from the index. Returns the number of records removed.
    pub fn prune_expired(&self) -> Result<usize, StorageError> {
        self.prune_expired_at(Utc::now())
    }

    fn prune_expired_at(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let now_ms = now.timestamp_millis();
        let cutoff = self.cutoff(now);
        let mut removed = 0;

        for entry in self.expiry.iter() {
            let (list_key, expires) = entry?;
            let expired = decode_millis(&expires).map_or(true, |ms| ms < now_ms);

            let start = record_prefix_bytes(&list_key);
            let stale = if expired {
                self.records.range(start..list_end(&list_key))
            } else {
                self.records.range(start..record_bound(&list_key, cutoff))
            };
            let mut pruned = 0;
            for record in stale.keys() {
                self.records.remove(record?)?;
                pruned += 1;
            }
            removed += pruned;

            if expired {
                self.expiry.remove(&list_key)?;
            }
            if pruned > 0 {
                debug!(key = %String::from_utf8_lossy(&list_key), pruned, expired, "Pruned list");
            }
        }

        Ok(removed)
    }

    /// Total stored records across all lists.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

#[async_trait]
impl StorageSink for SledStore {
    async fn store_reading(&self, reading: &Reading) -> Result<(), StorageError> {
        self.append(&reading_key(reading.sensor_id()), reading)
    }

    async fn store_aggregate(&self, aggregate: &Aggregate) -> Result<(), StorageError> {
        self.append(&aggregate_key(aggregate), aggregate)
    }

    async fn store_alert(&self, alert: &Alert) -> Result<(), StorageError> {
        self.append(ALERTS_KEY, alert)
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SledStore {
        SledStore::temporary(Duration::from_secs(3600)).expect("temporary sled store")
    }

    #[tokio::test]
    async fn test_lists_are_isolated_and_ordered() {
        let s = store();
        for i in 0..3 {
            let r = Reading::now("s1", f64::from(i)).expect("valid");
            s.store_reading(&r).await.expect("store");
        }
        // "s10" shares a textual prefix with "s1" but not the separator
        let other = Reading::now("s10", 99.0).expect("valid");
        s.store_reading(&other).await.expect("store");

        let values: Vec<f64> = s
            .list("readings:s1")
            .expect("list")
            .iter()
            .filter_map(|v| v["value"].as_f64())
            .collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
        assert_eq!(s.list("readings:s10").expect("list").len(), 1);
        assert_eq!(s.record_count(), 4);
    }

    #[test]
    fn test_prune_removes_only_expired_lists() {
        let s = SledStore::temporary(Duration::from_secs(60)).expect("store");
        let t0 = Utc::now();
        s.append_at("old", &1, t0).expect("append");
        s.append_at("old", &2, t0).expect("append");
        s.append_at("fresh", &3, t0 + chrono::Duration::seconds(50)).expect("append");

        let later = t0 + chrono::Duration::seconds(90);
        assert!(s.list_at("old", later).expect("list").is_empty());
        assert_eq!(s.prune_expired_at(later).expect("prune"), 2);
        assert_eq!(s.record_count(), 1);
        assert_eq!(s.list_at("fresh", later).expect("list"), vec![serde_json::json!(3)]);
    }

    #[test]
    fn test_prune_trims_stale_records_from_live_list() {
        let s = SledStore::temporary(Duration::from_secs(60)).expect("store");
        let t0 = Utc::now();
        s.append_at("readings:s1", &1, t0).expect("append");
        s.append_at("readings:s1", &2, t0 + chrono::Duration::seconds(55)).expect("append");
        s.append_at("readings:s1", &3, t0 + chrono::Duration::seconds(110)).expect("append");

        let later = t0 + chrono::Duration::seconds(150);
        assert_eq!(s.list_at("readings:s1", later).expect("list"), vec![serde_json::json!(3)]);
        assert_eq!(s.prune_expired_at(later).expect("prune"), 2);
        assert_eq!(s.record_count(), 1);
        assert_eq!(s.list_at("readings:s1", later).expect("list"), vec![serde_json::json!(3)]);

        // Nothing left to trim on a second pass
        assert_eq!(s.prune_expired_at(later).expect("prune"), 0);
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        {
            let s = SledStore::open(&path, Duration::from_secs(3600)).expect("open");
            s.append("alerts", &serde_json::json!({"id": "a1"})).expect("append");
            s.db.flush().expect("flush");
        }
        let s = SledStore::open(&path, Duration::from_secs(3600)).expect("reopen");
        assert_eq!(s.list("alerts").expect("list").len(), 1);
    }
}
