//! In-memory list store with per-key TTL
//!
//! Mirrors the key layout of the external store (`readings:{id}`,
//! `aggregates:{id}:{window}`, `alerts`). Each write appends a JSON entry and
//! refreshes the key's expiry; lists are trimmed oldest-first at
//! `max_list_len`. Not durable - data is lost on restart.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;

use super::{aggregate_key, reading_key, StorageError, StorageSink, ALERTS_KEY};
use crate::config::defaults::{MAX_LIST_LEN, STORAGE_TTL_SECS};
use crate::types::{Aggregate, Alert, Reading};

#[derive(Debug)]
struct StoredList {
    entries: VecDeque<String>,
    expires_at: Instant,
}

pub struct InMemoryStore {
    lists: Mutex<HashMap<String, StoredList>>,
    ttl: Duration,
    max_list_len: usize,
}

impl InMemoryStore {
    pub fn new(ttl: Duration, max_list_len: usize) -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
            ttl,
            max_list_len: max_list_len.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredList>> {
        self.lists.lock().unwrap_or_else(|e| {
            warn!("InMemoryStore mutex poisoned, recovering");
            e.into_inner()
        })
    }

    fn push_json<T: Serialize>(&self, key: String, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)?;
        self.push_at(key, json, Instant::now());
        Ok(())
    }

    fn push_at(&self, key: String, json: String, now: Instant) {
        let mut lists = self.lock();
        let list = lists.entry(key).or_insert_with(|| StoredList {
            entries: VecDeque::new(),
            expires_at: now,
        });
        if list.expires_at < now {
            list.entries.clear();
        }
        list.entries.push_back(json);
        while list.entries.len() > self.max_list_len {
            list.entries.pop_front();
        }
        list.expires_at = now + self.ttl;
    }

    /// Raw JSON entries stored under `key`, oldest first. Expired keys read as empty.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.list_at(key, Instant::now())
    }

    fn list_at(&self, key: &str, now: Instant) -> Vec<String> {
        self.lock()
            .get(key)
            .filter(|list| list.expires_at >= now)
            .map(|list| list.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Entries under `key` decoded as `T`; undecodable entries are skipped.
    pub fn list_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Vec<T> {
        self.list(key)
            .iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect()
    }

    /// Live (non-expired) keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, list)| list.expires_at >= now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Remove expired keys. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let mut lists = self.lock();
        let before = lists.len();
        lists.retain(|_, list| list.expires_at >= now);
        before - lists.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(STORAGE_TTL_SECS), MAX_LIST_LEN)
    }
}

#[async_trait]
impl StorageSink for InMemoryStore {
    async fn store_reading(&self, reading: &Reading) -> Result<(), StorageError> {
        self.push_json(reading_key(reading.sensor_id()), reading)
    }

    async fn store_aggregate(&self, aggregate: &Aggregate) -> Result<(), StorageError> {
        self.push_json(aggregate_key(aggregate), aggregate)
    }

    async fn store_alert(&self, alert: &Alert) -> Result<(), StorageError> {
        self.push_json(ALERTS_KEY.to_string(), alert)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
