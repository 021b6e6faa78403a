//! Storage sinks for readings, aggregates and alerts
//!
//! The pipeline treats storage as an external key-value/list store with TTL.
//! Everything here sits behind [`StorageSink`]:
//! - `InMemoryStore`: TTL'd lists in process memory (tests, single-box runs)
//! - `SledStore`: append-only records in a sled tree with periodic pruning
//!
//! The hot loop never calls a sink directly. It submits jobs to the
//! [`PersistenceDispatcher`], which drains them on its own task
//! (at-most-once, best-effort).

mod dispatcher;
mod memory;
mod sled_store;

pub use dispatcher::{DispatcherStats, PersistJob, PersistenceDispatcher};
pub use memory::InMemoryStore;
pub use sled_store::SledStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Aggregate, Alert, Reading};

/// List holding every stored alert.
pub const ALERTS_KEY: &str = "alerts";

/// Sensor segment used in aggregate keys for the cross-sensor aggregate.
pub const GLOBAL_SENSOR_KEY: &str = "all";

/// `readings:{sensor}`
pub fn reading_key(sensor_id: &str) -> String {
    format!("readings:{sensor_id}")
}

/// `aggregates:{sensor|all}:{window}`
pub fn aggregate_key(aggregate: &Aggregate) -> String {
    format!(
        "aggregates:{}:{}",
        aggregate.sensor_id.as_deref().unwrap_or(GLOBAL_SENSOR_KEY),
        aggregate.window.tag()
    )
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Destination for pipeline output.
///
/// Implementations must be thread-safe; calls arrive from the persistence
/// worker task, never from the aggregation loop itself.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn store_reading(&self, reading: &Reading) -> Result<(), StorageError>;

    async fn store_aggregate(&self, aggregate: &Aggregate) -> Result<(), StorageError>;

    async fn store_alert(&self, alert: &Alert) -> Result<(), StorageError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}
