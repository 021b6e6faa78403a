//! Coalesced fan-out of readings to subscriber groups
//!
//! The aggregation engine hands every accepted reading to a [`FrameSink`].
//! The [`BroadcastCoalescer`] buffers them per sensor and, on a fixed tick,
//! publishes one [`Frame`] per non-empty sensor through a [`FrameTransport`].
//! [`SubscriptionRegistry`] is the in-process transport; the WebSocket hub in
//! [`websocket`] bridges it to network clients.

mod coalescer;
mod registry;
pub mod websocket;

pub use coalescer::{BroadcastCoalescer, CoalescerStats, FlushReport};
pub use registry::SubscriptionRegistry;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::defaults::GROUP_PREFIX;
use crate::types::Reading;

/// Group key for a sensor's subscribers: `sensor:{id}`.
pub fn group_for(sensor_id: &str) -> String {
    format!("{GROUP_PREFIX}{sensor_id}")
}

/// Readings for one sensor accumulated over one flush tick, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub sensor_id: String,
    pub readings: Vec<Reading>,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("publish to {group} failed: {reason}")]
    Publish { group: String, reason: String },
}

/// Receiver of per-reading frame updates. `add` must not block on I/O.
pub trait FrameSink: Send + Sync {
    fn add(&self, reading: Reading);
}

/// Delivers a frame to every member of a group.
///
/// A group with no members is not an error; implementations return `Ok(())`.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    async fn publish(&self, group: &str, frame: Frame) -> Result<(), TransportError>;
}
