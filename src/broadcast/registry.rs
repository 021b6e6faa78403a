//! In-process subscription registry
//!
//! One `tokio::sync::broadcast` channel per group, created on first
//! subscribe. Frames are shared as `Arc<Frame>` so fan-out never copies the
//! readings. A receiver that falls more than `capacity` frames behind loses
//! the oldest ones (`RecvError::Lagged`).

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Frame, FrameTransport, TransportError};

pub struct SubscriptionRegistry {
    groups: DashMap<String, broadcast::Sender<Arc<Frame>>>,
    capacity: usize,
}

impl SubscriptionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Join `group`. Dropping the receiver leaves it.
    pub fn subscribe(&self, group: &str) -> broadcast::Receiver<Arc<Frame>> {
        if let Some(sender) = self.groups.get(group) {
            return sender.subscribe();
        }
        self.groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, group: &str) -> usize {
        self.groups
            .get(group)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Groups that currently exist (with or without members).
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Drop channels nobody listens to any more. Returns how many were removed.
    pub fn prune_empty(&self) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, sender| sender.receiver_count() > 0);
        before - self.groups.len()
    }
}

#[async_trait]
impl FrameTransport for SubscriptionRegistry {
    async fn publish(&self, group: &str, frame: Frame) -> Result<(), TransportError> {
        let Some(sender) = self.groups.get(group).map(|s| s.value().clone()) else {
            return Ok(());
        };
        // SendError only means there are no receivers right now
        match sender.send(Arc::new(frame)) {
            Ok(receivers) => debug!(group = %group, receivers, "Frame delivered"),
            Err(_) => debug!(group = %group, "No subscribers, frame discarded"),
        }
        Ok(())
    }
}
