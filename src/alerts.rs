//! Alert acknowledgment boundary
//!
//! Acknowledgment state is owned by whatever sits behind [`AlertAcknowledger`].
//! The bundled [`PassThroughAcknowledger`] keeps no state: it validates the id,
//! logs it and reports success.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AckError {
    #[error("alert id must not be empty")]
    EmptyAlertId,
    #[error("acknowledgment backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AlertAcknowledger: Send + Sync {
    /// Mark `alert_id` as acknowledged.
    async fn acknowledge(&self, alert_id: &str) -> Result<(), AckError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughAcknowledger;

#[async_trait]
impl AlertAcknowledger for PassThroughAcknowledger {
    async fn acknowledge(&self, alert_id: &str) -> Result<(), AckError> {
        let alert_id = alert_id.trim();
        if alert_id.is_empty() {
            return Err(AckError::EmptyAlertId);
        }
        info!(alert_id = %alert_id, "Acknowledged alert");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pass_through_accepts_any_id() {
        let ack = PassThroughAcknowledger;
        assert!(ack.acknowledge("3f1c-unknown").await.is_ok());
        assert_eq!(ack.acknowledge("  ").await, Err(AckError::EmptyAlertId));
    }
}
