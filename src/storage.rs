pub mod sqlite;

use chrono::{DateTime, Utc};
use error_stack::Report;
use futures::future::BoxFuture;
use serde::Serialize;
use uuid::Uuid;

use crate::condition::Condition;
use crate::error::StorageError;
use crate::model::TriggerEvent;

/// Outcome of one channel send, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRecord {
    pub event_id: Uuid,
    pub message_id: Option<Uuid>,
    pub channel: String,
    pub success: bool,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Write-behind audit sink. Nothing in the pipeline reads back from it.
pub trait Storage: Send + Sync {
    /// Insert or replace the definition and counters of a condition.
    fn save_condition(&self, condition: &Condition)
    -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn record_trigger(&self, event: &TriggerEvent)
    -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn record_delivery(
        &self,
        record: &DeliveryRecord,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    /// Newest first.
    fn recent_deliveries(
        &self,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<DeliveryRecord>, Report<StorageError>>>;
}
