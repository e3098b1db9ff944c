use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use uuid::Uuid;

use crate::condition::Condition;
use crate::error::StorageError;
use crate::model::TriggerEvent;
use crate::storage::{DeliveryRecord, Storage};

type DeliveryRow = (String, Option<String>, String, bool, Option<String>, String);

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, Report<StorageError>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .change_context(StorageError::Migration)
                .attach_with(|| format!("cannot create data directory: {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .change_context(StorageError::Migration)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts)
            .await
            .change_context(StorageError::Migration)
            .attach_with(|| format!("database path: {}", path.display()))?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, Report<StorageError>> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;
        Ok(Self { pool })
    }

    /// Private in-memory database that lives as long as the storage.
    pub async fn in_memory() -> Result<Self, Report<StorageError>> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .change_context(StorageError::Migration)?;
        // Every connection to :memory: is a separate database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .change_context(StorageError::Migration)?;
        Self::migrate(pool).await
    }

    #[cfg(test)]
    pub(crate) async fn trigger_count(
        &self,
        id: &crate::model::ConditionId,
    ) -> Result<Option<i64>, Report<StorageError>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT trigger_count FROM conditions WHERE condition_id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .change_context(StorageError::Query)?;
        Ok(row.map(|(count,)| count))
    }
}

impl Storage for SqliteStorage {
    fn save_condition(
        &self,
        condition: &Condition,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let condition = condition.clone();
        Box::pin(async move {
            let definition = serde_json::to_string(&condition.condition_type)
                .change_context(StorageError::Insert)?;
            sqlx::query(
                "INSERT OR REPLACE INTO conditions \
                 (condition_id, name, symbol, condition_type, definition, operator, threshold, \
                  priority, is_active, status, trigger_count, evaluation_count, last_triggered, \
                  updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(condition.id().as_str())
            .bind(&condition.name)
            .bind(&condition.symbol)
            .bind(condition.condition_type.as_str())
            .bind(definition)
            .bind(condition.operator.as_str())
            .bind(condition.threshold.to_string())
            .bind(i64::from(condition.priority.level()))
            .bind(condition.is_active)
            .bind(condition.status.as_str())
            .bind(condition.trigger_count as i64)
            .bind(condition.evaluation_count as i64)
            .bind(condition.last_triggered.map(|t| t.to_rfc3339()))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)
            .attach_with(|| format!("condition_id: {}", condition.id()))?;
            Ok(())
        })
    }

    fn record_trigger(
        &self,
        event: &TriggerEvent,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let event = event.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO trigger_events \
                 (event_id, condition_id, condition_name, symbol, value, details, priority, \
                  evaluation_id, triggered_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(event.event_id.to_string())
            .bind(event.condition_id.as_str())
            .bind(&event.condition_name)
            .bind(&event.symbol)
            .bind(event.result.value.to_string())
            .bind(&event.result.details)
            .bind(i64::from(event.priority.level()))
            .bind(event.context.evaluation_id.to_string())
            .bind(event.timestamp.to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)
            .attach_with(|| format!("event_id: {}", event.event_id))?;
            Ok(())
        })
    }

    fn record_delivery(
        &self,
        record: &DeliveryRecord,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let record = record.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO deliveries \
                 (event_id, message_id, channel, success, error, recorded_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(record.event_id.to_string())
            .bind(record.message_id.map(|id| id.to_string()))
            .bind(&record.channel)
            .bind(record.success)
            .bind(&record.error)
            .bind(record.recorded_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)?;
            Ok(())
        })
    }

    fn recent_deliveries(
        &self,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<DeliveryRecord>, Report<StorageError>>> {
        Box::pin(async move {
            let rows: Vec<DeliveryRow> = sqlx::query_as(
                "SELECT event_id, message_id, channel, success, error, recorded_at \
                 FROM deliveries \
                 ORDER BY id DESC \
                 LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            rows.into_iter().map(map_delivery_row).collect()
        })
    }
}

fn map_delivery_row(row: DeliveryRow) -> Result<DeliveryRecord, Report<StorageError>> {
    let (event_id, message_id, channel, success, error, recorded_at) = row;
    let event_id = Uuid::parse_str(&event_id)
        .change_context(StorageError::Query)
        .attach_with(|| format!("event_id: {event_id}"))?;
    let message_id = message_id
        .as_deref()
        .map(Uuid::parse_str)
        .transpose()
        .change_context(StorageError::Query)?;
    Ok(DeliveryRecord {
        event_id,
        message_id,
        channel,
        success,
        error,
        recorded_at: parse_time_utc(&recorded_at),
    })
}

fn parse_time_utc(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
