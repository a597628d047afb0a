use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domains::core::parse_datetime;
use crate::domains::sync::types::{
    ConflictResolution, SyncConflict, SyncConflictRow, SyncEvent, SyncEventRow,
};
use crate::errors::{DbError, DomainError, DomainResult};

/// Repository for the append-only sync event ledger.
///
/// Events are only ever inserted and flagged processed; nothing updates or
/// deletes a row after the fact.
#[async_trait]
pub trait SyncEventRepository: Send + Sync {
    /// Append an event to the ledger within the caller's transaction.
    async fn create_event_tx<'t>(
        &self,
        event: &SyncEvent,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Flag an event processed within the caller's transaction.
    async fn mark_processed_tx<'t>(
        &self,
        event_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Catch-up query: every event for the user after `since`, excluding the
    /// requesting device's own events, oldest first.
    async fn events_since(
        &self,
        user_id: Uuid,
        exclude_device_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> DomainResult<Vec<SyncEvent>>;

    /// Timestamp of the newest event in the user's ledger.
    async fn latest_event_timestamp(&self, user_id: Uuid) -> DomainResult<Option<DateTime<Utc>>>;
}

/// Repository for the conflict audit trail. Conflict rows are created on
/// detection and updated in place on resolution, never deleted.
#[async_trait]
pub trait SyncConflictRepository: Send + Sync {
    async fn create_conflict_tx<'t>(
        &self,
        conflict: &SyncConflict,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    async fn find_by_id(&self, conflict_id: Uuid) -> DomainResult<Option<SyncConflict>>;

    /// Fill in the resolution fields within the caller's transaction.
    async fn mark_resolved_tx<'t>(
        &self,
        conflict_id: Uuid,
        resolution: ConflictResolution,
        resolved_by: Uuid,
        resolved_at: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;
}

/// SQLite implementation of the SyncEventRepository
pub struct SqliteSyncEventRepository {
    pool: SqlitePool,
}

impl SqliteSyncEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncEventRepository for SqliteSyncEventRepository {
    async fn create_event_tx<'t>(
        &self,
        event: &SyncEvent,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let event_data = serde_json::to_string(&event.event_data)
            .map_err(|e| DbError::Query(format!("Event payload not serializable: {}", e)))?;

        query(
            r#"
            INSERT INTO sync_events (
                id, user_id, device_id, event_type, resource_type, resource_id,
                event_data, timestamp, sync_version, is_processed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.user_id.to_string())
        .bind(event.device_id.to_string())
        .bind(event.event_type.as_str())
        .bind(event.resource_type.as_str())
        .bind(event.resource_id.to_string())
        .bind(event_data)
        .bind(event.timestamp.to_rfc3339())
        .bind(event.sync_version)
        .bind(event.is_processed as i64)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn mark_processed_tx<'t>(
        &self,
        event_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query("UPDATE sync_events SET is_processed = 1 WHERE id = ?")
            .bind(event_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        Ok(())
    }

    async fn events_since(
        &self,
        user_id: Uuid,
        exclude_device_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: u32,
    ) -> DomainResult<Vec<SyncEvent>> {
        // Epoch floor keeps the query shape identical with and without a
        // client-supplied watermark.
        let since = since
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_else(Utc::now));

        let rows = query_as::<_, SyncEventRow>(
            r#"
            SELECT * FROM sync_events
            WHERE user_id = ? AND device_id != ? AND timestamp > ?
            ORDER BY timestamp ASC
            LIMIT ?
            "#,
        )
        .bind(user_id.to_string())
        .bind(exclude_device_id.to_string())
        .bind(since.to_rfc3339())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(SyncEvent::try_from).collect()
    }

    async fn latest_event_timestamp(&self, user_id: Uuid) -> DomainResult<Option<DateTime<Utc>>> {
        let (latest,): (Option<String>,) =
            query_as("SELECT MAX(timestamp) FROM sync_events WHERE user_id = ?")
                .bind(user_id.to_string())
                .fetch_one(&self.pool)
                .await
                .map_err(DbError::from)?;

        latest
            .map(|ts| parse_datetime(&ts, "sync_events.timestamp"))
            .transpose()
    }
}

/// SQLite implementation of the SyncConflictRepository
pub struct SqliteSyncConflictRepository {
    pool: SqlitePool,
}

impl SqliteSyncConflictRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncConflictRepository for SqliteSyncConflictRepository {
    async fn create_conflict_tx<'t>(
        &self,
        conflict: &SyncConflict,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let data_1 = serde_json::to_string(&conflict.data_1)
            .map_err(|e| DbError::Query(format!("Conflict data_1 not serializable: {}", e)))?;
        let data_2 = serde_json::to_string(&conflict.data_2)
            .map_err(|e| DbError::Query(format!("Conflict data_2 not serializable: {}", e)))?;

        query(
            r#"
            INSERT INTO sync_conflicts (
                id, user_id, resource_type, resource_id,
                device_id_1, device_id_2, version_1, version_2, data_1, data_2,
                resolution, resolved_at, resolved_by, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?)
            "#,
        )
        .bind(conflict.id.to_string())
        .bind(conflict.user_id.to_string())
        .bind(conflict.resource_type.as_str())
        .bind(conflict.resource_id.to_string())
        .bind(conflict.device_id_1.to_string())
        .bind(conflict.device_id_2.to_string())
        .bind(conflict.version_1)
        .bind(conflict.version_2)
        .bind(data_1)
        .bind(data_2)
        .bind(conflict.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn find_by_id(&self, conflict_id: Uuid) -> DomainResult<Option<SyncConflict>> {
        let row = query_as::<_, SyncConflictRow>("SELECT * FROM sync_conflicts WHERE id = ?")
            .bind(conflict_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;

        row.map(SyncConflict::try_from).transpose()
    }

    async fn mark_resolved_tx<'t>(
        &self,
        conflict_id: Uuid,
        resolution: ConflictResolution,
        resolved_by: Uuid,
        resolved_at: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let result = query(
            r#"
            UPDATE sync_conflicts
            SET resolution = ?, resolved_at = ?, resolved_by = ?
            WHERE id = ? AND resolution IS NULL
            "#,
        )
        .bind(resolution.as_str())
        .bind(resolved_at.to_rfc3339())
        .bind(resolved_by.to_string())
        .bind(conflict_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Database(DbError::NotFound(
                "sync_conflicts (unresolved)".to_string(),
                conflict_id.to_string(),
            )));
        }

        Ok(())
    }
}
