use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, SqlitePool};
use uuid::Uuid;

use crate::domains::device::types::{Device, DeviceRow, RegisterDeviceDto};
use crate::errors::{DbError, DomainError, DomainResult};

/// Repository for device rows.
///
/// Devices are upserted on connect and flipped inactive on disconnect or by
/// the liveness sweep; rows are never deleted.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Upsert the device row for a registration, marking it active,
    /// refreshing `last_seen` and issuing a fresh sync token.
    async fn upsert_registration(
        &self,
        user_id: Uuid,
        dto: &RegisterDeviceDto,
    ) -> DomainResult<Device>;

    /// Refresh `last_seen` for a live device. Returns false when the row is
    /// gone or already inactive, which tells the heartbeat task to stop.
    async fn touch_last_seen(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        now: DateTime<Utc>,
    ) -> DomainResult<bool>;

    /// Mark a device inactive (disconnect observed).
    async fn mark_inactive(&self, user_id: Uuid, device_id: Uuid) -> DomainResult<()>;

    /// Devices that are active and have been seen since `seen_after`.
    async fn active_devices(
        &self,
        user_id: Uuid,
        seen_after: DateTime<Utc>,
    ) -> DomainResult<Vec<Device>>;

    /// Flip any device silent since `seen_before` to inactive, across all
    /// users. Returns the number of rows changed.
    async fn sweep_stale(&self, seen_before: DateTime<Utc>) -> DomainResult<u64>;

    /// Look up one device row.
    async fn find_by_device_id(
        &self,
        user_id: Uuid,
        device_id: Uuid,
    ) -> DomainResult<Option<Device>>;
}

/// SQLite implementation of the DeviceRepository
pub struct SqliteDeviceRepository {
    pool: SqlitePool,
}

impl SqliteDeviceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeviceRepository for SqliteDeviceRepository {
    async fn upsert_registration(
        &self,
        user_id: Uuid,
        dto: &RegisterDeviceDto,
    ) -> DomainResult<Device> {
        dto.validate()?;

        let now = Utc::now().to_rfc3339();
        let sync_token = Uuid::new_v4().to_string();

        query(
            r#"
            INSERT INTO devices (
                id, device_id, user_id, device_name, device_type, user_agent,
                last_seen, is_active, sync_token, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT (user_id, device_id) DO UPDATE SET
                device_name = excluded.device_name,
                device_type = excluded.device_type,
                user_agent = excluded.user_agent,
                last_seen = excluded.last_seen,
                is_active = 1,
                sync_token = excluded.sync_token,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(dto.device_id.to_string())
        .bind(user_id.to_string())
        .bind(&dto.device_name)
        .bind(dto.device_type.as_str())
        .bind(&dto.user_agent)
        .bind(&now)
        .bind(&sync_token)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.find_by_device_id(user_id, dto.device_id)
            .await?
            .ok_or_else(|| {
                DomainError::EntityNotFound("devices".to_string(), dto.device_id.to_string())
            })
    }

    async fn touch_last_seen(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        now: DateTime<Utc>,
    ) -> DomainResult<bool> {
        let result = query(
            "UPDATE devices SET last_seen = ? WHERE user_id = ? AND device_id = ? AND is_active = 1",
        )
        .bind(now.to_rfc3339())
        .bind(user_id.to_string())
        .bind(device_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_inactive(&self, user_id: Uuid, device_id: Uuid) -> DomainResult<()> {
        query(
            "UPDATE devices SET is_active = 0, updated_at = ? WHERE user_id = ? AND device_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(user_id.to_string())
        .bind(device_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn active_devices(
        &self,
        user_id: Uuid,
        seen_after: DateTime<Utc>,
    ) -> DomainResult<Vec<Device>> {
        let rows = query_as::<_, DeviceRow>(
            r#"
            SELECT * FROM devices
            WHERE user_id = ? AND is_active = 1 AND last_seen >= ?
            ORDER BY last_seen DESC
            "#,
        )
        .bind(user_id.to_string())
        .bind(seen_after.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(Device::try_from).collect()
    }

    async fn sweep_stale(&self, seen_before: DateTime<Utc>) -> DomainResult<u64> {
        let result = query(
            "UPDATE devices SET is_active = 0, updated_at = ? WHERE is_active = 1 AND last_seen < ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(seen_before.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }

    async fn find_by_device_id(
        &self,
        user_id: Uuid,
        device_id: Uuid,
    ) -> DomainResult<Option<Device>> {
        let row = query_as::<_, DeviceRow>(
            "SELECT * FROM devices WHERE user_id = ? AND device_id = ?",
        )
        .bind(user_id.to_string())
        .bind(device_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        row.map(Device::try_from).transpose()
    }
}
