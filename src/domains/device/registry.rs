use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domains::device::repository::DeviceRepository;
use crate::domains::device::types::{Device, RegisterDeviceDto};
use crate::errors::DomainResult;
use crate::transport::messages::ServerMessage;

/// How often a live connection refreshes its device's `last_seen`.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A device silent for longer than this is considered gone, whether or not a
/// disconnect was ever observed.
pub const DEVICE_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

/// How often the background sweep flips silent devices to inactive.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct ConnectionEntry {
    user_id: Uuid,
    device_id: Uuid,
    sender: UnboundedSender<ServerMessage>,
    heartbeat: JoinHandle<()>,
}

impl Drop for ConnectionEntry {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

/// Authoritative set of currently-connected devices, keyed by connection.
///
/// The in-memory table holds live connection handles; durable device rows
/// live behind [`DeviceRepository`]. Mutated concurrently by every
/// connection task, so all access goes through one `RwLock`.
pub struct DeviceRegistry {
    repo: Arc<dyn DeviceRepository>,
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
    heartbeat_interval: Duration,
    stale_after: Duration,
}

impl DeviceRegistry {
    pub fn new(repo: Arc<dyn DeviceRepository>) -> Self {
        Self::with_intervals(repo, HEARTBEAT_INTERVAL, DEVICE_STALE_AFTER)
    }

    /// Constructor with explicit timings, used by tests to shrink the
    /// heartbeat period.
    pub fn with_intervals(
        repo: Arc<dyn DeviceRepository>,
        heartbeat_interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            repo,
            connections: RwLock::new(HashMap::new()),
            heartbeat_interval,
            stale_after,
        }
    }

    /// Upsert the device row, remember the live connection and start its
    /// heartbeat timer.
    pub async fn register(
        &self,
        connection_id: Uuid,
        user_id: Uuid,
        dto: &RegisterDeviceDto,
        sender: UnboundedSender<ServerMessage>,
    ) -> DomainResult<Device> {
        let device = self.repo.upsert_registration(user_id, dto).await?;

        let heartbeat = self.spawn_heartbeat(user_id, device.device_id);
        let entry = ConnectionEntry {
            user_id,
            device_id: device.device_id,
            sender,
            heartbeat,
        };

        // A re-registration on the same connection replaces the old entry;
        // dropping it aborts the previous heartbeat.
        self.connections.write().await.insert(connection_id, entry);

        Ok(device)
    }

    /// Remove the connection, cancel its heartbeat and mark the device
    /// inactive. No-op when the connection was never registered.
    pub async fn unregister(&self, connection_id: Uuid) -> Option<(Uuid, Uuid)> {
        let entry = self.connections.write().await.remove(&connection_id)?;
        let (user_id, device_id) = (entry.user_id, entry.device_id);
        drop(entry);

        if let Err(e) = self.repo.mark_inactive(user_id, device_id).await {
            log::error!(
                "Failed to mark device {} inactive on unregister: {:?}",
                device_id,
                e
            );
        }

        Some((user_id, device_id))
    }

    /// Devices considered live: active and seen within the stale window.
    /// The recency filter covers devices whose disconnect was never
    /// observed (crashed client, dropped network).
    pub async fn active_devices(&self, user_id: Uuid) -> DomainResult<Vec<Device>> {
        let seen_after = Utc::now()
            - chrono::Duration::from_std(self.stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        self.repo.active_devices(user_id, seen_after).await
    }

    /// Live connection handles for a user, optionally excluding one device.
    pub async fn connections_for_user(
        &self,
        user_id: Uuid,
        exclude_device_id: Option<Uuid>,
    ) -> Vec<(Uuid, UnboundedSender<ServerMessage>)> {
        self.connections
            .read()
            .await
            .values()
            .filter(|entry| entry.user_id == user_id)
            .filter(|entry| exclude_device_id != Some(entry.device_id))
            .map(|entry| (entry.device_id, entry.sender.clone()))
            .collect()
    }

    /// Device registered on a given connection, if any.
    pub async fn device_for_connection(&self, connection_id: Uuid) -> Option<Uuid> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|entry| entry.device_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    fn spawn_heartbeat(&self, user_id: Uuid, device_id: Uuid) -> JoinHandle<()> {
        let repo = Arc::clone(&self.repo);
        let period = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                match repo.touch_last_seen(user_id, device_id, Utc::now()).await {
                    Ok(true) => {}
                    Ok(false) => {
                        log::debug!(
                            "Heartbeat for device {} found no active row, stopping",
                            device_id
                        );
                        break;
                    }
                    Err(e) => {
                        log::warn!("Heartbeat refresh failed for device {}: {:?}", device_id, e);
                        break;
                    }
                }
            }
        })
    }

    /// Background sweep marking silent devices inactive. Runs until the
    /// returned handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(registry.stale_after)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300));
                match registry.repo.sweep_stale(cutoff).await {
                    Ok(0) => {}
                    Ok(n) => log::info!("Liveness sweep marked {} device(s) inactive", n),
                    Err(e) => log::error!("Liveness sweep failed: {:?}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::device::repository::SqliteDeviceRepository;
    use crate::domains::device::types::DeviceType;
    use crate::test_utils::setup_pool;

    fn dto(device_id: Uuid) -> RegisterDeviceDto {
        RegisterDeviceDto {
            device_id,
            device_name: "Test phone".to_string(),
            device_type: DeviceType::Mobile,
            user_agent: Some("test-agent/1.0".to_string()),
        }
    }

    #[tokio::test]
    async fn register_then_unregister_round_trip() {
        let pool = setup_pool().await;
        let repo = Arc::new(SqliteDeviceRepository::new(pool));
        let registry = DeviceRegistry::new(repo.clone());

        let user_id = Uuid::new_v4();
        let connection_id = Uuid::new_v4();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let device = registry
            .register(connection_id, user_id, &dto(Uuid::new_v4()), tx)
            .await
            .unwrap();
        assert!(device.is_active);
        assert_eq!(registry.connection_count().await, 1);

        let removed = registry.unregister(connection_id).await;
        assert_eq!(removed, Some((user_id, device.device_id)));
        assert_eq!(registry.connection_count().await, 0);

        let stored = repo
            .find_by_device_id(user_id, device.device_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.is_active);

        // Double unregister is a no-op.
        assert_eq!(registry.unregister(connection_id).await, None);
    }

    #[tokio::test]
    async fn reregistration_issues_fresh_sync_token() {
        let pool = setup_pool().await;
        let repo = Arc::new(SqliteDeviceRepository::new(pool));
        let registry = DeviceRegistry::new(repo);

        let user_id = Uuid::new_v4();
        let device_id = Uuid::new_v4();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let first = registry
            .register(Uuid::new_v4(), user_id, &dto(device_id), tx.clone())
            .await
            .unwrap();
        let second = registry
            .register(Uuid::new_v4(), user_id, &dto(device_id), tx)
            .await
            .unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_ne!(first.sync_token, second.sync_token);
    }

    #[tokio::test]
    async fn active_devices_excludes_stale_rows() {
        let pool = setup_pool().await;
        let repo = Arc::new(SqliteDeviceRepository::new(pool.clone()));
        let registry = DeviceRegistry::new(repo.clone());

        let user_id = Uuid::new_v4();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let live = registry
            .register(Uuid::new_v4(), user_id, &dto(Uuid::new_v4()), tx)
            .await
            .unwrap();

        // A device that stopped heartbeating ten minutes ago but was never
        // cleanly unregistered.
        let stale_device_id = Uuid::new_v4();
        let stale_dto = dto(stale_device_id);
        repo.upsert_registration(user_id, &stale_dto).await.unwrap();
        sqlx::query("UPDATE devices SET last_seen = ? WHERE device_id = ?")
            .bind((Utc::now() - chrono::Duration::minutes(10)).to_rfc3339())
            .bind(stale_device_id.to_string())
            .execute(&pool)
            .await
            .unwrap();

        let active = registry.active_devices(user_id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].device_id, live.device_id);
    }

    #[tokio::test]
    async fn sweep_flips_silent_devices_inactive() {
        let pool = setup_pool().await;
        let repo = Arc::new(SqliteDeviceRepository::new(pool.clone()));

        let user_id = Uuid::new_v4();
        let device_id = Uuid::new_v4();
        repo.upsert_registration(user_id, &dto(device_id))
            .await
            .unwrap();
        sqlx::query("UPDATE devices SET last_seen = ? WHERE device_id = ?")
            .bind((Utc::now() - chrono::Duration::minutes(10)).to_rfc3339())
            .bind(device_id.to_string())
            .execute(&pool)
            .await
            .unwrap();

        let flipped = repo
            .sweep_stale(Utc::now() - chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(flipped, 1);

        let stored = repo
            .find_by_device_id(user_id, device_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_last_seen() {
        let pool = setup_pool().await;
        let repo = Arc::new(SqliteDeviceRepository::new(pool));
        let registry = DeviceRegistry::with_intervals(
            repo.clone(),
            Duration::from_millis(20),
            DEVICE_STALE_AFTER,
        );

        let user_id = Uuid::new_v4();
        let device_id = Uuid::new_v4();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let device = registry
            .register(Uuid::new_v4(), user_id, &dto(device_id), tx)
            .await
            .unwrap();
        let registered_at = device.last_seen;

        tokio::time::sleep(Duration::from_millis(80)).await;

        let stored = repo
            .find_by_device_id(user_id, device_id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.last_seen >= registered_at);
    }
}
