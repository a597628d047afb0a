//! Multi-device synchronization core for a chat application.
//!
//! Devices connect over any transport that can carry the tagged messages in
//! [`transport::messages`], authenticate, register themselves and then
//! exchange sync events. Every event lands in a per-user append-only ledger;
//! concurrent edits of the same resource version are recorded as conflicts
//! and held back until a device picks a resolution.
//!
//! [`SyncEngine`] is the composition root: one per process, handing out a
//! [`session::SessionCoordinator`] per connection.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub mod auth;
pub mod domains;
pub mod errors;
pub mod session;
pub mod transport;

mod db_migration;
#[cfg(test)]
mod test_utils;

use crate::auth::jwt::{JwtVerifier, TokenVerifier};
use crate::domains::device::registry::DeviceRegistry;
use crate::domains::device::repository::{DeviceRepository, SqliteDeviceRepository};
use crate::domains::resource::repository::{ResourceRepository, SqliteResourceRepository};
use crate::domains::sync::processor::EventProcessor;
use crate::domains::sync::repository::{
    SqliteSyncConflictRepository, SqliteSyncEventRepository, SyncEventRepository,
};
use crate::domains::sync::resolver::ConflictResolver;
use crate::errors::{DbError, DomainResult};
use crate::session::SessionCoordinator;
use crate::transport::messages::ServerMessage;
use crate::transport::router::BroadcastRouter;

/// Process-wide wiring for the sync core.
///
/// Owns the pool, the repositories and the shared services; each inbound
/// connection gets its own [`SessionCoordinator`] from [`Self::open_session`].
pub struct SyncEngine {
    pool: SqlitePool,
    verifier: Arc<dyn TokenVerifier>,
    registry: Arc<DeviceRegistry>,
    router: Arc<BroadcastRouter>,
    processor: Arc<EventProcessor>,
    resolver: Arc<ConflictResolver>,
    devices: Arc<dyn DeviceRepository>,
    events: Arc<dyn SyncEventRepository>,
    resources: Arc<dyn ResourceRepository>,
}

impl SyncEngine {
    pub fn new(pool: SqlitePool, verifier: Arc<dyn TokenVerifier>) -> Self {
        let devices = Arc::new(SqliteDeviceRepository::new(pool.clone()));
        let events = Arc::new(SqliteSyncEventRepository::new(pool.clone()));
        let conflicts = Arc::new(SqliteSyncConflictRepository::new(pool.clone()));
        let resources = Arc::new(SqliteResourceRepository::new(pool.clone()));

        let registry = Arc::new(DeviceRegistry::new(devices.clone()));
        let router = Arc::new(BroadcastRouter::new(registry.clone()));
        let processor = Arc::new(EventProcessor::new(
            pool.clone(),
            events.clone(),
            conflicts.clone(),
            resources.clone(),
        ));
        let resolver = Arc::new(ConflictResolver::new(
            pool.clone(),
            conflicts,
            resources.clone(),
            router.clone(),
        ));

        Self {
            pool,
            verifier,
            registry,
            router,
            processor,
            resolver,
            devices,
            events,
            resources,
        }
    }

    /// Session for one new connection. `outbound` carries both direct
    /// replies and broadcasts fanned in from other devices, so the caller
    /// pumps a single channel per connection.
    pub fn open_session(
        &self,
        connection_id: Uuid,
        outbound: UnboundedSender<ServerMessage>,
    ) -> SessionCoordinator {
        SessionCoordinator::new(
            connection_id,
            outbound,
            self.verifier.clone(),
            self.registry.clone(),
            self.router.clone(),
            self.processor.clone(),
            self.resolver.clone(),
            self.devices.clone(),
            self.events.clone(),
            self.resources.clone(),
        )
    }

    /// Background task that flips silent devices inactive. Abort the handle
    /// on shutdown.
    pub fn spawn_liveness_sweeper(&self) -> JoinHandle<()> {
        self.registry.spawn_sweeper()
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }
}

/// Open (creating if necessary) the database, run pending migrations and
/// wire up an engine verifying tokens against `jwt_secret`.
pub async fn initialize(db_url: &str, jwt_secret: &str) -> DomainResult<SyncEngine> {
    let options = SqliteConnectOptions::from_str(db_url)
        .map_err(DbError::from)?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(DbError::from)?;

    db_migration::initialize_database(&pool).await?;
    log::info!("Sync engine initialized against {}", db_url);

    Ok(SyncEngine::new(
        pool,
        Arc::new(JwtVerifier::new(jwt_secret)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::transport::messages::ClientMessage;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn initialize_runs_migrations_and_opens_sessions() {
        let engine = initialize("sqlite::memory:", "engine-test-secret")
            .await
            .unwrap();

        let (applied,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(engine.pool())
            .await
            .unwrap();
        assert!(applied > 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = engine.open_session(Uuid::new_v4(), tx);
        assert_eq!(session.state(), SessionState::Connecting);

        let verifier = JwtVerifier::new("engine-test-secret");
        let token = verifier.generate_token(Uuid::new_v4(), 15).unwrap();
        session.handle(ClientMessage::Authenticate { token }).await;
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ServerMessage::Authenticated { .. }
        ));
    }
}
