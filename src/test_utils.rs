//! Shared helpers for repository and service tests.

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::db_migration;
use crate::domains::device::repository::SqliteDeviceRepository;
use crate::domains::resource::repository::SqliteResourceRepository;
use crate::domains::sync::processor::EventProcessor;
use crate::domains::sync::repository::{SqliteSyncConflictRepository, SqliteSyncEventRepository};

/// Fresh in-memory database with all migrations applied.
pub(crate) async fn setup_pool() -> SqlitePool {
    let _ = env_logger::builder().is_test(true).try_init();

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    db_migration::initialize_database(&pool)
        .await
        .expect("migrations");
    pool
}

pub(crate) fn build_processor(pool: &SqlitePool) -> EventProcessor {
    EventProcessor::new(
        pool.clone(),
        Arc::new(SqliteSyncEventRepository::new(pool.clone())),
        Arc::new(SqliteSyncConflictRepository::new(pool.clone())),
        Arc::new(SqliteResourceRepository::new(pool.clone())),
    )
}

pub(crate) fn device_repo(pool: &SqlitePool) -> Arc<SqliteDeviceRepository> {
    Arc::new(SqliteDeviceRepository::new(pool.clone()))
}
