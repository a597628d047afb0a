pub mod processor;
pub mod repository;
pub mod resolver;
pub mod types;

// Re-exports
pub use processor::{EventProcessor, ProcessOutcome};
pub use repository::{
    SqliteSyncConflictRepository, SqliteSyncEventRepository, SyncConflictRepository,
    SyncEventRepository,
};
pub use resolver::ConflictResolver;
pub use types::{
    ConflictResolution, ResourceType, SyncConflict, SyncEvent, SyncEventInput, SyncEventType,
};
