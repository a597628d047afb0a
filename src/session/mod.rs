pub mod coordinator;

// Re-exports
pub use coordinator::{SessionCoordinator, SessionState};
