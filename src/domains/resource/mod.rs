pub mod repository;
pub mod types;

// Re-exports
pub use repository::{ResourceRepository, SqliteResourceRepository};
pub use types::{Conversation, Message, UserSettings};
