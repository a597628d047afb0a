pub mod messages;
pub mod router;

// Re-exports
pub use messages::{AckStatus, BroadcastData, ClientMessage, ServerMessage};
pub use router::BroadcastRouter;
