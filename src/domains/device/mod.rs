pub mod registry;
pub mod repository;
pub mod types;

// Re-exports
pub use registry::{DeviceRegistry, DEVICE_STALE_AFTER, HEARTBEAT_INTERVAL, SWEEP_INTERVAL};
pub use repository::{DeviceRepository, SqliteDeviceRepository};
pub use types::{Device, DeviceType, RegisterDeviceDto};
