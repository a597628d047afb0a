pub(crate) mod core;

pub mod device;
pub mod resource;
pub mod sync;
