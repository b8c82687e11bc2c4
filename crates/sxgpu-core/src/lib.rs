pub mod config;
pub mod error;
pub mod handle_registry;
pub mod rid_pool;

pub use config::GpuConfig;
pub use error::{ErrorCategory, GpuError, GpuResult};
pub use rid_pool::{ResourceIdPool, SlotKind};
