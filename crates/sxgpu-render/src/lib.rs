pub mod allocator;
pub mod backend;
pub mod capability;
pub mod command;
pub mod context;
pub mod deferred;
pub mod device_info;
pub mod device_selector;
pub mod headless;
pub mod queue;
pub mod resource;
pub mod vulkan;

pub use allocator::{BufferUsage, ImageDesc, ImageUsage, MemoryClass, ResourceAllocator};
pub use backend::{DeviceSource, GpuBackend, MemoryStats};
pub use context::GpuContext;
pub use deferred::{DeferredDestructionQueue, DeferredFreeSender};
pub use device_info::{PhysicalDeviceInfo, QueueFamilyIndices};
pub use device_selector::DeviceSelector;
pub use queue::{QueueKind, QueueManager, SlotState, SubmitInfo};
pub use resource::{AccelerationStructure, Buffer, Image};

pub use sxgpu_core::{ErrorCategory, GpuConfig, GpuError, GpuResult, SlotKind};
