use std::time::Duration;

use ash::vk;

use sxgpu_core::GpuResult;

use crate::device_info::{PhysicalDeviceInfo, QueueFamilyIndices};
use crate::queue::{QueueKind, SubmitInfo};

/// Instance-level side of a backend: enumerates candidate devices.
pub trait DeviceSource {
    /// Snapshot every physical device. When `surface` is given, queue family
    /// presentation support and surface capabilities are filled in.
    fn enumerate_devices(&self, surface: Option<vk::SurfaceKHR>) -> GpuResult<Vec<PhysicalDeviceInfo>>;
}

/// Where a memory object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryClass {
    GpuOnly,
    CpuVisible,
}

#[derive(Debug, Clone)]
pub struct RawBufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    pub handle: vk::Buffer,
    pub size: u64,
    /// Set when created with SHADER_DEVICE_ADDRESS usage
    pub device_address: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RawImageDesc<'a> {
    pub name: &'a str,
    pub extent: vk::Extent2D,
    pub layers: u32,
    pub mip_levels: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub cube: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub handle: vk::Image,
    /// Covers every layer and mip
    pub default_view: vk::ImageView,
    /// One 2D view per layer; empty for single-layer images
    pub layer_views: Vec<vk::ImageView>,
}

/// Native objects behind one `CommandResources` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCommandSlot {
    pub pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    /// None when the queue family has no timestamp support
    pub query_pool: Option<vk::QueryPool>,
    pub staging: RawBuffer,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSlotDesc {
    pub staging_size: u64,
    /// Number of timestamp queries (two per interval)
    pub query_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

/// Bindings of the bindless descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindlessBinding {
    StorageBuffer = 0,
    SampledImage = 1,
    StorageImage = 2,
    AccelerationStructure = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer { buffer: vk::Buffer, range: u64 },
    Image { view: vk::ImageView, layout: vk::ImageLayout },
    AccelerationStructure(vk::AccelerationStructureKHR),
}

/// One bindless table entry: `slot` in `binding` now refers to `resource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: BindlessBinding,
    pub slot: u32,
    pub resource: DescriptorResource,
}

/// Allocator statistics reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub allocation_count: usize,
    /// Bytes held by live allocations
    pub allocated_bytes: u64,
    /// Bytes reserved from the driver, including unused space in blocks
    pub reserved_bytes: u64,
    /// Memory the device may use; zero when unknown
    pub budget_bytes: u64,
}

impl MemoryStats {
    /// Reserved memory as a fraction of the budget.
    pub fn budget_usage(&self) -> f64 {
        if self.budget_bytes == 0 {
            return 0.0;
        }
        self.reserved_bytes as f64 / self.budget_bytes as f64
    }

    /// Fraction of reserved memory no allocation uses.
    pub fn fragmentation(&self) -> f64 {
        if self.reserved_bytes == 0 {
            return 0.0;
        }
        1.0 - self.allocated_bytes.min(self.reserved_bytes) as f64 / self.reserved_bytes as f64
    }
}

/// Device-level operations the allocator and queue manager are built on.
///
/// Implementations own the native device and memory allocator. All methods
/// take `&self`; implementations synchronize internally where the native API
/// requires external synchronization.
pub trait GpuBackend: Send + Sync {
    fn device_info(&self) -> &PhysicalDeviceInfo;
    fn queue_families(&self) -> QueueFamilyIndices;
    /// Raw ash device, for callers that record native commands.
    fn ash_device(&self) -> Option<&ash::Device> {
        None
    }

    // ── Memory objects ──────────────────────────────────────
    fn memory_stats(&self) -> MemoryStats;
    fn create_buffer(&self, desc: &RawBufferDesc<'_>) -> GpuResult<RawBuffer>;
    fn destroy_buffer(&self, buffer: RawBuffer);
    /// Copy `data` into a CPU-visible buffer at `offset`.
    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> GpuResult<()>;
    fn create_image(&self, desc: &RawImageDesc<'_>) -> GpuResult<RawImage>;
    fn destroy_image(&self, image: RawImage);
    fn supports_acceleration_structures(&self) -> bool;
    fn create_acceleration_structure(
        &self,
        buffer: vk::Buffer,
        size: u64,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> GpuResult<vk::AccelerationStructureKHR>;
    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR);
    fn write_descriptor(&self, write: &DescriptorWrite);

    // ── Command slots ───────────────────────────────────────
    fn create_command_slot(&self, queue: QueueKind, desc: &CommandSlotDesc) -> GpuResult<RawCommandSlot>;
    fn destroy_command_slot(&self, slot: RawCommandSlot);
    fn wait_fence(&self, fence: vk::Fence, timeout: Duration) -> GpuResult<FenceStatus>;
    fn fence_signaled(&self, fence: vk::Fence) -> GpuResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> GpuResult<()>;
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GpuResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GpuResult<()>;
    fn reset_queries(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, count: u32);
    fn write_timestamp(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32);
    /// Read `count` timestamps; None while results are not yet available.
    fn read_timestamps(&self, pool: vk::QueryPool, count: u32) -> GpuResult<Option<Vec<u64>>>;
    fn submit(
        &self,
        queue: QueueKind,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
        info: &SubmitInfo,
    ) -> GpuResult<()>;
    fn wait_idle(&self) -> GpuResult<()>;
}
