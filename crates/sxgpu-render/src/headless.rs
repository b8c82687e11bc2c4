//! GPU-less backend for tests and dry runs.
//!
//! Fabricates native handles, keeps CPU copies of CPU-visible buffers, records
//! descriptor writes and submissions, and simulates fences. Fences either
//! signal at submit (`FenceMode::Immediate`) or only when the test calls
//! [`HeadlessDevice::signal_fence`] (`FenceMode::Manual`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ash::vk::{self, Handle};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use sxgpu_core::{GpuError, GpuResult};

use crate::backend::{
    CommandSlotDesc, DescriptorWrite, DeviceSource, FenceStatus, GpuBackend, MemoryClass,
    MemoryStats, RawBuffer, RawBufferDesc, RawCommandSlot, RawImage, RawImageDesc,
};
use crate::device_info::{
    DeviceFeatures, DeviceLimits, MemoryHeapInfo, MemoryTypeInfo, PhysicalDeviceInfo,
    QueueFamilyIndices, QueueFamilyInfo, SurfaceSupport,
};
use crate::queue::{QueueKind, SubmitInfo};

/// Build a plausible device snapshot with one family per entry of `families`.
pub fn synthetic_device(
    name: &str,
    device_type: vk::PhysicalDeviceType,
    families: &[vk::QueueFlags],
) -> PhysicalDeviceInfo {
    PhysicalDeviceInfo {
        index: 0,
        raw: vk::PhysicalDevice::null(),
        name: name.to_string(),
        vendor_id: 0x10DE,
        device_id: 0x2000,
        device_type,
        api_version: vk::make_api_version(0, 1, 3, 0),
        driver_version: 1,
        limits: DeviceLimits {
            min_storage_buffer_offset_alignment: 64,
            ..DeviceLimits::default()
        },
        features: DeviceFeatures {
            descriptor_indexing: true,
            buffer_device_address: true,
            timeline_semaphore: true,
            dynamic_rendering: true,
            synchronization2: true,
            sampler_anisotropy: true,
            acceleration_structure: false,
        },
        memory_types: vec![
            MemoryTypeInfo {
                flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            },
            MemoryTypeInfo {
                flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                heap_index: 1,
            },
        ],
        memory_heaps: vec![
            MemoryHeapInfo {
                size: 8 << 30,
                device_local: true,
            },
            MemoryHeapInfo {
                size: 16 << 30,
                device_local: false,
            },
        ],
        queue_families: families
            .iter()
            .enumerate()
            .map(|(i, flags)| QueueFamilyInfo {
                index: i as u32,
                flags: *flags,
                queue_count: 1,
                timestamp_valid_bits: 64,
                present: flags.contains(vk::QueueFlags::GRAPHICS),
            })
            .collect(),
        surface: None,
        extensions: vec!["VK_KHR_swapchain".to_string()],
        depth_format: Some(vk::Format::D32_SFLOAT),
    }
}

/// A device with a single graphics+compute+transfer family.
pub fn default_device() -> PhysicalDeviceInfo {
    synthetic_device(
        "Headless GPU",
        vk::PhysicalDeviceType::DISCRETE_GPU,
        &[vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER],
    )
}

// ── Instance ────────────────────────────────────────────────

/// Fixed list of synthetic physical devices.
pub struct HeadlessInstance {
    devices: Vec<PhysicalDeviceInfo>,
}

impl HeadlessInstance {
    pub fn new(devices: Vec<PhysicalDeviceInfo>) -> Self {
        Self { devices }
    }
}

impl DeviceSource for HeadlessInstance {
    /// Presentation is only reported when a surface is passed; graphics
    /// families are assumed able to present to it.
    fn enumerate_devices(&self, surface: Option<vk::SurfaceKHR>) -> GpuResult<Vec<PhysicalDeviceInfo>> {
        Ok(self
            .devices
            .iter()
            .enumerate()
            .map(|(index, device)| {
                let mut info = device.clone();
                info.index = index;
                if info.raw == vk::PhysicalDevice::null() {
                    info.raw = vk::PhysicalDevice::from_raw(index as u64 + 1);
                }
                match surface {
                    Some(_) => {
                        if info.surface.is_none() && info.queue_families.iter().any(|f| f.present) {
                            info.surface = Some(SurfaceSupport {
                                capabilities: vk::SurfaceCapabilitiesKHR::default(),
                                formats: vec![vk::SurfaceFormatKHR {
                                    format: vk::Format::B8G8R8A8_SRGB,
                                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                                }],
                                present_modes: vec![vk::PresentModeKHR::FIFO],
                            });
                        }
                    }
                    None => {
                        for family in &mut info.queue_families {
                            family.present = false;
                        }
                        info.surface = None;
                    }
                }
                info
            })
            .collect())
    }
}

// ── Device ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceMode {
    /// Work completes the moment it is submitted
    Immediate,
    /// Fences signal only through `signal_fence`/`signal_all`/`wait_idle`
    Manual,
}

#[derive(Debug, Clone)]
pub struct HeadlessOptions {
    pub fence_mode: FenceMode,
    /// Total bytes of buffer and image memory before allocations fail
    pub memory_budget: Option<u64>,
    pub acceleration_structures: bool,
    /// Timestamp ticks between consecutive timestamp writes
    pub timestamp_tick: u64,
}

impl Default for HeadlessOptions {
    fn default() -> Self {
        Self {
            fence_mode: FenceMode::Immediate,
            memory_budget: None,
            acceleration_structures: true,
            timestamp_tick: 1_000,
        }
    }
}

struct HeadlessBuffer {
    name: String,
    size: u64,
    memory: MemoryClass,
    /// CPU copy, only for CPU-visible buffers
    data: Vec<u8>,
}

struct HeadlessImage {
    name: String,
    bytes: u64,
    views: Vec<vk::ImageView>,
}

/// One recorded `submit` call.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub queue: QueueKind,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub wait_semaphores: usize,
    pub signal_semaphores: usize,
}

pub struct HeadlessDevice {
    info: PhysicalDeviceInfo,
    families: QueueFamilyIndices,
    options: HeadlessOptions,
    next_handle: AtomicU64,
    clock: AtomicU64,
    allocated: AtomicU64,

    // ── Objects ─────────────────────────────────────────────
    buffers: DashMap<vk::Buffer, HeadlessBuffer>,
    images: DashMap<vk::Image, HeadlessImage>,
    acceleration_structures: DashMap<vk::AccelerationStructureKHR, vk::Buffer>,
    recording: DashMap<vk::CommandBuffer, bool>,
    /// `None` until written since the last reset
    query_pools: DashMap<vk::QueryPool, Vec<Option<u64>>>,
    fences: Mutex<HashMap<vk::Fence, bool>>,
    fence_signal: Condvar,

    // ── Logs ────────────────────────────────────────────────
    submissions: Mutex<Vec<SubmissionRecord>>,
    descriptor_writes: Mutex<Vec<DescriptorWrite>>,
    destroyed_buffers: AtomicU64,
    destroyed_images: AtomicU64,
}

impl HeadlessDevice {
    pub fn new(info: PhysicalDeviceInfo, options: HeadlessOptions) -> GpuResult<Self> {
        let families = QueueFamilyIndices::resolve(&info, false).ok_or_else(|| {
            GpuError::NoSuitableDevice(format!("'{}' has no graphics queue family", info.name))
        })?;
        let mut info = info;
        info.features.acceleration_structure = options.acceleration_structures;
        debug!("headless device '{}' ready ({:?})", info.name, options.fence_mode);
        Ok(Self {
            info,
            families,
            options,
            next_handle: AtomicU64::new(1),
            clock: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            buffers: DashMap::new(),
            images: DashMap::new(),
            acceleration_structures: DashMap::new(),
            recording: DashMap::new(),
            query_pools: DashMap::new(),
            fences: Mutex::new(HashMap::new()),
            fence_signal: Condvar::new(),
            submissions: Mutex::new(Vec::new()),
            descriptor_writes: Mutex::new(Vec::new()),
            destroyed_buffers: AtomicU64::new(0),
            destroyed_images: AtomicU64::new(0),
        })
    }

    /// Default device with default options.
    pub fn simple() -> Self {
        Self::with_options(HeadlessOptions::default())
    }

    pub fn with_options(options: HeadlessOptions) -> Self {
        match Self::new(default_device(), options) {
            Ok(device) => device,
            Err(e) => unreachable!("default headless device always has a graphics family: {}", e),
        }
    }

    fn next<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn reserve_memory(&self, name: &str, bytes: u64) -> GpuResult<()> {
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            let next = current + bytes;
            if let Some(budget) = self.options.memory_budget {
                if next > budget {
                    return Err(GpuError::AllocationFailure(format!(
                        "'{}' needs {} bytes, {} of {} in use",
                        name, bytes, current, budget
                    )));
                }
            }
            match self.allocated.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    // ── Test controls ───────────────────────────────────────

    pub fn signal_fence(&self, fence: vk::Fence) {
        let mut fences = self.fences.lock();
        if let Some(signaled) = fences.get_mut(&fence) {
            *signaled = true;
        }
        self.fence_signal.notify_all();
    }

    pub fn signal_all(&self) {
        let mut fences = self.fences.lock();
        for signaled in fences.values_mut() {
            *signaled = true;
        }
        self.fence_signal.notify_all();
    }

    /// Fences of submissions that have not completed yet.
    pub fn pending_fences(&self) -> Vec<vk::Fence> {
        let fences = self.fences.lock();
        self.submissions
            .lock()
            .iter()
            .map(|s| s.fence)
            .filter(|f| fences.get(f) == Some(&false))
            .collect()
    }

    // ── Introspection ───────────────────────────────────────

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.submissions.lock().clone()
    }

    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.descriptor_writes.lock().clone()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    pub fn live_acceleration_structures(&self) -> usize {
        self.acceleration_structures.len()
    }

    pub fn destroyed_buffers(&self) -> u64 {
        self.destroyed_buffers.load(Ordering::Relaxed)
    }

    pub fn destroyed_images(&self) -> u64 {
        self.destroyed_images.load(Ordering::Relaxed)
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn buffer_exists(&self, buffer: vk::Buffer) -> bool {
        self.buffers.contains_key(&buffer)
    }

    pub fn buffer_name(&self, buffer: vk::Buffer) -> Option<String> {
        self.buffers.get(&buffer).map(|b| b.name.clone())
    }

    pub fn image_name(&self, image: vk::Image) -> Option<String> {
        self.images.get(&image).map(|i| i.name.clone())
    }

    /// CPU copy of a CPU-visible buffer.
    pub fn read_buffer(&self, buffer: vk::Buffer, offset: u64, len: usize) -> Option<Vec<u8>> {
        let entry = self.buffers.get(&buffer)?;
        let start = offset as usize;
        entry.data.get(start..start + len).map(|s| s.to_vec())
    }
}

impl GpuBackend for HeadlessDevice {
    fn device_info(&self) -> &PhysicalDeviceInfo {
        &self.info
    }

    fn queue_families(&self) -> QueueFamilyIndices {
        self.families
    }

    /// No block allocator here: reserved equals allocated. The budget is the
    /// simulated one when set, otherwise the device-local heaps.
    fn memory_stats(&self) -> MemoryStats {
        let allocated = self.allocated.load(Ordering::Relaxed);
        MemoryStats {
            allocation_count: self.buffers.len() + self.images.len(),
            allocated_bytes: allocated,
            reserved_bytes: allocated,
            budget_bytes: self
                .options
                .memory_budget
                .unwrap_or_else(|| self.info.device_local_memory()),
        }
    }

    fn create_buffer(&self, desc: &RawBufferDesc<'_>) -> GpuResult<RawBuffer> {
        self.reserve_memory(desc.name, desc.size)?;
        let handle: vk::Buffer = self.next();
        let data = match desc.memory {
            MemoryClass::CpuVisible => vec![0u8; desc.size as usize],
            MemoryClass::GpuOnly => Vec::new(),
        };
        self.buffers.insert(
            handle,
            HeadlessBuffer {
                name: desc.name.to_string(),
                size: desc.size,
                memory: desc.memory,
                data,
            },
        );
        let device_address = desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then(|| 0x1_0000_0000 + handle.as_raw() * 0x1_0000);
        trace!("headless: buffer {:?} '{}' ({} bytes)", handle, desc.name, desc.size);
        Ok(RawBuffer {
            handle,
            size: desc.size,
            device_address,
        })
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        if let Some((_, b)) = self.buffers.remove(&buffer.handle) {
            self.allocated.fetch_sub(b.size, Ordering::AcqRel);
            self.destroyed_buffers.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        let mut entry = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::InvalidArgument(format!("unknown buffer {:?}", buffer)))?;
        if entry.memory != MemoryClass::CpuVisible {
            return Err(GpuError::InvalidArgument(format!("buffer '{}' is not mapped", entry.name)));
        }
        let start = offset as usize;
        let dst = entry
            .data
            .get_mut(start..start + data.len())
            .ok_or_else(|| GpuError::InvalidArgument("write out of bounds".into()))?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn create_image(&self, desc: &RawImageDesc<'_>) -> GpuResult<RawImage> {
        // 4 bytes per texel is close enough for budget tests.
        let bytes = u64::from(desc.extent.width) * u64::from(desc.extent.height) * u64::from(desc.layers) * 4;
        self.reserve_memory(desc.name, bytes)?;
        let handle: vk::Image = self.next();
        let default_view: vk::ImageView = self.next();
        let layer_views: Vec<vk::ImageView> = if desc.layers > 1 {
            (0..desc.layers).map(|_| self.next()).collect()
        } else {
            Vec::new()
        };
        let mut views = vec![default_view];
        views.extend(&layer_views);
        self.images.insert(
            handle,
            HeadlessImage {
                name: desc.name.to_string(),
                bytes,
                views,
            },
        );
        Ok(RawImage {
            handle,
            default_view,
            layer_views,
        })
    }

    fn destroy_image(&self, image: RawImage) {
        if let Some((_, i)) = self.images.remove(&image.handle) {
            trace!("headless: destroy image '{}' ({} views)", i.name, i.views.len());
            self.allocated.fetch_sub(i.bytes, Ordering::AcqRel);
            self.destroyed_images.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn supports_acceleration_structures(&self) -> bool {
        self.options.acceleration_structures
    }

    fn create_acceleration_structure(
        &self,
        buffer: vk::Buffer,
        _size: u64,
        _ty: vk::AccelerationStructureTypeKHR,
    ) -> GpuResult<vk::AccelerationStructureKHR> {
        if !self.options.acceleration_structures {
            return Err(GpuError::Unsupported("acceleration structures disabled".into()));
        }
        let handle: vk::AccelerationStructureKHR = self.next();
        self.acceleration_structures.insert(handle, buffer);
        Ok(handle)
    }

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        self.acceleration_structures.remove(&handle);
    }

    fn write_descriptor(&self, write: &DescriptorWrite) {
        self.descriptor_writes.lock().push(*write);
    }

    fn create_command_slot(&self, queue: QueueKind, desc: &CommandSlotDesc) -> GpuResult<RawCommandSlot> {
        let staging = self.create_buffer(&RawBufferDesc {
            name: &format!("{} staging", queue),
            size: desc.staging_size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory: MemoryClass::CpuVisible,
        })?;
        let command_buffer: vk::CommandBuffer = self.next();
        let fence: vk::Fence = self.next();
        // Created signaled, as a real backend does.
        self.fences.lock().insert(fence, true);
        self.recording.insert(command_buffer, false);
        let query_pool = if desc.query_count > 0 {
            let pool: vk::QueryPool = self.next();
            self.query_pools.insert(pool, vec![None; desc.query_count as usize]);
            Some(pool)
        } else {
            None
        };
        Ok(RawCommandSlot {
            pool: self.next(),
            command_buffer,
            fence,
            query_pool,
            staging,
        })
    }

    fn destroy_command_slot(&self, slot: RawCommandSlot) {
        self.destroy_buffer(slot.staging);
        self.fences.lock().remove(&slot.fence);
        self.recording.remove(&slot.command_buffer);
        if let Some(pool) = slot.query_pool {
            self.query_pools.remove(&pool);
        }
    }

    fn wait_fence(&self, fence: vk::Fence, timeout: Duration) -> GpuResult<FenceStatus> {
        let deadline = Instant::now() + timeout;
        let mut fences = self.fences.lock();
        loop {
            match fences.get(&fence) {
                Some(true) => return Ok(FenceStatus::Signaled),
                Some(false) => {}
                None => return Err(GpuError::InvalidArgument(format!("unknown fence {:?}", fence))),
            }
            if self.fence_signal.wait_until(&mut fences, deadline).timed_out() {
                return Ok(match fences.get(&fence) {
                    Some(true) => FenceStatus::Signaled,
                    _ => FenceStatus::TimedOut,
                });
            }
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> GpuResult<bool> {
        self.fences
            .lock()
            .get(&fence)
            .copied()
            .ok_or_else(|| GpuError::InvalidArgument(format!("unknown fence {:?}", fence)))
    }

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        match self.fences.lock().get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(GpuError::InvalidArgument(format!("unknown fence {:?}", fence))),
        }
    }

    fn reset_command_pool(&self, _pool: vk::CommandPool) -> GpuResult<()> {
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GpuResult<()> {
        let mut state = self
            .recording
            .get_mut(&command_buffer)
            .ok_or_else(|| GpuError::InvalidArgument(format!("unknown command buffer {:?}", command_buffer)))?;
        if *state {
            return Err(GpuError::InvalidState("command buffer already recording".into()));
        }
        *state = true;
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GpuResult<()> {
        let mut state = self
            .recording
            .get_mut(&command_buffer)
            .ok_or_else(|| GpuError::InvalidArgument(format!("unknown command buffer {:?}", command_buffer)))?;
        if !*state {
            return Err(GpuError::InvalidState("command buffer not recording".into()));
        }
        *state = false;
        Ok(())
    }

    fn reset_queries(&self, _command_buffer: vk::CommandBuffer, pool: vk::QueryPool, count: u32) {
        if let Some(mut values) = self.query_pools.get_mut(&pool) {
            let n = (count as usize).min(values.len());
            values[..n].fill(None);
        }
    }

    fn write_timestamp(&self, _command_buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
        let now = self.clock.fetch_add(self.options.timestamp_tick, Ordering::Relaxed) + self.options.timestamp_tick;
        if let Some(mut values) = self.query_pools.get_mut(&pool) {
            if let Some(slot) = values.get_mut(query as usize) {
                *slot = Some(now);
            }
        }
    }

    fn read_timestamps(&self, pool: vk::QueryPool, count: u32) -> GpuResult<Option<Vec<u64>>> {
        let values = self
            .query_pools
            .get(&pool)
            .ok_or_else(|| GpuError::InvalidArgument(format!("unknown query pool {:?}", pool)))?;
        // Any query not written since its reset is not ready, as on a real device.
        Ok(values
            .get(..count as usize)
            .and_then(|v| v.iter().copied().collect::<Option<Vec<u64>>>()))
    }

    fn submit(
        &self,
        queue: QueueKind,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
        info: &SubmitInfo,
    ) -> GpuResult<()> {
        {
            let mut fences = self.fences.lock();
            match fences.get_mut(&fence) {
                Some(signaled) if *signaled => {
                    return Err(GpuError::InvalidState("submit with a signaled fence".into()))
                }
                Some(signaled) => {
                    if self.options.fence_mode == FenceMode::Immediate {
                        *signaled = true;
                    }
                }
                None => return Err(GpuError::InvalidArgument(format!("unknown fence {:?}", fence))),
            }
        }
        self.fence_signal.notify_all();
        self.submissions.lock().push(SubmissionRecord {
            queue,
            command_buffer,
            fence,
            wait_semaphores: info.wait_semaphores.len(),
            signal_semaphores: info.signal_semaphores.len(),
        });
        trace!("headless: {} submit {:?}", queue, command_buffer);
        Ok(())
    }

    fn wait_idle(&self) -> GpuResult<()> {
        self.signal_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_limits_allocations() {
        let device = HeadlessDevice::with_options(HeadlessOptions {
            memory_budget: Some(1024),
            ..Default::default()
        });
        let desc = RawBufferDesc {
            name: "a",
            size: 1000,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            memory: MemoryClass::GpuOnly,
        };
        let a = device.create_buffer(&desc).unwrap();
        assert!(matches!(device.create_buffer(&desc), Err(GpuError::AllocationFailure(_))));
        device.destroy_buffer(a);
        assert_eq!(device.allocated_bytes(), 0);
        assert!(device.create_buffer(&desc).is_ok());
    }

    #[test]
    fn manual_fence_times_out_then_signals() {
        let device = HeadlessDevice::with_options(HeadlessOptions {
            fence_mode: FenceMode::Manual,
            ..Default::default()
        });
        let slot = device
            .create_command_slot(QueueKind::Graphics, &CommandSlotDesc { staging_size: 64, query_count: 0 })
            .unwrap();
        device.reset_fence(slot.fence).unwrap();
        device.begin_command_buffer(slot.command_buffer).unwrap();
        device.end_command_buffer(slot.command_buffer).unwrap();
        device
            .submit(QueueKind::Graphics, slot.command_buffer, slot.fence, &SubmitInfo::default())
            .unwrap();
        assert_eq!(
            device.wait_fence(slot.fence, Duration::from_millis(10)).unwrap(),
            FenceStatus::TimedOut
        );
        assert_eq!(device.pending_fences(), vec![slot.fence]);
        device.signal_fence(slot.fence);
        assert_eq!(
            device.wait_fence(slot.fence, Duration::from_millis(10)).unwrap(),
            FenceStatus::Signaled
        );
    }

    #[test]
    fn enumeration_without_surface_has_no_present() {
        let instance = HeadlessInstance::new(vec![default_device(), default_device()]);
        let devices = instance.enumerate_devices(None).unwrap();
        assert_eq!(devices[1].index, 1);
        assert!(devices.iter().all(|d| d.queue_families.iter().all(|f| !f.present)));

        let devices = instance
            .enumerate_devices(Some(vk::SurfaceKHR::from_raw(9)))
            .unwrap();
        assert!(devices[0].surface.is_some());
        assert!(devices[0].queue_families[0].present);
    }
}
