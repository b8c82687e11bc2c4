use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use sxgpu_core::handle_registry::{LiveHandle, LiveHandleRegistry};
use sxgpu_core::{GpuConfig, GpuResult, ResourceIdPool, SlotKind};

use crate::allocator::{BufferUsage, ImageDesc, MemoryClass, ResourceAllocator};
use crate::backend::{GpuBackend, MemoryStats};
use crate::command::StagingRange;
use crate::deferred::DeferredDestructionQueue;
use crate::queue::{QueueKind, QueueManager, Recorder, SlotState, SubmitInfo};
use crate::resource::{AccelerationStructure, Buffer, Image, ResourceHandle};

/// Everything a renderer needs from the GPU, owned in one place and passed
/// explicitly. Owns the frame counter; `next_frame` is the frame boundary.
pub struct GpuContext {
    config: GpuConfig,
    queues: QueueManager,
    allocator: ResourceAllocator,
    deferred: DeferredDestructionQueue,
    slots: Arc<Mutex<ResourceIdPool>>,
    registry: Option<Arc<LiveHandleRegistry>>,
    backend: Arc<dyn GpuBackend>,
}

impl GpuContext {
    pub fn new(backend: Arc<dyn GpuBackend>, config: GpuConfig) -> GpuResult<Self> {
        config.validate()?;
        let slots = Arc::new(Mutex::new(ResourceIdPool::from_config(&config.bindless)));
        let registry = config
            .device
            .track_live_handles
            .then(|| Arc::new(LiveHandleRegistry::new()));
        let deferred = DeferredDestructionQueue::new(config.frames.frames_in_flight);
        let allocator = ResourceAllocator::new(
            backend.clone(),
            slots.clone(),
            deferred.sender(),
            registry.clone(),
            config.memory.warning_threshold,
        );
        let queues = QueueManager::new(backend.clone(), &config.frames)?;

        info!(
            "GPU context on '{}': {} frames in flight, bindless {}/{}/{}",
            backend.device_info().name,
            config.frames.frames_in_flight,
            config.bindless.buffer_capacity,
            config.bindless.image_capacity,
            config.bindless.acceleration_structure_capacity
        );

        Ok(Self {
            config,
            queues,
            allocator,
            deferred,
            slots,
            registry,
            backend,
        })
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    /// Current frame number, starting at 0.
    pub fn frame(&self) -> u64 {
        self.deferred.current_frame()
    }

    // ── Resources ───────────────────────────────────────────

    pub fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        memory: MemoryClass,
        name: &str,
    ) -> GpuResult<Buffer> {
        self.allocator.create_buffer(size, usage, memory, name)
    }

    pub fn create_buffers(
        &self,
        sizes: &[u64],
        usage: BufferUsage,
        memory: MemoryClass,
        name: &str,
    ) -> GpuResult<Vec<Buffer>> {
        self.allocator.create_buffers(sizes, usage, memory, name)
    }

    pub fn create_image(&self, desc: &ImageDesc) -> GpuResult<Image> {
        self.allocator.create_image(desc)
    }

    pub fn create_acceleration_structure(
        &self,
        size: u64,
        ty: vk::AccelerationStructureTypeKHR,
        name: &str,
    ) -> GpuResult<AccelerationStructure> {
        self.allocator.create_acceleration_structure(size, ty, name)
    }

    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        self.allocator.write_buffer(buffer, offset, data)
    }

    /// Release one reference. The native object is destroyed through the
    /// deferred queue once the last reference is gone and the frames that
    /// could use it have retired.
    pub fn destroy(&self, handle: impl Into<ResourceHandle>) {
        let handle = handle.into();
        let remaining = handle.ref_count() - 1;
        debug!(
            "destroy {} '{}' at frame {} ({} other reference(s))",
            handle.kind(),
            handle.name(),
            self.frame(),
            remaining
        );
        drop(handle);
    }

    /// Queue an arbitrary cleanup behind the frames currently in flight.
    pub fn submit_resource_free(&self, label: &str, action: impl FnOnce() + Send + 'static) {
        self.deferred.submit_resource_free(label, action);
    }

    pub fn pending_frees(&self) -> usize {
        self.deferred.pending_len()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.allocator.memory_stats()
    }

    /// (in use, capacity) for a bindless table.
    pub fn slot_usage(&self, kind: SlotKind) -> (u32, u32) {
        let slots = self.slots.lock();
        (slots.in_use(kind), slots.capacity(kind))
    }

    pub fn live_handles(&self) -> Vec<LiveHandle> {
        self.registry
            .as_ref()
            .map(|r| r.snapshot())
            .unwrap_or_default()
    }

    // ── Frames ──────────────────────────────────────────────

    /// Start recording on `queue` for the current frame.
    pub fn begin_frame(&mut self, queue: QueueKind) -> GpuResult<()> {
        let frame = self.frame();
        self.queues.begin(queue, frame)
    }

    pub fn record_into<R>(&mut self, f: impl FnOnce(&mut Recorder<'_>) -> R) -> GpuResult<R> {
        self.queues.record_into(f)
    }

    pub fn stage(&mut self, data: &[u8], alignment: u64) -> GpuResult<StagingRange> {
        self.queues.stage(data, alignment)
    }

    pub fn stage_pod<T: bytemuck::Pod>(&mut self, values: &[T]) -> GpuResult<StagingRange> {
        self.queues.record_into(|r| r.stage_pod(values))?
    }

    pub fn end_frame(&mut self, info: &SubmitInfo) -> GpuResult<()> {
        self.queues.end(info)
    }

    /// Frame boundary: note retired submissions, advance the frame counter
    /// and run every deferred free that is now safe. Returns the new frame.
    pub fn next_frame(&mut self) -> GpuResult<u64> {
        if let Some(queue) = self.queues.current_queue() {
            warn!("frame boundary while {} is still recording", queue);
        }
        self.queues.poll_retired()?;
        let frame = self.deferred.advance_frame();
        let freed = self.deferred.sweep(self.queues.oldest_in_flight());
        if freed > 0 {
            debug!("frame {}: {} deferred free(s) executed", frame, freed);
        }
        Ok(frame)
    }

    /// Block until every queue is idle and run all pending frees.
    pub fn wait_idle(&mut self) -> GpuResult<()> {
        self.queues.wait_idle()?;
        self.deferred.flush_all();
        Ok(())
    }

    pub fn timestamp_results(&self) -> &BTreeMap<String, f64> {
        self.queues.timestamp_results()
    }

    pub fn slot_state(&self, queue: QueueKind, slot: usize) -> Option<SlotState> {
        self.queues.slot_state(queue, slot)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            error!("wait_idle during shutdown failed: {}", e);
        }
        let leaked = self.live_handles();
        if !leaked.is_empty() {
            warn!("{} resource handle(s) still alive at shutdown", leaked.len());
            for handle in &leaked {
                warn!("  {} '{}'", handle.kind, handle.name);
            }
        }
    }
}
