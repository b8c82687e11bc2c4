use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::error;

use sxgpu_core::handle_registry::LiveHandleRegistry;
use sxgpu_core::{ResourceIdPool, SlotKind};

use crate::allocator::{BufferUsage, ImageUsage};
use crate::backend::{GpuBackend, MemoryClass, RawBuffer, RawImage};
use crate::deferred::DeferredFreeSender;

/// State shared by every handle created from one allocator.
pub(crate) struct ResourceShared {
    pub backend: Arc<dyn GpuBackend>,
    pub slots: Arc<Mutex<ResourceIdPool>>,
    pub deferred: DeferredFreeSender,
    pub registry: Option<Arc<LiveHandleRegistry>>,
}

impl ResourceShared {
    fn release_slot(&self, kind: SlotKind, slot: Option<u32>) {
        if let Some(id) = slot {
            if let Err(e) = self.slots.lock().release(kind, id) {
                error!("failed to release {} slot {}: {}", kind, id, e);
            }
        }
    }

    fn unregister(&self, registration: Option<u64>) {
        if let (Some(registry), Some(id)) = (&self.registry, registration) {
            registry.unregister(id);
        }
    }
}

fn slot_or_unassigned(kind: SlotKind, name: &str, slot: Option<u32>) -> u32 {
    debug_assert!(slot.is_some(), "{} '{}' has no bindless slot", kind, name);
    slot.unwrap_or(u32::MAX)
}

// ── Buffer ──────────────────────────────────────────────────

/// Reference-counted GPU buffer. The native object and its bindless slot are
/// released through the deferred destruction queue when the last clone drops.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    name: String,
    slot: Option<u32>,
    requested_size: u64,
    usage: BufferUsage,
    memory: MemoryClass,
    raw: RawBuffer,
    registration: Option<u64>,
    shared: Arc<ResourceShared>,
}

pub(crate) struct BufferParts {
    pub name: String,
    pub slot: Option<u32>,
    pub requested_size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryClass,
    pub raw: RawBuffer,
}

impl Buffer {
    pub(crate) fn new(parts: BufferParts, shared: Arc<ResourceShared>) -> Self {
        let registration = shared
            .registry
            .as_ref()
            .map(|r| r.register(SlotKind::Buffer, &parts.name));
        Self {
            inner: Arc::new(BufferInner {
                name: parts.name,
                slot: parts.slot,
                requested_size: parts.requested_size,
                usage: parts.usage,
                memory: parts.memory,
                raw: parts.raw,
                registration,
                shared,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bindless slot. Asking for the slot of a buffer without one is a bug.
    pub fn slot_id(&self) -> u32 {
        slot_or_unassigned(SlotKind::Buffer, &self.inner.name, self.inner.slot)
    }

    pub fn try_slot_id(&self) -> Option<u32> {
        self.inner.slot
    }

    /// Slot as a signed id, -1 when unassigned.
    pub fn raw_slot_id(&self) -> i32 {
        self.inner.slot.map_or(-1, |s| s as i32)
    }

    /// Allocated size, after padding.
    pub fn size(&self) -> u64 {
        self.inner.raw.size
    }

    pub fn requested_size(&self) -> u64 {
        self.inner.requested_size
    }

    /// Final usage including derived bits.
    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }

    pub fn memory_class(&self) -> MemoryClass {
        self.inner.memory
    }

    pub fn handle(&self) -> vk::Buffer {
        self.inner.raw.handle
    }

    pub fn device_address(&self) -> Option<u64> {
        self.inner.raw.device_address
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.inner.name)
            .field("slot", &self.raw_slot_id())
            .field("size", &self.inner.raw.size)
            .field("usage", &self.inner.usage)
            .field("memory", &self.inner.memory)
            .finish()
    }
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.shared.unregister(self.registration);
        let shared = self.shared.clone();
        let raw = self.raw;
        let slot = self.slot;
        self.shared
            .deferred
            .submit(format!("buffer '{}'", self.name), move || {
                shared.backend.destroy_buffer(raw);
                shared.release_slot(SlotKind::Buffer, slot);
            });
    }
}

// ── Image ───────────────────────────────────────────────────

/// Reference-counted GPU image with its default and per-layer views.
#[derive(Clone)]
pub struct Image {
    inner: Arc<ImageInner>,
}

struct ImageInner {
    name: String,
    slot: Option<u32>,
    width: u32,
    height: u32,
    layers: u32,
    mip_levels: u32,
    format: vk::Format,
    usage: ImageUsage,
    aspect: vk::ImageAspectFlags,
    layout: Mutex<vk::ImageLayout>,
    raw: RawImage,
    registration: Option<u64>,
    shared: Arc<ResourceShared>,
}

pub(crate) struct ImageParts {
    pub name: String,
    pub slot: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub mip_levels: u32,
    pub format: vk::Format,
    pub usage: ImageUsage,
    pub aspect: vk::ImageAspectFlags,
    pub raw: RawImage,
}

impl Image {
    pub(crate) fn new(parts: ImageParts, shared: Arc<ResourceShared>) -> Self {
        let registration = shared
            .registry
            .as_ref()
            .map(|r| r.register(SlotKind::Image, &parts.name));
        Self {
            inner: Arc::new(ImageInner {
                name: parts.name,
                slot: parts.slot,
                width: parts.width,
                height: parts.height,
                layers: parts.layers,
                mip_levels: parts.mip_levels,
                format: parts.format,
                usage: parts.usage,
                aspect: parts.aspect,
                layout: Mutex::new(vk::ImageLayout::UNDEFINED),
                raw: parts.raw,
                registration,
                shared,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn slot_id(&self) -> u32 {
        slot_or_unassigned(SlotKind::Image, &self.inner.name, self.inner.slot)
    }

    pub fn try_slot_id(&self) -> Option<u32> {
        self.inner.slot
    }

    pub fn raw_slot_id(&self) -> i32 {
        self.inner.slot.map_or(-1, |s| s as i32)
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.inner.width,
            height: self.inner.height,
        }
    }

    pub fn layers(&self) -> u32 {
        self.inner.layers
    }

    pub fn mip_levels(&self) -> u32 {
        self.inner.mip_levels
    }

    pub fn format(&self) -> vk::Format {
        self.inner.format
    }

    pub fn usage(&self) -> ImageUsage {
        self.inner.usage
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.inner.aspect
    }

    /// Layout last recorded by the owner of this image.
    pub fn layout(&self) -> vk::ImageLayout {
        *self.inner.layout.lock()
    }

    /// Record the layout after the caller has transitioned the image.
    pub fn set_layout(&self, layout: vk::ImageLayout) {
        *self.inner.layout.lock() = layout;
    }

    pub fn handle(&self) -> vk::Image {
        self.inner.raw.handle
    }

    pub fn default_view(&self) -> vk::ImageView {
        self.inner.raw.default_view
    }

    /// View of a single layer. Single-layer images only have the default view.
    pub fn layer_view(&self, layer: u32) -> Option<vk::ImageView> {
        if self.inner.layers == 1 && layer == 0 {
            return Some(self.inner.raw.default_view);
        }
        self.inner.raw.layer_views.get(layer as usize).copied()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("name", &self.inner.name)
            .field("slot", &self.raw_slot_id())
            .field("extent", &(self.inner.width, self.inner.height))
            .field("layers", &self.inner.layers)
            .field("format", &self.inner.format)
            .field("usage", &self.inner.usage)
            .finish()
    }
}

impl Drop for ImageInner {
    fn drop(&mut self) {
        self.shared.unregister(self.registration);
        let shared = self.shared.clone();
        let raw = std::mem::replace(
            &mut self.raw,
            RawImage {
                handle: vk::Image::null(),
                default_view: vk::ImageView::null(),
                layer_views: Vec::new(),
            },
        );
        let slot = self.slot;
        self.shared
            .deferred
            .submit(format!("image '{}'", self.name), move || {
                shared.backend.destroy_image(raw);
                shared.release_slot(SlotKind::Image, slot);
            });
    }
}

// ── Acceleration structure ─────────────────────────────────

/// Reference-counted acceleration structure and the buffer backing it.
#[derive(Clone)]
pub struct AccelerationStructure {
    inner: Arc<AccelerationStructureInner>,
}

struct AccelerationStructureInner {
    name: String,
    slot: Option<u32>,
    handle: vk::AccelerationStructureKHR,
    ty: vk::AccelerationStructureTypeKHR,
    registration: Option<u64>,
    shared: Arc<ResourceShared>,
    // Dropped after the structure itself is queued for destruction.
    buffer: Buffer,
}

impl AccelerationStructure {
    pub(crate) fn new(
        name: String,
        slot: Option<u32>,
        handle: vk::AccelerationStructureKHR,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: Buffer,
        shared: Arc<ResourceShared>,
    ) -> Self {
        let registration = shared
            .registry
            .as_ref()
            .map(|r| r.register(SlotKind::AccelerationStructure, &name));
        Self {
            inner: Arc::new(AccelerationStructureInner {
                name,
                slot,
                handle,
                ty,
                registration,
                shared,
                buffer,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn slot_id(&self) -> u32 {
        slot_or_unassigned(SlotKind::AccelerationStructure, &self.inner.name, self.inner.slot)
    }

    pub fn try_slot_id(&self) -> Option<u32> {
        self.inner.slot
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.inner.handle
    }

    pub fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        self.inner.ty
    }

    pub fn buffer(&self) -> &Buffer {
        &self.inner.buffer
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("name", &self.inner.name)
            .field("slot", &self.inner.slot)
            .field("ty", &self.inner.ty)
            .finish()
    }
}

impl Drop for AccelerationStructureInner {
    fn drop(&mut self) {
        self.shared.unregister(self.registration);
        let shared = self.shared.clone();
        let handle = self.handle;
        let slot = self.slot;
        self.shared
            .deferred
            .submit(format!("acceleration structure '{}'", self.name), move || {
                shared.backend.destroy_acceleration_structure(handle);
                shared.release_slot(SlotKind::AccelerationStructure, slot);
            });
    }
}

/// Any handle accepted by `GpuContext::destroy`.
#[derive(Debug, Clone)]
pub enum ResourceHandle {
    Buffer(Buffer),
    Image(Image),
    AccelerationStructure(AccelerationStructure),
}

impl ResourceHandle {
    pub fn name(&self) -> &str {
        match self {
            ResourceHandle::Buffer(b) => b.name(),
            ResourceHandle::Image(i) => i.name(),
            ResourceHandle::AccelerationStructure(a) => a.name(),
        }
    }

    pub fn kind(&self) -> SlotKind {
        match self {
            ResourceHandle::Buffer(_) => SlotKind::Buffer,
            ResourceHandle::Image(_) => SlotKind::Image,
            ResourceHandle::AccelerationStructure(_) => SlotKind::AccelerationStructure,
        }
    }

    /// Strong references including this one.
    pub fn ref_count(&self) -> usize {
        match self {
            ResourceHandle::Buffer(b) => b.ref_count(),
            ResourceHandle::Image(i) => i.ref_count(),
            ResourceHandle::AccelerationStructure(a) => a.ref_count(),
        }
    }
}

impl From<Buffer> for ResourceHandle {
    fn from(b: Buffer) -> Self {
        ResourceHandle::Buffer(b)
    }
}

impl From<Image> for ResourceHandle {
    fn from(i: Image) -> Self {
        ResourceHandle::Image(i)
    }
}

impl From<AccelerationStructure> for ResourceHandle {
    fn from(a: AccelerationStructure) -> Self {
        ResourceHandle::AccelerationStructure(a)
    }
}
