use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{debug, warn};

use sxgpu_core::handle_registry::LiveHandleRegistry;
use sxgpu_core::{GpuError, GpuResult, ResourceIdPool, SlotKind};

pub use crate::backend::MemoryClass;
use crate::backend::{
    BindlessBinding, DescriptorResource, DescriptorWrite, GpuBackend, MemoryStats, RawBufferDesc,
    RawImageDesc,
};
use crate::deferred::DeferredFreeSender;
use crate::resource::{
    AccelerationStructure, Buffer, BufferParts, Image, ImageParts, ResourceShared,
};

bitflags! {
    /// Roles a buffer is created for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
        /// Shader device address
        const ADDRESS = 1 << 7;
        /// Geometry/instance input to an acceleration structure build
        const ACCELERATION_STRUCTURE_INPUT = 1 << 8;
        /// Backing storage of an acceleration structure
        const ACCELERATION_STRUCTURE = 1 << 9;
    }
}

bitflags! {
    /// Roles an image is created for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_ATTACHMENT = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

/// Add the usage bits implied by the requested ones. Idempotent.
pub fn derive_buffer_usage(requested: BufferUsage) -> BufferUsage {
    let mut usage = requested;
    if requested.intersects(BufferUsage::VERTEX | BufferUsage::INDEX) {
        usage |= BufferUsage::TRANSFER_DST;
    }
    if requested.contains(BufferUsage::STORAGE) {
        usage |= BufferUsage::ADDRESS;
    }
    if requested.contains(BufferUsage::ACCELERATION_STRUCTURE_INPUT) {
        usage |= BufferUsage::ADDRESS | BufferUsage::TRANSFER_DST;
    }
    if requested.contains(BufferUsage::ACCELERATION_STRUCTURE) {
        usage |= BufferUsage::ADDRESS;
    }
    usage
}

/// Storage buffers are rounded up to the storage offset alignment.
pub fn padded_size(size: u64, usage: BufferUsage, storage_alignment: u64) -> u64 {
    if usage.contains(BufferUsage::STORAGE) {
        let align = storage_alignment.max(1);
        size.div_ceil(align) * align
    } else {
        size
    }
}

/// Sampled images are upload targets.
pub fn derive_image_usage(requested: ImageUsage) -> ImageUsage {
    let mut usage = requested;
    if requested.contains(ImageUsage::SAMPLED) {
        usage |= ImageUsage::TRANSFER_DST;
    }
    usage
}

pub fn vk_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    let pairs = [
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::INDIRECT, vk::BufferUsageFlags::INDIRECT_BUFFER),
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
        (BufferUsage::ADDRESS, vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
        (
            BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        ),
        (
            BufferUsage::ACCELERATION_STRUCTURE,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
        ),
    ];
    for (ours, theirs) in pairs {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub fn vk_image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    let pairs = [
        (ImageUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
        (ImageUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
        (ImageUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (ImageUsage::DEPTH_ATTACHMENT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
        (ImageUsage::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
        (ImageUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
    ];
    for (ours, theirs) in pairs {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Image creation request.
#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub mip_levels: u32,
    pub format: vk::Format,
    pub usage: ImageUsage,
    pub cube: bool,
}

impl ImageDesc {
    pub fn new_2d(name: &str, width: u32, height: u32, format: vk::Format, usage: ImageUsage) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            layers: 1,
            mip_levels: 1,
            format,
            usage,
            cube: false,
        }
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn cube(mut self) -> Self {
        self.cube = true;
        self.layers = self.layers.max(6);
        self
    }
}

/// Creates buffers, images and acceleration structures, assigns their
/// bindless slots and writes the descriptor table.
pub struct ResourceAllocator {
    shared: Arc<ResourceShared>,
    storage_alignment: u64,
    /// Budget fraction above which allocations warn
    warning_threshold: f64,
    /// Set while usage is above the threshold, so the warning fires once per crossing
    over_threshold: AtomicBool,
}

impl ResourceAllocator {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        slots: Arc<Mutex<ResourceIdPool>>,
        deferred: DeferredFreeSender,
        registry: Option<Arc<LiveHandleRegistry>>,
        warning_threshold: f64,
    ) -> Self {
        let storage_alignment = backend.device_info().limits.min_storage_buffer_offset_alignment;
        Self {
            shared: Arc::new(ResourceShared {
                backend,
                slots,
                deferred,
                registry,
            }),
            storage_alignment,
            warning_threshold,
            over_threshold: AtomicBool::new(false),
        }
    }

    pub fn storage_alignment(&self) -> u64 {
        self.storage_alignment
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.shared.backend.memory_stats()
    }

    /// True when reserved memory is above the warning threshold of the
    /// budget. Warns once each time usage crosses the threshold.
    pub fn check_memory_budget(&self) -> bool {
        let stats = self.memory_stats();
        let usage = stats.budget_usage();
        let over = usage > self.warning_threshold;
        let was_over = self.over_threshold.swap(over, Ordering::Relaxed);
        if over && !was_over {
            warn!(
                "GPU memory at {:.1}% of budget ({} MB / {} MB, {} allocations, {:.1}% fragmentation)",
                usage * 100.0,
                stats.reserved_bytes / (1024 * 1024),
                stats.budget_bytes / (1024 * 1024),
                stats.allocation_count,
                stats.fragmentation() * 100.0
            );
        } else if !over && was_over {
            debug!("GPU memory back under {:.0}% of budget", self.warning_threshold * 100.0);
        }
        over
    }

    // ── Buffers ─────────────────────────────────────────────

    /// Create a buffer. Storage buffers get a bindless slot and a descriptor
    /// write, and are padded to the storage offset alignment.
    pub fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        memory: MemoryClass,
        name: &str,
    ) -> GpuResult<Buffer> {
        if size == 0 {
            return Err(GpuError::InvalidArgument(format!("buffer '{}' has zero size", name)));
        }
        let usage = derive_buffer_usage(usage);
        let padded = padded_size(size, usage, self.storage_alignment);
        let backend = &self.shared.backend;

        let raw = backend.create_buffer(&RawBufferDesc {
            name,
            size: padded,
            usage: vk_buffer_usage(usage),
            memory,
        })?;

        let slot = if usage.contains(BufferUsage::STORAGE) {
            let slot = match self.shared.slots.lock().acquire(SlotKind::Buffer) {
                Ok(slot) => slot,
                Err(e) => {
                    // Never visible to the GPU, so no need to defer.
                    backend.destroy_buffer(raw);
                    warn!("buffer '{}' not created: {}", name, e);
                    return Err(e);
                }
            };
            backend.write_descriptor(&DescriptorWrite {
                binding: BindlessBinding::StorageBuffer,
                slot,
                resource: DescriptorResource::Buffer {
                    buffer: raw.handle,
                    range: padded,
                },
            });
            Some(slot)
        } else {
            None
        };

        debug!(
            "created buffer '{}': {} bytes (requested {}), {:?}, {:?}, slot {:?}",
            name, padded, size, usage, memory, slot
        );
        self.check_memory_budget();

        Ok(Buffer::new(
            BufferParts {
                name: name.to_string(),
                slot,
                requested_size: size,
                usage,
                memory,
                raw,
            },
            self.shared.clone(),
        ))
    }

    /// Create one buffer per entry of `sizes`, named `name[i]`. All or
    /// nothing: on failure the buffers already created are released.
    pub fn create_buffers(
        &self,
        sizes: &[u64],
        usage: BufferUsage,
        memory: MemoryClass,
        name: &str,
    ) -> GpuResult<Vec<Buffer>> {
        let mut buffers = Vec::with_capacity(sizes.len());
        for (i, &size) in sizes.iter().enumerate() {
            match self.create_buffer(size, usage, memory, &format!("{}[{}]", name, i)) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    warn!(
                        "buffer batch '{}' failed at {} of {}: {}",
                        name,
                        i,
                        sizes.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }
        debug!(
            "created buffer batch '{}': {} buffers, {} bytes",
            name,
            buffers.len(),
            buffers.iter().map(|b| b.size()).sum::<u64>()
        );
        Ok(buffers)
    }

    /// Copy bytes into a CPU-visible buffer.
    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        if buffer.memory_class() != MemoryClass::CpuVisible {
            return Err(GpuError::InvalidArgument(format!(
                "buffer '{}' is not CPU visible",
                buffer.name()
            )));
        }
        let end = offset.checked_add(data.len() as u64);
        if end.map_or(true, |end| end > buffer.size()) {
            return Err(GpuError::InvalidArgument(format!(
                "write of {} bytes at {} exceeds buffer '{}' ({} bytes)",
                data.len(),
                offset,
                buffer.name(),
                buffer.size()
            )));
        }
        self.shared.backend.write_buffer(buffer.handle(), offset, data)
    }

    // ── Images ──────────────────────────────────────────────

    /// Create an image with its default view and one view per layer.
    /// Sampled or storage images get a bindless slot.
    pub fn create_image(&self, desc: &ImageDesc) -> GpuResult<Image> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 || desc.mip_levels == 0 {
            return Err(GpuError::InvalidArgument(format!(
                "image '{}' has an empty extent, layer or mip count",
                desc.name
            )));
        }
        if desc.cube && desc.layers % 6 != 0 {
            return Err(GpuError::InvalidArgument(format!(
                "cube image '{}' needs a multiple of 6 layers, got {}",
                desc.name, desc.layers
            )));
        }
        let usage = derive_image_usage(desc.usage);
        let aspect = aspect_for_format(desc.format);
        let backend = &self.shared.backend;

        let raw = backend.create_image(&RawImageDesc {
            name: &desc.name,
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
            layers: desc.layers,
            mip_levels: desc.mip_levels,
            format: desc.format,
            usage: vk_image_usage(usage),
            aspect,
            cube: desc.cube,
        })?;

        let slot = if usage.intersects(ImageUsage::SAMPLED | ImageUsage::STORAGE) {
            let slot = match self.shared.slots.lock().acquire(SlotKind::Image) {
                Ok(slot) => slot,
                Err(e) => {
                    backend.destroy_image(raw);
                    warn!("image '{}' not created: {}", desc.name, e);
                    return Err(e);
                }
            };
            if usage.contains(ImageUsage::SAMPLED) {
                backend.write_descriptor(&DescriptorWrite {
                    binding: BindlessBinding::SampledImage,
                    slot,
                    resource: DescriptorResource::Image {
                        view: raw.default_view,
                        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    },
                });
            }
            if usage.contains(ImageUsage::STORAGE) {
                backend.write_descriptor(&DescriptorWrite {
                    binding: BindlessBinding::StorageImage,
                    slot,
                    resource: DescriptorResource::Image {
                        view: raw.default_view,
                        layout: vk::ImageLayout::GENERAL,
                    },
                });
            }
            Some(slot)
        } else {
            None
        };

        debug!(
            "created image '{}': {}x{}x{} {:?}, {:?}, slot {:?}",
            desc.name, desc.width, desc.height, desc.layers, desc.format, usage, slot
        );
        self.check_memory_budget();

        Ok(Image::new(
            ImageParts {
                name: desc.name.clone(),
                slot,
                width: desc.width,
                height: desc.height,
                layers: desc.layers,
                mip_levels: desc.mip_levels,
                format: desc.format,
                usage,
                aspect,
                raw,
            },
            self.shared.clone(),
        ))
    }

    // ── Acceleration structures ─────────────────────────────

    /// Create an acceleration structure on a dedicated backing buffer and
    /// give it a bindless slot.
    pub fn create_acceleration_structure(
        &self,
        size: u64,
        ty: vk::AccelerationStructureTypeKHR,
        name: &str,
    ) -> GpuResult<AccelerationStructure> {
        let backend = &self.shared.backend;
        if !backend.supports_acceleration_structures() {
            return Err(GpuError::Unsupported(format!(
                "acceleration structure '{}': device has no ray tracing support",
                name
            )));
        }
        let buffer = self.create_buffer(
            size,
            BufferUsage::ACCELERATION_STRUCTURE,
            MemoryClass::GpuOnly,
            &format!("{} (storage)", name),
        )?;
        let handle = backend.create_acceleration_structure(buffer.handle(), buffer.size(), ty)?;

        let slot = match self.shared.slots.lock().acquire(SlotKind::AccelerationStructure) {
            Ok(slot) => slot,
            Err(e) => {
                backend.destroy_acceleration_structure(handle);
                warn!("acceleration structure '{}' not created: {}", name, e);
                return Err(e);
            }
        };
        backend.write_descriptor(&DescriptorWrite {
            binding: BindlessBinding::AccelerationStructure,
            slot,
            resource: DescriptorResource::AccelerationStructure(handle),
        });

        debug!("created acceleration structure '{}' ({:?}), slot {}", name, ty, slot);

        Ok(AccelerationStructure::new(
            name.to_string(),
            Some(slot),
            handle,
            ty,
            buffer,
            self.shared.clone(),
        ))
    }

    pub fn slot_usage(&self, kind: SlotKind) -> (u32, u32) {
        let slots = self.shared.slots.lock();
        (slots.in_use(kind), slots.capacity(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_and_index_imply_transfer_dst() {
        for usage in [BufferUsage::VERTEX, BufferUsage::INDEX] {
            let derived = derive_buffer_usage(usage);
            assert!(derived.contains(usage | BufferUsage::TRANSFER_DST));
            assert!(!derived.contains(BufferUsage::ADDRESS));
        }
    }

    #[test]
    fn storage_implies_address() {
        let derived = derive_buffer_usage(BufferUsage::STORAGE);
        assert_eq!(derived, BufferUsage::STORAGE | BufferUsage::ADDRESS);
    }

    #[test]
    fn acceleration_structure_roles() {
        assert_eq!(
            derive_buffer_usage(BufferUsage::ACCELERATION_STRUCTURE_INPUT),
            BufferUsage::ACCELERATION_STRUCTURE_INPUT | BufferUsage::ADDRESS | BufferUsage::TRANSFER_DST
        );
        assert_eq!(
            derive_buffer_usage(BufferUsage::ACCELERATION_STRUCTURE),
            BufferUsage::ACCELERATION_STRUCTURE | BufferUsage::ADDRESS
        );
    }

    #[test]
    fn derivation_is_idempotent() {
        for bits in 0..(1u32 << 10) {
            let usage = BufferUsage::from_bits_truncate(bits);
            let once = derive_buffer_usage(usage);
            assert_eq!(derive_buffer_usage(once), once);
            assert!(once.contains(usage));
        }
    }

    #[test]
    fn storage_size_rounds_up() {
        assert_eq!(padded_size(1, BufferUsage::STORAGE, 64), 64);
        assert_eq!(padded_size(64, BufferUsage::STORAGE, 64), 64);
        assert_eq!(padded_size(65, BufferUsage::STORAGE, 64), 128);
        assert_eq!(padded_size(100, BufferUsage::STORAGE, 48), 144);
        assert_eq!(padded_size(65, BufferUsage::VERTEX, 64), 65);
        assert_eq!(padded_size(7, BufferUsage::STORAGE, 0), 7);
    }

    #[test]
    fn vk_flag_mapping() {
        let flags = vk_buffer_usage(derive_buffer_usage(BufferUsage::STORAGE));
        assert!(flags.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));

        let flags = vk_image_usage(derive_image_usage(ImageUsage::SAMPLED));
        assert!(flags.contains(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn depth_formats_get_depth_aspect() {
        assert_eq!(aspect_for_format(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_for_format(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
    }
}
