use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use dashmap::DashMap;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use sxgpu_core::config::BindlessConfig;
use sxgpu_core::{GpuConfig, GpuError, GpuResult};

use super::instance::{to_cstring, VulkanInstance};
use super::vk_error;
use crate::backend::{
    BindlessBinding, CommandSlotDesc, DescriptorResource, DescriptorWrite, FenceStatus, GpuBackend,
    MemoryClass, MemoryStats, RawBuffer, RawBufferDesc, RawCommandSlot, RawImage, RawImageDesc,
};
use crate::device_info::{PhysicalDeviceInfo, QueueFamilyIndices};
use crate::queue::{QueueKind, SubmitInfo};

const ACCELERATION_STRUCTURE_EXTENSIONS: [&str; 2] =
    ["VK_KHR_acceleration_structure", "VK_KHR_deferred_host_operations"];

/// The bindless descriptor set: one array per `BindlessBinding`.
struct BindlessSet {
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    has_acceleration_structures: bool,
}

struct ImageEntry {
    allocation: Allocation,
    views: Vec<vk::ImageView>,
}

/// Logical device on one physical device, with its queues, memory allocator
/// and bindless descriptor set.
pub struct VulkanDevice {
    info: PhysicalDeviceInfo,
    families: QueueFamilyIndices,
    device: ash::Device,
    /// Indexed by `QueueKind::index`; kinds sharing a family share the mutex
    queues: [Arc<Mutex<vk::Queue>>; 3],
    allocator: Mutex<Option<Allocator>>,
    acceleration: Option<ash::khr::acceleration_structure::Device>,
    buffers: DashMap<vk::Buffer, Allocation>,
    images: DashMap<vk::Image, ImageEntry>,
    bindless: BindlessSet,
    /// vkUpdateDescriptorSets needs the set externally synchronized
    descriptor_lock: Mutex<()>,
    // Last so the instance outlives everything created from it.
    instance: Arc<VulkanInstance>,
}

impl VulkanDevice {
    pub fn new(
        instance: Arc<VulkanInstance>,
        info: PhysicalDeviceInfo,
        families: QueueFamilyIndices,
        config: &GpuConfig,
    ) -> GpuResult<Self> {
        let unique: BTreeSet<u32> = [families.graphics, families.compute, families.transfer]
            .into_iter()
            .chain(families.present)
            .collect();
        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let with_acceleration = info.features.acceleration_structure
            && ACCELERATION_STRUCTURE_EXTENSIONS.iter().all(|e| info.has_extension(e));
        let mut extensions: Vec<String> = config.device.required_extensions.clone();
        if with_acceleration {
            for ext in ACCELERATION_STRUCTURE_EXTENSIONS {
                if !extensions.iter().any(|e| e == ext) {
                    extensions.push(ext.to_string());
                }
            }
        }
        let extension_names = extensions
            .iter()
            .map(|e| to_cstring(e))
            .collect::<GpuResult<Vec<_>>>()?;
        let extension_ptrs: Vec<*const std::ffi::c_char> =
            extension_names.iter().map(|s| s.as_ptr()).collect();

        let features = info.features;
        let base = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(features.sampler_anisotropy);
        let mut vk12 = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_update_unused_while_pending(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .shader_storage_buffer_array_non_uniform_indexing(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .shader_storage_image_array_non_uniform_indexing(true)
            .buffer_device_address(features.buffer_device_address)
            .timeline_semaphore(features.timeline_semaphore);
        let mut vk13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(features.dynamic_rendering)
            .synchronization2(features.synchronization2);
        let mut accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true)
            .descriptor_binding_acceleration_structure_update_after_bind(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(base)
            .push_next(&mut vk12);
        if info.api_version >= vk::API_VERSION_1_3 {
            features2 = features2.push_next(&mut vk13);
        }
        if with_acceleration {
            features2 = features2.push_next(&mut accel);
        }

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features2);

        let device = unsafe { instance.raw().create_device(info.raw, &create_info, None) }
            .map_err(|e| vk_error("vkCreateDevice", e))?;

        let mut family_queues: HashMap<u32, Arc<Mutex<vk::Queue>>> = HashMap::new();
        for &family in &unique {
            let queue = unsafe { device.get_device_queue(family, 0) };
            family_queues.insert(family, Arc::new(Mutex::new(queue)));
        }
        let queue_for = |family: u32| {
            family_queues
                .get(&family)
                .cloned()
                .ok_or_else(|| GpuError::Backend(format!("no queue retrieved for family {}", family)))
        };
        let queues = match (
            queue_for(families.graphics),
            queue_for(families.compute),
            queue_for(families.transfer),
        ) {
            (Ok(g), Ok(c), Ok(t)) => [g, c, t],
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw().clone(),
            device: device.clone(),
            physical_device: info.raw,
            debug_settings: Default::default(),
            buffer_device_address: features.buffer_device_address,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(GpuError::Backend(format!("failed to create memory allocator: {}", e)));
            }
        };

        let bindless = match create_bindless_set(&device, &config.bindless, with_acceleration) {
            Ok(set) => set,
            Err(e) => {
                drop(allocator);
                unsafe { device.destroy_device(None) };
                return Err(vk_error("bindless descriptor set", e));
            }
        };

        let acceleration =
            with_acceleration.then(|| ash::khr::acceleration_structure::Device::new(instance.raw(), &device));

        info!(
            "created logical device on '{}' (families g{} c{} t{}, {} extension(s), acceleration structures {})",
            info.name,
            families.graphics,
            families.compute,
            families.transfer,
            extensions.len(),
            if with_acceleration { "on" } else { "off" }
        );

        Ok(Self {
            info,
            families,
            device,
            queues,
            allocator: Mutex::new(Some(allocator)),
            acceleration,
            buffers: DashMap::new(),
            images: DashMap::new(),
            bindless,
            descriptor_lock: Mutex::new(()),
            instance,
        })
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    pub fn instance(&self) -> &Arc<VulkanInstance> {
        &self.instance
    }

    /// The bindless set and its layout, for pipeline layout creation.
    pub fn bindless_set(&self) -> (vk::DescriptorSetLayout, vk::DescriptorSet) {
        (self.bindless.layout, self.bindless.set)
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> GpuResult<Allocation> {
        let mut guard = self.allocator.lock();
        let allocator = guard
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("memory allocator already shut down".into()))?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| match e {
                AllocationError::OutOfMemory => {
                    GpuError::AllocationFailure(format!("'{}': out of device memory", name))
                }
                other => GpuError::AllocationFailure(format!("'{}': {}", name, other)),
            })
    }

    fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                error!("failed to free allocation: {}", e);
            }
        }
    }

    fn queue(&self, kind: QueueKind) -> &Arc<Mutex<vk::Queue>> {
        &self.queues[kind.index()]
    }

    fn family(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.families.graphics,
            QueueKind::Compute => self.families.compute,
            QueueKind::Transfer => self.families.transfer,
        }
    }

    fn create_views(&self, image: vk::Image, desc: &RawImageDesc<'_>) -> GpuResult<Vec<vk::ImageView>> {
        let aspect = if desc.aspect.contains(vk::ImageAspectFlags::DEPTH) {
            vk::ImageAspectFlags::DEPTH
        } else {
            desc.aspect
        };
        let default_type = if desc.cube && desc.layers == 6 {
            vk::ImageViewType::CUBE
        } else if desc.cube {
            vk::ImageViewType::CUBE_ARRAY
        } else if desc.layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };

        let mut views = Vec::with_capacity(1 + desc.layers as usize);
        let mut requests = vec![(default_type, 0, desc.layers)];
        if desc.layers > 1 {
            requests.extend((0..desc.layers).map(|layer| (vk::ImageViewType::TYPE_2D, layer, 1)));
        }
        for (view_type, base_layer, layer_count) in requests {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(view_type)
                .format(desc.format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(aspect)
                        .base_mip_level(0)
                        .level_count(desc.mip_levels)
                        .base_array_layer(base_layer)
                        .layer_count(layer_count),
                );
            match unsafe { self.device.create_image_view(&create_info, None) } {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        unsafe { self.device.destroy_image_view(view, None) };
                    }
                    return Err(vk_error("vkCreateImageView", e));
                }
            }
        }
        Ok(views)
    }

    fn build_command_slot(
        &self,
        queue: QueueKind,
        desc: &CommandSlotDesc,
        partial: &mut PartialSlot,
    ) -> GpuResult<RawCommandSlot> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.family(queue))
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .map_err(|e| vk_error("vkCreateCommandPool", e))?;
        partial.pool = Some(pool);

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| vk_error("vkAllocateCommandBuffers", e))?
            .first()
            .copied()
            .ok_or_else(|| GpuError::Backend("no command buffer allocated".into()))?;

        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = unsafe { self.device.create_fence(&fence_info, None) }
            .map_err(|e| vk_error("vkCreateFence", e))?;
        partial.fence = Some(fence);

        let query_pool = if desc.query_count > 0 {
            let info = vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::TIMESTAMP)
                .query_count(desc.query_count);
            let pool = unsafe { self.device.create_query_pool(&info, None) }
                .map_err(|e| vk_error("vkCreateQueryPool", e))?;
            partial.query_pool = Some(pool);
            Some(pool)
        } else {
            None
        };

        let staging = self.create_buffer(&RawBufferDesc {
            name: &format!("{} staging", queue),
            size: desc.staging_size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory: MemoryClass::CpuVisible,
        })?;

        Ok(RawCommandSlot {
            pool,
            command_buffer,
            fence,
            query_pool,
            staging,
        })
    }
}

#[derive(Default)]
struct PartialSlot {
    pool: Option<vk::CommandPool>,
    fence: Option<vk::Fence>,
    query_pool: Option<vk::QueryPool>,
}

fn create_bindless_set(
    device: &ash::Device,
    config: &BindlessConfig,
    with_acceleration: bool,
) -> Result<BindlessSet, vk::Result> {
    let mut entries = vec![
        (
            BindlessBinding::StorageBuffer,
            vk::DescriptorType::STORAGE_BUFFER,
            config.buffer_capacity,
        ),
        (
            BindlessBinding::SampledImage,
            vk::DescriptorType::SAMPLED_IMAGE,
            config.image_capacity,
        ),
        (
            BindlessBinding::StorageImage,
            vk::DescriptorType::STORAGE_IMAGE,
            config.image_capacity,
        ),
    ];
    if with_acceleration {
        entries.push((
            BindlessBinding::AccelerationStructure,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            config.acceleration_structure_capacity,
        ));
    }

    let bindings: Vec<vk::DescriptorSetLayoutBinding> = entries
        .iter()
        .map(|&(binding, ty, count)| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding as u32)
                .descriptor_type(ty)
                .descriptor_count(count)
                .stage_flags(vk::ShaderStageFlags::ALL)
        })
        .collect();
    let flags = vec![
        vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;
        bindings.len()
    ];
    let mut binding_flags = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&flags);
    let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
        .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
        .bindings(&bindings)
        .push_next(&mut binding_flags);
    let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }?;

    let sizes: Vec<vk::DescriptorPoolSize> = entries
        .iter()
        .map(|&(_, ty, count)| vk::DescriptorPoolSize {
            ty,
            descriptor_count: count,
        })
        .collect();
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
        .max_sets(1)
        .pool_sizes(&sizes);
    let pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
        Ok(pool) => pool,
        Err(e) => {
            unsafe { device.destroy_descriptor_set_layout(layout, None) };
            return Err(e);
        }
    };

    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let set = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
        Ok(sets) => sets[0],
        Err(e) => {
            unsafe {
                device.destroy_descriptor_pool(pool, None);
                device.destroy_descriptor_set_layout(layout, None);
            }
            return Err(e);
        }
    };

    debug!(
        "bindless set: {} buffers, {} images, {} acceleration structures",
        config.buffer_capacity,
        config.image_capacity,
        if with_acceleration {
            config.acceleration_structure_capacity
        } else {
            0
        }
    );

    Ok(BindlessSet {
        layout,
        pool,
        set,
        has_acceleration_structures: with_acceleration,
    })
}

impl GpuBackend for VulkanDevice {
    fn device_info(&self) -> &PhysicalDeviceInfo {
        &self.info
    }

    fn queue_families(&self) -> QueueFamilyIndices {
        self.families
    }

    fn memory_stats(&self) -> MemoryStats {
        let budget_bytes = self.info.device_local_memory();
        match self.allocator.lock().as_ref() {
            Some(allocator) => {
                let report = allocator.generate_report();
                MemoryStats {
                    allocation_count: report.allocations.len(),
                    allocated_bytes: report.total_allocated_bytes,
                    reserved_bytes: report.total_reserved_bytes,
                    budget_bytes,
                }
            }
            None => MemoryStats {
                budget_bytes,
                ..MemoryStats::default()
            },
        }
    }

    fn ash_device(&self) -> Option<&ash::Device> {
        Some(&self.device)
    }

    // ── Memory objects ──────────────────────────────────────

    fn create_buffer(&self, desc: &RawBufferDesc<'_>) -> GpuResult<RawBuffer> {
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&create_info, None) }
            .map_err(|e| vk_error("vkCreateBuffer", e))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let location = match desc.memory {
            MemoryClass::GpuOnly => MemoryLocation::GpuOnly,
            MemoryClass::CpuVisible => MemoryLocation::CpuToGpu,
        };

        let allocation = match self.allocate(desc.name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) =
            unsafe { self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            self.free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(vk_error("vkBindBufferMemory", e));
        }

        let device_address = desc
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then(|| unsafe {
                self.device
                    .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer))
            });

        self.buffers.insert(buffer, allocation);
        Ok(RawBuffer {
            handle: buffer,
            size: desc.size,
            device_address,
        })
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        unsafe { self.device.destroy_buffer(buffer.handle, None) };
        match self.buffers.remove(&buffer.handle) {
            Some((_, allocation)) => self.free(allocation),
            None => warn!("destroyed buffer {:?} with no tracked allocation", buffer.handle),
        }
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        let mut allocation = self
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::InvalidArgument(format!("unknown buffer {:?}", buffer)))?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| GpuError::InvalidArgument("buffer memory is not host mapped".into()))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > mapped.len() {
            return Err(GpuError::InvalidArgument(format!(
                "write of {} bytes at {} exceeds mapped size {}",
                data.len(),
                offset,
                mapped.len()
            )));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_image(&self, desc: &RawImageDesc<'_>) -> GpuResult<RawImage> {
        let flags = if desc.cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let create_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&create_info, None) }
            .map_err(|e| vk_error("vkCreateImage", e))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(desc.name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) =
            unsafe { self.device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
        {
            self.free(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(vk_error("vkBindImageMemory", e));
        }

        let views = match self.create_views(image, desc) {
            Ok(views) => views,
            Err(e) => {
                self.free(allocation);
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let raw = RawImage {
            handle: image,
            default_view: views[0],
            layer_views: views[1..].to_vec(),
        };
        self.images.insert(image, ImageEntry { allocation, views });
        Ok(raw)
    }

    fn destroy_image(&self, image: RawImage) {
        match self.images.remove(&image.handle) {
            Some((_, entry)) => {
                for view in entry.views {
                    unsafe { self.device.destroy_image_view(view, None) };
                }
                unsafe { self.device.destroy_image(image.handle, None) };
                self.free(entry.allocation);
            }
            None => warn!("destroy of untracked image {:?} ignored", image.handle),
        }
    }

    fn supports_acceleration_structures(&self) -> bool {
        self.acceleration.is_some()
    }

    fn create_acceleration_structure(
        &self,
        buffer: vk::Buffer,
        size: u64,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> GpuResult<vk::AccelerationStructureKHR> {
        let loader = self
            .acceleration
            .as_ref()
            .ok_or_else(|| GpuError::Unsupported("acceleration structures are not enabled".into()))?;
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer)
            .offset(0)
            .size(size)
            .ty(ty);
        unsafe { loader.create_acceleration_structure(&create_info, None) }
            .map_err(|e| vk_error("vkCreateAccelerationStructureKHR", e))
    }

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        if let Some(loader) = &self.acceleration {
            unsafe { loader.destroy_acceleration_structure(handle, None) };
        }
    }

    fn write_descriptor(&self, write: &DescriptorWrite) {
        let _guard = self.descriptor_lock.lock();
        let base = vk::WriteDescriptorSet::default()
            .dst_set(self.bindless.set)
            .dst_binding(write.binding as u32)
            .dst_array_element(write.slot);

        match write.resource {
            DescriptorResource::Buffer { buffer, range } => {
                let infos = [vk::DescriptorBufferInfo::default()
                    .buffer(buffer)
                    .offset(0)
                    .range(range)];
                let writes = [base
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(&infos)];
                unsafe { self.device.update_descriptor_sets(&writes, &[]) };
            }
            DescriptorResource::Image { view, layout } => {
                let ty = match write.binding {
                    BindlessBinding::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
                    _ => vk::DescriptorType::SAMPLED_IMAGE,
                };
                let infos = [vk::DescriptorImageInfo::default().image_view(view).image_layout(layout)];
                let writes = [base.descriptor_type(ty).image_info(&infos)];
                unsafe { self.device.update_descriptor_sets(&writes, &[]) };
            }
            DescriptorResource::AccelerationStructure(handle) => {
                if !self.bindless.has_acceleration_structures {
                    warn!("acceleration structure descriptor write without binding 3");
                    return;
                }
                let handles = [handle];
                let mut info =
                    vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&handles);
                let mut write = base
                    .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                    .push_next(&mut info);
                write.descriptor_count = 1;
                unsafe { self.device.update_descriptor_sets(&[write], &[]) };
            }
        }
    }

    // ── Command slots ───────────────────────────────────────

    fn create_command_slot(&self, queue: QueueKind, desc: &CommandSlotDesc) -> GpuResult<RawCommandSlot> {
        let mut partial = PartialSlot::default();
        self.build_command_slot(queue, desc, &mut partial).inspect_err(|_| unsafe {
            if let Some(pool) = partial.query_pool {
                self.device.destroy_query_pool(pool, None);
            }
            if let Some(fence) = partial.fence {
                self.device.destroy_fence(fence, None);
            }
            if let Some(pool) = partial.pool {
                self.device.destroy_command_pool(pool, None);
            }
        })
    }

    fn destroy_command_slot(&self, slot: RawCommandSlot) {
        self.destroy_buffer(slot.staging);
        unsafe {
            if let Some(pool) = slot.query_pool {
                self.device.destroy_query_pool(pool, None);
            }
            self.device.destroy_fence(slot.fence, None);
            // Frees the command buffer with it.
            self.device.destroy_command_pool(slot.pool, None);
        }
    }

    fn wait_fence(&self, fence: vk::Fence, timeout: Duration) -> GpuResult<FenceStatus> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(FenceStatus::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceStatus::TimedOut),
            Err(e) => Err(vk_error("vkWaitForFences", e)),
        }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> GpuResult<bool> {
        unsafe { self.device.get_fence_status(fence) }.map_err(|e| vk_error("vkGetFenceStatus", e))
    }

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }.map_err(|e| vk_error("vkResetFences", e))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> GpuResult<()> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
        .map_err(|e| vk_error("vkResetCommandPool", e))
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GpuResult<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
            .map_err(|e| vk_error("vkBeginCommandBuffer", e))
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> GpuResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }.map_err(|e| vk_error("vkEndCommandBuffer", e))
    }

    fn reset_queries(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, count: u32) {
        unsafe { self.device.cmd_reset_query_pool(command_buffer, pool, 0, count) };
    }

    fn write_timestamp(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
        // Even queries open an interval, odd queries close it.
        let stage = if query % 2 == 0 {
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        };
        unsafe { self.device.cmd_write_timestamp(command_buffer, stage, pool, query) };
    }

    fn read_timestamps(&self, pool: vk::QueryPool, count: u32) -> GpuResult<Option<Vec<u64>>> {
        let mut values = vec![0u64; count as usize];
        match unsafe {
            self.device
                .get_query_pool_results(pool, 0, &mut values, vk::QueryResultFlags::TYPE_64)
        } {
            Ok(()) => Ok(Some(values)),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(vk_error("vkGetQueryPoolResults", e)),
        }
    }

    fn submit(
        &self,
        queue: QueueKind,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
        info: &SubmitInfo,
    ) -> GpuResult<()> {
        let (wait_semaphores, wait_stages): (Vec<vk::Semaphore>, Vec<vk::PipelineStageFlags>) =
            info.wait_semaphores.iter().copied().unzip();
        let command_buffers = [command_buffer];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&info.signal_semaphores);
        let handle = self.queue(queue).lock();
        unsafe { self.device.queue_submit(*handle, &[submit], fence) }
            .map_err(|e| vk_error("vkQueueSubmit", e))
    }

    fn wait_idle(&self) -> GpuResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(|e| vk_error("vkDeviceWaitIdle", e))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            error!("vkDeviceWaitIdle during shutdown failed: {:?}", e);
        }

        if !self.buffers.is_empty() || !self.images.is_empty() {
            warn!(
                "{} buffer(s) and {} image(s) still allocated at device shutdown",
                self.buffers.len(),
                self.images.len()
            );
        }
        let buffers: Vec<vk::Buffer> = self.buffers.iter().map(|e| *e.key()).collect();
        for buffer in buffers {
            if let Some((handle, allocation)) = self.buffers.remove(&buffer) {
                unsafe { self.device.destroy_buffer(handle, None) };
                self.free(allocation);
            }
        }
        let images: Vec<vk::Image> = self.images.iter().map(|e| *e.key()).collect();
        for image in images {
            if let Some((handle, entry)) = self.images.remove(&image) {
                for view in entry.views {
                    unsafe { self.device.destroy_image_view(view, None) };
                }
                unsafe { self.device.destroy_image(handle, None) };
                self.free(entry.allocation);
            }
        }

        unsafe {
            self.device.destroy_descriptor_pool(self.bindless.pool, None);
            self.device
                .destroy_descriptor_set_layout(self.bindless.layout, None);
        }

        // The allocator must go before the device it allocates from.
        drop(self.allocator.lock().take());
        unsafe { self.device.destroy_device(None) };
        info!("destroyed logical device on '{}'", self.info.name);
    }
}
