use ash::vk;

/// Immutable snapshot of one physical device, captured once at enumeration.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    /// Position in the enumeration order
    pub index: usize,
    pub raw: vk::PhysicalDevice,
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,
    pub limits: DeviceLimits,
    pub features: DeviceFeatures,
    pub memory_types: Vec<MemoryTypeInfo>,
    pub memory_heaps: Vec<MemoryHeapInfo>,
    pub queue_families: Vec<QueueFamilyInfo>,
    /// Present only when enumeration was given a surface
    pub surface: Option<SurfaceSupport>,
    pub extensions: Vec<String>,
    /// First supported of D32_SFLOAT, D32_SFLOAT_S8_UINT, D24_UNORM_S8_UINT
    pub depth_format: Option<vk::Format>,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceLimits {
    pub min_storage_buffer_offset_alignment: u64,
    pub min_uniform_buffer_offset_alignment: u64,
    pub max_image_dimension_2d: u32,
    pub max_image_array_layers: u32,
    /// Nanoseconds per timestamp tick
    pub timestamp_period: f32,
    pub timestamp_compute_and_graphics: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceFeatures {
    pub descriptor_indexing: bool,
    pub buffer_device_address: bool,
    pub timeline_semaphore: bool,
    pub dynamic_rendering: bool,
    pub synchronization2: bool,
    pub sampler_anisotropy: bool,
    pub acceleration_structure: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryTypeInfo {
    pub flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryHeapInfo {
    pub size: u64,
    pub device_local: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Zero means the family cannot write timestamps
    pub timestamp_valid_bits: u32,
    /// Can present to the surface given at enumeration
    pub present: bool,
}

#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_storage_buffer_offset_alignment: 16,
            min_uniform_buffer_offset_alignment: 256,
            max_image_dimension_2d: 16384,
            max_image_array_layers: 2048,
            timestamp_period: 1.0,
            timestamp_compute_and_graphics: true,
        }
    }
}

impl PhysicalDeviceInfo {
    pub fn vendor_name(&self) -> &'static str {
        vendor_name(self.vendor_id)
    }

    pub fn type_name(&self) -> &'static str {
        match self.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "discrete",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "integrated",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "virtual",
            vk::PhysicalDeviceType::CPU => "cpu",
            _ => "other",
        }
    }

    pub fn is_discrete(&self) -> bool {
        self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }

    /// Total size of device-local heaps in bytes.
    pub fn device_local_memory(&self) -> u64 {
        self.memory_heaps
            .iter()
            .filter(|h| h.device_local)
            .map(|h| h.size)
            .sum()
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }

    /// True if some family supports every bit of `flags` (and presentation
    /// when `require_present` is set).
    pub fn supports_queue(&self, flags: vk::QueueFlags, require_present: bool) -> bool {
        self.queue_families
            .iter()
            .any(|f| f.queue_count > 0 && f.flags.contains(flags) && (!require_present || f.present))
    }

    pub fn api_version_string(&self) -> String {
        format_api_version(self.api_version)
    }
}

/// Queue family chosen for each queue capability. Kinds may share a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Graphics is the first graphics family (preferring one that can present
    /// when asked). Compute prefers a family without graphics, transfer prefers
    /// a family with neither graphics nor compute, then a compute-only family.
    pub fn resolve(info: &PhysicalDeviceInfo, require_present: bool) -> Option<Self> {
        let families = &info.queue_families;
        let usable = |f: &&QueueFamilyInfo| f.queue_count > 0;

        let graphics_family = families
            .iter()
            .filter(usable)
            .find(|f| f.flags.contains(vk::QueueFlags::GRAPHICS) && f.present)
            .or_else(|| {
                families
                    .iter()
                    .filter(usable)
                    .find(|f| f.flags.contains(vk::QueueFlags::GRAPHICS))
            })?;

        let present = if graphics_family.present {
            Some(graphics_family.index)
        } else {
            families.iter().filter(usable).find(|f| f.present).map(|f| f.index)
        };
        if require_present && present.is_none() {
            return None;
        }

        let compute = families
            .iter()
            .filter(usable)
            .find(|f| {
                f.flags.contains(vk::QueueFlags::COMPUTE) && !f.flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map(|f| f.index)
            .unwrap_or(graphics_family.index);

        let transfer = families
            .iter()
            .filter(usable)
            .find(|f| {
                f.flags.contains(vk::QueueFlags::TRANSFER)
                    && !f.flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map(|f| f.index)
            .unwrap_or(compute);

        Some(Self {
            graphics: graphics_family.index,
            compute,
            transfer,
            present,
        })
    }

    /// Distinct families, in graphics/compute/transfer order.
    pub fn unique(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(3);
        for family in [self.graphics, self.compute, self.transfer] {
            if !out.contains(&family) {
                out.push(family);
            }
        }
        out
    }
}

pub fn vendor_name(vendor_id: u32) -> &'static str {
    match vendor_id {
        0x10DE => "NVIDIA",
        0x1002 => "AMD",
        0x8086 => "Intel",
        0x13B5 => "ARM",
        0x5143 => "Qualcomm",
        0x106B => "Apple",
        _ => "unknown",
    }
}

pub fn format_api_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(version),
        vk::api_version_minor(version),
        vk::api_version_patch(version)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(index: u32, flags: vk::QueueFlags, present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo {
            index,
            flags,
            queue_count: 1,
            timestamp_valid_bits: 64,
            present,
        }
    }

    fn device(families: Vec<QueueFamilyInfo>) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            index: 0,
            raw: vk::PhysicalDevice::null(),
            name: "test".into(),
            vendor_id: 0x10DE,
            device_id: 1,
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::make_api_version(0, 1, 3, 0),
            driver_version: 0,
            limits: DeviceLimits::default(),
            features: DeviceFeatures::default(),
            memory_types: Vec::new(),
            memory_heaps: vec![
                MemoryHeapInfo { size: 8 << 30, device_local: true },
                MemoryHeapInfo { size: 16 << 30, device_local: false },
            ],
            queue_families: families,
            surface: None,
            extensions: Vec::new(),
            depth_format: Some(vk::Format::D32_SFLOAT),
        }
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let info = device(vec![
            family(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, true),
            family(1, vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, false),
            family(2, vk::QueueFlags::TRANSFER, false),
        ]);
        let indices = QueueFamilyIndices::resolve(&info, true).unwrap();
        assert_eq!(indices.graphics, 0);
        assert_eq!(indices.compute, 1);
        assert_eq!(indices.transfer, 2);
        assert_eq!(indices.present, Some(0));
        assert_eq!(indices.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn single_family_serves_everything() {
        let info = device(vec![family(
            0,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            false,
        )]);
        let indices = QueueFamilyIndices::resolve(&info, false).unwrap();
        assert_eq!((indices.graphics, indices.compute, indices.transfer), (0, 0, 0));
        assert_eq!(indices.unique(), vec![0]);
        assert!(QueueFamilyIndices::resolve(&info, true).is_none());
    }

    #[test]
    fn summary_helpers() {
        let info = device(Vec::new());
        assert_eq!(info.vendor_name(), "NVIDIA");
        assert_eq!(info.type_name(), "discrete");
        assert_eq!(info.device_local_memory(), 8 << 30);
        assert_eq!(info.api_version_string(), "1.3.0");
    }
}
