use std::ffi::CString;

use ash::vk;
use tracing::{debug, info, warn};

use sxgpu_core::config::DeviceConfig;
use sxgpu_core::{GpuError, GpuResult};

use super::{vk_error, DEPTH_FORMAT_CANDIDATES};
use crate::backend::DeviceSource;
use crate::capability::missing_layers;
use crate::device_info::{
    DeviceFeatures, DeviceLimits, MemoryHeapInfo, MemoryTypeInfo, PhysicalDeviceInfo, QueueFamilyInfo,
    SurfaceSupport,
};

const ACCELERATION_STRUCTURE_EXTENSION: &str = "VK_KHR_acceleration_structure";

/// Loaded Vulkan entry points plus the instance created from them.
pub struct VulkanInstance {
    entry: ash::Entry,
    instance: ash::Instance,
    surface: ash::khr::surface::Instance,
    api_version: u32,
    validation: bool,
}

impl VulkanInstance {
    /// Load the Vulkan loader and create an instance at the configured
    /// minimum API version, with validation layers when enabled.
    pub fn new(config: &DeviceConfig) -> GpuResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Backend(format!("failed to load Vulkan loader: {}", e)))?;

        let (major, minor) = config.api_version()?;
        let api_version = vk::make_api_version(0, major, minor, 0);
        let loader_version = unsafe { entry.try_enumerate_instance_version() }
            .map_err(|e| vk_error("vkEnumerateInstanceVersion", e))?
            .unwrap_or(vk::API_VERSION_1_0);
        if loader_version < api_version {
            return Err(GpuError::UnsupportedApiVersion {
                required: config.min_api_version.clone(),
                found: format!(
                    "{}.{}",
                    vk::api_version_major(loader_version),
                    vk::api_version_minor(loader_version)
                ),
            });
        }

        let layers = if config.enable_validation {
            let available = available_layers(&entry)?;
            let missing = missing_layers(&config.validation_layers, &available);
            if !missing.is_empty() {
                return Err(GpuError::MissingLayer(missing.join(", ")));
            }
            config.validation_layers.clone()
        } else {
            Vec::new()
        };

        if !config.instance_extensions.is_empty() {
            let available = available_instance_extensions(&entry)?;
            let missing: Vec<&String> = config
                .instance_extensions
                .iter()
                .filter(|e| !available.contains(e))
                .collect();
            if !missing.is_empty() {
                let names: Vec<&str> = missing.iter().map(|s| s.as_str()).collect();
                return Err(GpuError::MissingExtension(names.join(", ")));
            }
        }

        let app_name = to_cstring(&config.application_name)?;
        let layer_names = layers.iter().map(|l| to_cstring(l)).collect::<GpuResult<Vec<_>>>()?;
        let extension_names = config
            .instance_extensions
            .iter()
            .map(|e| to_cstring(e))
            .collect::<GpuResult<Vec<_>>>()?;
        let layer_ptrs: Vec<*const std::ffi::c_char> = layer_names.iter().map(|s| s.as_ptr()).collect();
        let extension_ptrs: Vec<*const std::ffi::c_char> =
            extension_names.iter().map(|s| s.as_ptr()).collect();

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"sxgpu")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| vk_error("vkCreateInstance", e))?;
        let surface = ash::khr::surface::Instance::new(&entry, &instance);

        info!(
            "created Vulkan instance (API {}.{}, validation {})",
            major,
            minor,
            if layers.is_empty() { "off" } else { "on" }
        );

        Ok(Self {
            entry,
            instance,
            surface,
            api_version,
            validation: !layers.is_empty(),
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }

    pub fn validation_enabled(&self) -> bool {
        self.validation
    }

    fn describe(
        &self,
        index: usize,
        pd: vk::PhysicalDevice,
        surface: Option<vk::SurfaceKHR>,
    ) -> GpuResult<PhysicalDeviceInfo> {
        let instance = &self.instance;
        let props = unsafe { instance.get_physical_device_properties(pd) };
        let mem_props = unsafe { instance.get_physical_device_memory_properties(pd) };

        let name = props
            .device_name_as_c_str()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|_| format!("device {}", index));

        let extensions: Vec<String> = unsafe { instance.enumerate_device_extension_properties(pd) }
            .map_err(|e| vk_error("vkEnumerateDeviceExtensionProperties", e))?
            .iter()
            .filter_map(|p| p.extension_name_as_c_str().ok())
            .map(|s| s.to_string_lossy().into_owned())
            .collect();

        let features = self.query_features(pd, props.api_version, &extensions);

        let limits = DeviceLimits {
            min_storage_buffer_offset_alignment: props.limits.min_storage_buffer_offset_alignment,
            min_uniform_buffer_offset_alignment: props.limits.min_uniform_buffer_offset_alignment,
            max_image_dimension_2d: props.limits.max_image_dimension2_d,
            max_image_array_layers: props.limits.max_image_array_layers,
            timestamp_period: props.limits.timestamp_period,
            timestamp_compute_and_graphics: props.limits.timestamp_compute_and_graphics != vk::FALSE,
        };

        let memory_types = (0..mem_props.memory_type_count as usize)
            .map(|i| {
                let ty = mem_props.memory_types[i];
                MemoryTypeInfo {
                    flags: ty.property_flags,
                    heap_index: ty.heap_index,
                }
            })
            .collect();
        let memory_heaps = (0..mem_props.memory_heap_count as usize)
            .map(|i| {
                let heap = mem_props.memory_heaps[i];
                MemoryHeapInfo {
                    size: heap.size,
                    device_local: heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
                }
            })
            .collect();

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(pd) }
            .iter()
            .enumerate()
            .map(|(i, family)| {
                let present = match surface {
                    Some(surface) => unsafe {
                        self.surface
                            .get_physical_device_surface_support(pd, i as u32, surface)
                    }
                    .unwrap_or_else(|e| {
                        warn!("surface support query failed for '{}' family {}: {:?}", name, i, e);
                        false
                    }),
                    None => false,
                };
                QueueFamilyInfo {
                    index: i as u32,
                    flags: family.queue_flags,
                    queue_count: family.queue_count,
                    timestamp_valid_bits: family.timestamp_valid_bits,
                    present,
                }
            })
            .collect();

        let surface_support = surface.and_then(|surface| match self.surface_support(pd, surface) {
            Ok(support) => Some(support),
            Err(e) => {
                warn!("surface capability query failed for '{}': {}", name, e);
                None
            }
        });

        let depth_format = DEPTH_FORMAT_CANDIDATES.iter().copied().find(|&format| {
            let props = unsafe { instance.get_physical_device_format_properties(pd, format) };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        });

        Ok(PhysicalDeviceInfo {
            index,
            raw: pd,
            name,
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            device_type: props.device_type,
            api_version: props.api_version,
            driver_version: props.driver_version,
            limits,
            features,
            memory_types,
            memory_heaps,
            queue_families,
            surface: surface_support,
            extensions,
            depth_format,
        })
    }

    fn query_features(&self, pd: vk::PhysicalDevice, api_version: u32, extensions: &[String]) -> DeviceFeatures {
        if api_version < vk::API_VERSION_1_2 {
            let base = unsafe { self.instance.get_physical_device_features(pd) };
            return DeviceFeatures {
                sampler_anisotropy: base.sampler_anisotropy != vk::FALSE,
                ..DeviceFeatures::default()
            };
        }

        let has_1_3 = api_version >= vk::API_VERSION_1_3;
        let has_as = extensions.iter().any(|e| e == ACCELERATION_STRUCTURE_EXTENSION);

        let mut vk12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut vk13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vk12);
        if has_1_3 {
            features2 = features2.push_next(&mut vk13);
        }
        if has_as {
            features2 = features2.push_next(&mut accel);
        }
        unsafe { self.instance.get_physical_device_features2(pd, &mut features2) };
        let base = features2.features;

        DeviceFeatures {
            descriptor_indexing: vk12.descriptor_indexing != vk::FALSE
                && vk12.runtime_descriptor_array != vk::FALSE
                && vk12.descriptor_binding_partially_bound != vk::FALSE,
            buffer_device_address: vk12.buffer_device_address != vk::FALSE,
            timeline_semaphore: vk12.timeline_semaphore != vk::FALSE,
            dynamic_rendering: has_1_3 && vk13.dynamic_rendering != vk::FALSE,
            synchronization2: has_1_3 && vk13.synchronization2 != vk::FALSE,
            sampler_anisotropy: base.sampler_anisotropy != vk::FALSE,
            acceleration_structure: has_as && accel.acceleration_structure != vk::FALSE,
        }
    }

    fn surface_support(&self, pd: vk::PhysicalDevice, surface: vk::SurfaceKHR) -> GpuResult<SurfaceSupport> {
        unsafe {
            let capabilities = self
                .surface
                .get_physical_device_surface_capabilities(pd, surface)
                .map_err(|e| vk_error("vkGetPhysicalDeviceSurfaceCapabilitiesKHR", e))?;
            let formats = self
                .surface
                .get_physical_device_surface_formats(pd, surface)
                .map_err(|e| vk_error("vkGetPhysicalDeviceSurfaceFormatsKHR", e))?;
            let present_modes = self
                .surface
                .get_physical_device_surface_present_modes(pd, surface)
                .map_err(|e| vk_error("vkGetPhysicalDeviceSurfacePresentModesKHR", e))?;
            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }
}

impl DeviceSource for VulkanInstance {
    fn enumerate_devices(&self, surface: Option<vk::SurfaceKHR>) -> GpuResult<Vec<PhysicalDeviceInfo>> {
        let physical_devices = unsafe { self.instance.enumerate_physical_devices() }
            .map_err(|e| vk_error("vkEnumeratePhysicalDevices", e))?;
        let mut devices = Vec::with_capacity(physical_devices.len());
        for (index, &pd) in physical_devices.iter().enumerate() {
            let info = self.describe(index, pd, surface)?;
            debug!(
                "physical device {}: {} ({:04x}:{:04x}), {} extension(s)",
                index,
                info.name,
                info.vendor_id,
                info.device_id,
                info.extensions.len()
            );
            devices.push(info);
        }
        Ok(devices)
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe { self.instance.destroy_instance(None) };
        debug!("destroyed Vulkan instance");
    }
}

fn available_layers(entry: &ash::Entry) -> GpuResult<Vec<String>> {
    Ok(unsafe { entry.enumerate_instance_layer_properties() }
        .map_err(|e| vk_error("vkEnumerateInstanceLayerProperties", e))?
        .iter()
        .filter_map(|p| p.layer_name_as_c_str().ok())
        .map(|s| s.to_string_lossy().into_owned())
        .collect())
}

fn available_instance_extensions(entry: &ash::Entry) -> GpuResult<Vec<String>> {
    Ok(unsafe { entry.enumerate_instance_extension_properties(None) }
        .map_err(|e| vk_error("vkEnumerateInstanceExtensionProperties", e))?
        .iter()
        .filter_map(|p| p.extension_name_as_c_str().ok())
        .map(|s| s.to_string_lossy().into_owned())
        .collect())
}

/// Layers the installed loader reports, for diagnostics. Empty if the loader
/// cannot be opened.
pub fn installed_layers() -> Vec<String> {
    match unsafe { ash::Entry::load() } {
        Ok(entry) => available_layers(&entry).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

pub(crate) fn to_cstring(s: &str) -> GpuResult<CString> {
    CString::new(s).map_err(|_| GpuError::InvalidArgument(format!("'{}' contains a NUL byte", s)))
}
