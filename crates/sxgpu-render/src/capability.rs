use ash::vk;
use tracing::debug;

use sxgpu_core::config::DeviceConfig;
use sxgpu_core::{GpuError, GpuResult};

use crate::device_info::{format_api_version, PhysicalDeviceInfo};

/// What a device must offer before it is considered at all.
#[derive(Debug, Clone)]
pub struct DeviceRequirements {
    /// Packed with `vk::make_api_version`
    pub min_api_version: u32,
    pub extensions: Vec<String>,
    pub require_descriptor_indexing: bool,
}

impl DeviceRequirements {
    pub fn from_config(config: &DeviceConfig) -> GpuResult<Self> {
        let (major, minor) = config.api_version()?;
        Ok(Self {
            min_api_version: vk::make_api_version(0, major, minor, 0),
            extensions: config.required_extensions.clone(),
            require_descriptor_indexing: true,
        })
    }
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            min_api_version: vk::make_api_version(0, 1, 2, 0),
            extensions: Vec::new(),
            require_descriptor_indexing: true,
        }
    }
}

/// Why a device was turned down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("API version {found} is below required {required}")]
    ApiVersion { required: String, found: String },

    #[error("missing extensions: {}", .0.join(", "))]
    MissingExtensions(Vec<String>),

    #[error("missing feature: {0}")]
    MissingFeature(&'static str),

    #[error("no queue family with {0}")]
    NoQueueFamily(String),
}

impl From<Rejection> for GpuError {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::ApiVersion { required, found } => {
                GpuError::UnsupportedApiVersion { required, found }
            }
            Rejection::MissingExtensions(names) => GpuError::MissingExtension(names.join(", ")),
            other => GpuError::NoSuitableDevice(other.to_string()),
        }
    }
}

/// Checks devices and instance layers against fixed requirements.
pub struct CapabilityChecker {
    requirements: DeviceRequirements,
}

impl CapabilityChecker {
    pub fn new(requirements: DeviceRequirements) -> Self {
        Self { requirements }
    }

    pub fn requirements(&self) -> &DeviceRequirements {
        &self.requirements
    }

    pub fn check_api_version(&self, found: u32) -> Result<(), Rejection> {
        // Compare without the variant/patch bits.
        let major_minor = |v: u32| (vk::api_version_major(v), vk::api_version_minor(v));
        if major_minor(found) < major_minor(self.requirements.min_api_version) {
            return Err(Rejection::ApiVersion {
                required: format_api_version(self.requirements.min_api_version),
                found: format_api_version(found),
            });
        }
        Ok(())
    }

    pub fn missing_extensions(&self, available: &[String]) -> Vec<String> {
        missing_names(&self.requirements.extensions, available)
    }

    /// Full device check, excluding queue capability which depends on the
    /// selection request.
    pub fn check_device(&self, info: &PhysicalDeviceInfo) -> Result<(), Rejection> {
        self.check_api_version(info.api_version)?;
        let missing = self.missing_extensions(&info.extensions);
        if !missing.is_empty() {
            return Err(Rejection::MissingExtensions(missing));
        }
        if self.requirements.require_descriptor_indexing && !info.features.descriptor_indexing {
            return Err(Rejection::MissingFeature("descriptor indexing"));
        }
        Ok(())
    }

    /// Device check plus a queue family with `queue_flags` (and presentation).
    pub fn check_queues(
        &self,
        info: &PhysicalDeviceInfo,
        queue_flags: vk::QueueFlags,
        require_present: bool,
    ) -> Result<(), Rejection> {
        self.check_device(info)?;
        if !info.supports_queue(queue_flags, require_present) {
            let what = if require_present {
                format!("{:?} and presentation", queue_flags)
            } else {
                format!("{:?}", queue_flags)
            };
            debug!("device {} ({}) rejected: no queue family with {}", info.index, info.name, what);
            return Err(Rejection::NoQueueFamily(what));
        }
        Ok(())
    }
}

/// Instance-level check: every required layer must be available.
pub fn missing_layers(required: &[String], available: &[String]) -> Vec<String> {
    missing_names(required, available)
}

fn missing_names(required: &[String], available: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|r| !available.iter().any(|a| a == *r))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_info::{DeviceFeatures, DeviceLimits, QueueFamilyInfo};

    fn info(api: u32, extensions: &[&str], descriptor_indexing: bool) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            index: 0,
            raw: vk::PhysicalDevice::null(),
            name: "checked".into(),
            vendor_id: 0x1002,
            device_id: 2,
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: api,
            driver_version: 0,
            limits: DeviceLimits::default(),
            features: DeviceFeatures {
                descriptor_indexing,
                ..Default::default()
            },
            memory_types: Vec::new(),
            memory_heaps: Vec::new(),
            queue_families: vec![QueueFamilyInfo {
                index: 0,
                flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                queue_count: 1,
                timestamp_valid_bits: 64,
                present: false,
            }],
            surface: None,
            extensions: extensions.iter().map(|s| s.to_string()).collect(),
            depth_format: None,
        }
    }

    fn checker(extensions: &[&str]) -> CapabilityChecker {
        CapabilityChecker::new(DeviceRequirements {
            min_api_version: vk::make_api_version(0, 1, 3, 0),
            extensions: extensions.iter().map(|s| s.to_string()).collect(),
            require_descriptor_indexing: true,
        })
    }

    #[test]
    fn old_api_version_is_rejected() {
        let c = checker(&[]);
        let old = info(vk::make_api_version(0, 1, 2, 189), &[], true);
        assert!(matches!(c.check_device(&old), Err(Rejection::ApiVersion { .. })));
        let new = info(vk::make_api_version(0, 1, 3, 0), &[], true);
        assert!(c.check_device(&new).is_ok());
    }

    #[test]
    fn missing_extension_is_named() {
        let c = checker(&["VK_KHR_swapchain", "VK_KHR_dynamic_rendering"]);
        let dev = info(vk::make_api_version(0, 1, 3, 0), &["VK_KHR_swapchain"], true);
        match c.check_device(&dev) {
            Err(Rejection::MissingExtensions(names)) => {
                assert_eq!(names, vec!["VK_KHR_dynamic_rendering".to_string()])
            }
            other => panic!("expected MissingExtensions, got {:?}", other),
        }
    }

    #[test]
    fn queue_and_present_requirements() {
        let c = checker(&[]);
        let dev = info(vk::make_api_version(0, 1, 3, 0), &[], true);
        assert!(c.check_queues(&dev, vk::QueueFlags::COMPUTE, false).is_ok());
        assert!(matches!(
            c.check_queues(&dev, vk::QueueFlags::GRAPHICS, true),
            Err(Rejection::NoQueueFamily(_))
        ));
        let no_indexing = info(vk::make_api_version(0, 1, 3, 0), &[], false);
        assert_eq!(
            c.check_device(&no_indexing),
            Err(Rejection::MissingFeature("descriptor indexing"))
        );
    }

    #[test]
    fn layer_check() {
        let required = vec!["VK_LAYER_KHRONOS_validation".to_string()];
        assert_eq!(missing_layers(&required, &[]), required);
        assert!(missing_layers(&required, &required).is_empty());
    }

    #[test]
    fn rejection_maps_to_setup_fatal_errors() {
        let e: GpuError = Rejection::MissingExtensions(vec!["VK_KHR_swapchain".into()]).into();
        assert!(matches!(e, GpuError::MissingExtension(_)));
        assert!(e.is_fatal());
    }
}
