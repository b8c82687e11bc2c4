//! Vulkan backend: `ash` for the API, `gpu-allocator` for memory.

mod device;
mod instance;

use std::sync::Arc;

use ash::vk;
use tracing::info;

use sxgpu_core::{GpuConfig, GpuError, GpuResult};

use crate::capability::DeviceRequirements;
use crate::device_selector::DeviceSelector;

pub use device::VulkanDevice;
pub use instance::{installed_layers, VulkanInstance};

/// Depth formats checked at enumeration, in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Everything created during Vulkan startup.
pub struct VulkanSetup {
    pub instance: Arc<VulkanInstance>,
    pub selector: DeviceSelector,
    pub device: Arc<VulkanDevice>,
}

/// Create the instance, select a device offering `required_queue` (and
/// presentation when a surface is given) and create the logical device.
pub fn bootstrap(
    config: &GpuConfig,
    surface: Option<vk::SurfaceKHR>,
    required_queue: vk::QueueFlags,
) -> GpuResult<VulkanSetup> {
    config.validate()?;
    let instance = Arc::new(VulkanInstance::new(&config.device)?);
    let mut selector = DeviceSelector::init(
        instance.as_ref(),
        surface,
        DeviceRequirements::from_config(&config.device)?,
        config.device.preference,
    )?;
    selector.select_device(required_queue, surface.is_some())?;
    let families = selector.queue_families()?;
    let device = Arc::new(VulkanDevice::new(
        instance.clone(),
        selector.selected().clone(),
        families,
        config,
    )?);
    info!("Vulkan backend ready on '{}'", selector.selected().name);
    Ok(VulkanSetup {
        instance,
        selector,
        device,
    })
}

/// Map a Vulkan result code onto the error taxonomy.
pub(crate) fn vk_error(context: &str, result: vk::Result) -> GpuError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost(context.to_string()),
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GpuError::AllocationFailure(format!("{}: {:?}", context, result))
        }
        vk::Result::ERROR_EXTENSION_NOT_PRESENT => GpuError::MissingExtension(context.to_string()),
        vk::Result::ERROR_LAYER_NOT_PRESENT => GpuError::MissingLayer(context.to_string()),
        vk::Result::ERROR_INCOMPATIBLE_DRIVER => GpuError::UnsupportedApiVersion {
            required: context.to_string(),
            found: "incompatible driver".to_string(),
        },
        _ => GpuError::Backend(format!("{}: {:?}", context, result)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_map_to_taxonomy() {
        assert!(matches!(
            vk_error("wait", vk::Result::ERROR_DEVICE_LOST),
            GpuError::DeviceLost(_)
        ));
        assert!(matches!(
            vk_error("alloc", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            GpuError::AllocationFailure(_)
        ));
        assert!(matches!(
            vk_error("submit", vk::Result::ERROR_UNKNOWN),
            GpuError::Backend(_)
        ));
    }
}
