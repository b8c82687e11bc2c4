use ash::vk;
use tracing::{debug, info, warn};

use sxgpu_core::config::DevicePreference;
use sxgpu_core::{GpuError, GpuResult};

use crate::backend::DeviceSource;
use crate::capability::{CapabilityChecker, DeviceRequirements};
use crate::device_info::{PhysicalDeviceInfo, QueueFamilyIndices};

/// Enumerates physical devices once and picks the one the rest of the
/// system runs on. Never allocates GPU memory.
pub struct DeviceSelector {
    devices: Vec<PhysicalDeviceInfo>,
    checker: CapabilityChecker,
    preference: DevicePreference,
    selected: Option<usize>,
    require_present: bool,
}

impl DeviceSelector {
    /// Snapshot every device exposed by `source`, with presentation support
    /// against `surface` when one is given.
    pub fn init(
        source: &dyn DeviceSource,
        surface: Option<vk::SurfaceKHR>,
        requirements: DeviceRequirements,
        preference: DevicePreference,
    ) -> GpuResult<Self> {
        let devices = source.enumerate_devices(surface)?;
        info!("enumerated {} physical device(s)", devices.len());
        for d in &devices {
            debug!(
                "device {}: {} ({}, {}, API {}, {} MB device-local, {} queue families)",
                d.index,
                d.name,
                d.vendor_name(),
                d.type_name(),
                d.api_version_string(),
                d.device_local_memory() / (1024 * 1024),
                d.queue_families.len()
            );
        }
        Ok(Self::from_devices(devices, requirements, preference))
    }

    pub fn from_devices(
        devices: Vec<PhysicalDeviceInfo>,
        requirements: DeviceRequirements,
        preference: DevicePreference,
    ) -> Self {
        Self {
            devices,
            checker: CapabilityChecker::new(requirements),
            preference,
            selected: None,
            require_present: false,
        }
    }

    pub fn devices(&self) -> &[PhysicalDeviceInfo] {
        &self.devices
    }

    /// Pick the best device with a queue family supporting every bit of
    /// `required_queue` (and presentation when asked). Devices failing the
    /// capability check are never considered. Among the rest the preferred
    /// device type wins, then discrete over integrated, then more
    /// device-local memory, then enumeration order.
    pub fn select_device(&mut self, required_queue: vk::QueueFlags, require_present: bool) -> GpuResult<usize> {
        let mut best: Option<(usize, (u32, u32, u64))> = None;
        let mut reasons = Vec::new();

        for (position, device) in self.devices.iter().enumerate() {
            if let Err(reason) = self.checker.check_queues(device, required_queue, require_present) {
                debug!("rejected device {} ({}): {}", device.index, device.name, reason);
                reasons.push(format!("{}: {}", device.name, reason));
                continue;
            }
            let score = self.score(device);
            // Strictly greater keeps the earlier device on a full tie.
            if best.map_or(true, |(_, b)| score > b) {
                best = Some((position, score));
            }
        }

        match best {
            Some((position, _)) => {
                let device = &self.devices[position];
                info!(
                    "selected device {}: {} ({}, {})",
                    device.index,
                    device.name,
                    device.vendor_name(),
                    device.type_name()
                );
                self.selected = Some(position);
                self.require_present = require_present;
                Ok(device.index)
            }
            None => {
                warn!("no suitable device for {:?} (present: {})", required_queue, require_present);
                let detail = if reasons.is_empty() {
                    "no physical devices".to_string()
                } else {
                    reasons.join("; ")
                };
                Err(GpuError::NoSuitableDevice(detail))
            }
        }
    }

    /// The chosen device. Calling this before a successful
    /// `select_device` is a bug.
    pub fn selected(&self) -> &PhysicalDeviceInfo {
        assert!(self.selected.is_some(), "DeviceSelector::selected() before select_device()");
        &self.devices[self.selected.unwrap_or_default()]
    }

    pub fn try_selected(&self) -> Option<&PhysicalDeviceInfo> {
        self.selected.map(|i| &self.devices[i])
    }

    /// Queue family indices for the selected device.
    pub fn queue_families(&self) -> GpuResult<QueueFamilyIndices> {
        let device = self
            .try_selected()
            .ok_or_else(|| GpuError::InvalidState("no device selected".into()))?;
        QueueFamilyIndices::resolve(device, self.require_present).ok_or_else(|| {
            GpuError::NoSuitableDevice(format!("'{}' has no usable graphics queue family", device.name))
        })
    }

    fn score(&self, device: &PhysicalDeviceInfo) -> (u32, u32, u64) {
        let rank = match (self.preference, device.device_type) {
            (DevicePreference::Any, _) => 0,
            (DevicePreference::Discrete, vk::PhysicalDeviceType::DISCRETE_GPU)
            | (DevicePreference::Integrated, vk::PhysicalDeviceType::INTEGRATED_GPU) => 2,
            (_, vk::PhysicalDeviceType::DISCRETE_GPU | vk::PhysicalDeviceType::INTEGRATED_GPU) => 1,
            _ => 0,
        };
        let type_tiebreak = match device.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 4,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
            vk::PhysicalDeviceType::CPU => 1,
            _ => 0,
        };
        (rank, type_tiebreak, device.device_local_memory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::synthetic_device;

    fn requirements() -> DeviceRequirements {
        DeviceRequirements {
            min_api_version: vk::make_api_version(0, 1, 2, 0),
            extensions: vec!["VK_KHR_swapchain".into()],
            require_descriptor_indexing: true,
        }
    }

    fn indexed(mut devices: Vec<PhysicalDeviceInfo>) -> Vec<PhysicalDeviceInfo> {
        for (i, d) in devices.iter_mut().enumerate() {
            d.index = i;
        }
        devices
    }

    #[test]
    fn discrete_wins_tie() {
        let devices = indexed(vec![
            synthetic_device("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, &[vk::QueueFlags::GRAPHICS]),
            synthetic_device("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]),
        ]);
        let mut selector = DeviceSelector::from_devices(devices, requirements(), DevicePreference::Any);
        assert_eq!(selector.select_device(vk::QueueFlags::GRAPHICS, false).unwrap(), 1);
        assert_eq!(selector.selected().name, "dgpu");
    }

    #[test]
    fn integrated_preference() {
        let devices = indexed(vec![
            synthetic_device("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]),
            synthetic_device("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, &[vk::QueueFlags::GRAPHICS]),
        ]);
        let mut selector = DeviceSelector::from_devices(devices, requirements(), DevicePreference::Integrated);
        assert_eq!(selector.select_device(vk::QueueFlags::GRAPHICS, false).unwrap(), 1);
    }

    #[test]
    fn missing_extension_rejects_otherwise_best_device() {
        let mut dgpu = synthetic_device("dgpu", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]);
        dgpu.extensions.clear();
        let igpu = synthetic_device("igpu", vk::PhysicalDeviceType::INTEGRATED_GPU, &[vk::QueueFlags::GRAPHICS]);
        let mut selector =
            DeviceSelector::from_devices(indexed(vec![dgpu, igpu]), requirements(), DevicePreference::Discrete);
        assert_eq!(selector.select_device(vk::QueueFlags::GRAPHICS, false).unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "before select_device")]
    fn selected_asserts_prior_selection() {
        let selector = DeviceSelector::from_devices(Vec::new(), requirements(), DevicePreference::Any);
        let _ = selector.selected();
    }

    #[test]
    fn empty_device_list_fails() {
        let mut selector = DeviceSelector::from_devices(Vec::new(), requirements(), DevicePreference::Any);
        match selector.select_device(vk::QueueFlags::GRAPHICS, false) {
            Err(GpuError::NoSuitableDevice(msg)) => assert_eq!(msg, "no physical devices"),
            other => panic!("expected NoSuitableDevice, got {:?}", other),
        }
        assert!(selector.queue_families().is_err());
    }
}
