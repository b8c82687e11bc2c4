//! Integration test: device enumeration and selection through the
//! `DeviceSource` seam, using synthetic devices.
//!
//! Run with: cargo test -p sxgpu-render --test device_selection_test -- --nocapture

use ash::vk::{self, Handle};
use sxgpu_core::config::{DeviceConfig, DevicePreference};
use sxgpu_render::capability::DeviceRequirements;
use sxgpu_render::headless::{synthetic_device, HeadlessInstance};
use sxgpu_render::{DeviceSelector, GpuError, QueueFamilyIndices};

fn requirements() -> DeviceRequirements {
    let mut config = DeviceConfig::default();
    config.required_extensions = vec!["VK_KHR_swapchain".to_string()];
    DeviceRequirements::from_config(&config).unwrap()
}

fn surface() -> Option<vk::SurfaceKHR> {
    Some(vk::SurfaceKHR::from_raw(0x5eed))
}

#[test]
fn test_only_compute_capable_device_is_chosen() {
    let instance = HeadlessInstance::new(vec![
        synthetic_device("copy engine", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::TRANSFER]),
        synthetic_device(
            "compute card",
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            &[vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER],
        ),
    ]);
    let mut selector =
        DeviceSelector::init(&instance, None, requirements(), DevicePreference::Discrete).unwrap();
    assert_eq!(selector.devices().len(), 2);

    let index = selector.select_device(vk::QueueFlags::COMPUTE, false).unwrap();
    assert_eq!(index, 1);
    assert_eq!(selector.selected().name, "compute card");
    println!("selected {} ({})", selector.selected().name, selector.selected().type_name());
}

#[test]
fn test_no_device_with_requested_queue() {
    let instance = HeadlessInstance::new(vec![synthetic_device(
        "copy engine",
        vk::PhysicalDeviceType::DISCRETE_GPU,
        &[vk::QueueFlags::TRANSFER],
    )]);
    let mut selector = DeviceSelector::init(&instance, None, requirements(), DevicePreference::Any).unwrap();

    match selector.select_device(vk::QueueFlags::GRAPHICS, false) {
        Err(e @ GpuError::NoSuitableDevice(_)) => {
            assert!(e.to_string().contains("copy engine"));
            assert!(e.is_fatal());
        }
        other => panic!("expected NoSuitableDevice, got {:?}", other),
    }
    assert!(selector.try_selected().is_none());
}

#[test]
fn test_presentation_needs_a_surface() {
    let instance = HeadlessInstance::new(vec![synthetic_device(
        "gpu",
        vk::PhysicalDeviceType::DISCRETE_GPU,
        &[vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER],
    )]);

    // Without a surface no family can present.
    let mut selector = DeviceSelector::init(&instance, None, requirements(), DevicePreference::Any).unwrap();
    assert!(selector.devices()[0].surface.is_none());
    assert!(selector.select_device(vk::QueueFlags::GRAPHICS, true).is_err());
    assert!(selector.select_device(vk::QueueFlags::GRAPHICS, false).is_ok());

    let mut selector = DeviceSelector::init(&instance, surface(), requirements(), DevicePreference::Any).unwrap();
    selector.select_device(vk::QueueFlags::GRAPHICS, true).unwrap();
    let support = selector.selected().surface.as_ref().expect("surface support");
    assert!(!support.formats.is_empty());
    assert_eq!(selector.queue_families().unwrap().present, Some(0));
}

#[test]
fn test_dedicated_queue_families_resolved() {
    let instance = HeadlessInstance::new(vec![synthetic_device(
        "desktop gpu",
        vk::PhysicalDeviceType::DISCRETE_GPU,
        &[
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::TRANSFER,
        ],
    )]);
    let mut selector =
        DeviceSelector::init(&instance, surface(), requirements(), DevicePreference::Discrete).unwrap();
    selector.select_device(vk::QueueFlags::GRAPHICS, true).unwrap();

    assert_eq!(
        selector.queue_families().unwrap(),
        QueueFamilyIndices {
            graphics: 0,
            compute: 1,
            transfer: 2,
            present: Some(0),
        }
    );
}

#[test]
fn test_old_api_and_missing_extensions_rejected() {
    let mut old = synthetic_device("old", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]);
    old.api_version = vk::make_api_version(0, 1, 1, 0);
    let mut bare = synthetic_device("bare", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]);
    bare.extensions.clear();
    let mut no_indexing =
        synthetic_device("no indexing", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]);
    no_indexing.features.descriptor_indexing = false;
    let fallback = synthetic_device("cpu", vk::PhysicalDeviceType::CPU, &[vk::QueueFlags::GRAPHICS]);

    let instance = HeadlessInstance::new(vec![old, bare, no_indexing, fallback]);
    let mut selector =
        DeviceSelector::init(&instance, None, requirements(), DevicePreference::Discrete).unwrap();
    assert_eq!(selector.select_device(vk::QueueFlags::GRAPHICS, false).unwrap(), 3);
}

#[test]
fn test_more_device_memory_breaks_ties() {
    let small = synthetic_device("small", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]);
    let mut large = synthetic_device("large", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]);
    large.memory_heaps[0].size = 24 << 30;
    let twin = synthetic_device("small twin", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]);

    let instance = HeadlessInstance::new(vec![small, large, twin]);
    let mut selector =
        DeviceSelector::init(&instance, None, requirements(), DevicePreference::Discrete).unwrap();
    assert_eq!(selector.select_device(vk::QueueFlags::GRAPHICS, false).unwrap(), 1);

    // A full tie goes to the first enumerated device.
    let instance = HeadlessInstance::new(vec![
        synthetic_device("first", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]),
        synthetic_device("second", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]),
    ]);
    let mut selector = DeviceSelector::init(&instance, None, requirements(), DevicePreference::Any).unwrap();
    assert_eq!(selector.select_device(vk::QueueFlags::GRAPHICS, false).unwrap(), 0);
}
