use ash::vk;
use serde::Serialize;

use sxgpu_common::platform::{platform_name, vulkan_loader_name};
use sxgpu_core::config::GpuConfig;
use sxgpu_render::capability::{missing_layers, CapabilityChecker, DeviceRequirements};
use sxgpu_render::vulkan::{installed_layers, VulkanInstance};
use sxgpu_render::{DeviceSelector, DeviceSource, PhysicalDeviceInfo};

/// Outcome of one verification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Status {
    Pass,
    Fail,
    Warn,
    Skip,
}

impl Status {
    fn label(self) -> &'static str {
        match self {
            Status::Pass => "ok",
            Status::Fail => "FAILED",
            Status::Warn => "warning",
            Status::Skip => "skipped",
        }
    }

    /// ANSI color code for terminal output.
    fn color(self) -> u8 {
        match self {
            Status::Pass => 32,
            Status::Fail => 31,
            Status::Warn => 33,
            Status::Skip => 90,
        }
    }
}

#[derive(Debug, Serialize)]
struct Check {
    name: &'static str,
    status: Status,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl Check {
    fn new(name: &'static str, status: Status, message: impl Into<String>) -> Self {
        Self {
            name,
            status,
            message: message.into(),
            details: Vec::new(),
        }
    }

    fn with(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }
}

/// Ordered results of every check that ran.
#[derive(Debug, Default, Serialize)]
#[serde(transparent)]
struct Report {
    checks: Vec<Check>,
}

impl Report {
    fn push(&mut self, check: Check) {
        self.checks.push(check);
    }

    fn has_failures(&self) -> bool {
        self.count(Status::Fail) > 0
    }

    fn count(&self, status: Status) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    fn print(&self) {
        println!("sxgpu verify ({})", platform_name());
        for check in &self.checks {
            println!(
                "\x1b[{}m{:>8}\x1b[0m  {}: {}",
                check.status.color(),
                check.status.label(),
                check.name,
                check.message
            );
            for detail in &check.details {
                println!("{:>10}{}", "", detail);
            }
        }
        println!(
            "{} ok, {} failed, {} warnings, {} skipped",
            self.count(Status::Pass),
            self.count(Status::Fail),
            self.count(Status::Warn),
            self.count(Status::Skip)
        );
    }
}

pub fn run_verify(config_path: &str, json: bool) -> anyhow::Result<()> {
    let mut report = Report::default();

    let config = check_config(config_path, &mut report);
    check_layers(&config, &installed_layers(), &mut report);
    match check_instance(&config, &mut report) {
        Some(devices) => check_devices(&config, devices, &mut report),
        None => report.push(Check::new(
            "Device selection",
            Status::Skip,
            "No Vulkan instance, cannot enumerate devices",
        )),
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print();
    }
    if report.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

fn check_config(config_path: &str, report: &mut Report) -> GpuConfig {
    if !std::path::Path::new(config_path).exists() {
        report.push(
            Check::new("Configuration", Status::Warn, format!("{} not found", config_path))
                .with("Using default configuration"),
        );
        return GpuConfig::default();
    }

    match GpuConfig::load(config_path) {
        Ok(config) => {
            report.push(
                Check::new("Configuration", Status::Pass, format!("Loaded from {}", config_path))
                    .with(format!(
                        "{} frames in flight, {} KiB staging per queue per frame",
                        config.frames.frames_in_flight,
                        config.frames.staging_buffer_size / 1024
                    ))
                    .with(format!(
                        "Bindless slots: {} buffers, {} images, {} acceleration structures",
                        config.bindless.buffer_capacity,
                        config.bindless.image_capacity,
                        config.bindless.acceleration_structure_capacity
                    ))
                    .with(format!(
                        "Memory warning at {:.0}% of budget",
                        config.memory.warning_threshold * 100.0
                    )),
            );
            config
        }
        Err(e) => {
            report.push(
                Check::new("Configuration", Status::Fail, e.to_string())
                    .with("Remaining checks use the default configuration"),
            );
            GpuConfig::default()
        }
    }
}

fn check_layers(config: &GpuConfig, available: &[String], report: &mut Report) {
    const NAME: &str = "Validation layers";
    if !config.device.enable_validation {
        report.push(Check::new(NAME, Status::Skip, "Validation disabled"));
        return;
    }

    let missing = missing_layers(&config.device.validation_layers, available);
    let check = if missing.is_empty() {
        config.device.validation_layers.iter().fold(
            Check::new(NAME, Status::Pass, format!("{} layer(s) available", config.device.validation_layers.len())),
            |check, layer| check.with(layer.as_str()),
        )
    } else {
        Check::new(NAME, Status::Fail, format!("Missing: {}", missing.join(", ")))
            .with("Install the Vulkan SDK or set device.enable_validation = false")
    };
    report.push(check);
}

fn check_instance(config: &GpuConfig, report: &mut Report) -> Option<Vec<PhysicalDeviceInfo>> {
    const NAME: &str = "Vulkan instance";
    // Layers were checked separately.
    let mut device_config = config.device.clone();
    device_config.enable_validation = false;

    let instance = match VulkanInstance::new(&device_config) {
        Ok(instance) => instance,
        Err(e) => {
            report.push(
                Check::new(NAME, Status::Fail, format!("Cannot create instance: {}", e))
                    .with(format!("Expected loader {} on {}", vulkan_loader_name(), platform_name())),
            );
            return None;
        }
    };

    match instance.enumerate_devices(None) {
        Ok(devices) => {
            let version = instance.api_version();
            report.push(
                Check::new(
                    NAME,
                    Status::Pass,
                    format!(
                        "API {}.{}",
                        vk::api_version_major(version),
                        vk::api_version_minor(version)
                    ),
                )
                .with(format!("{} physical device(s)", devices.len())),
            );
            Some(devices)
        }
        Err(e) => {
            report.push(Check::new(NAME, Status::Fail, format!("Cannot enumerate devices: {}", e)));
            None
        }
    }
}

fn check_devices(config: &GpuConfig, devices: Vec<PhysicalDeviceInfo>, report: &mut Report) {
    let requirements = match DeviceRequirements::from_config(&config.device) {
        Ok(r) => r,
        Err(e) => {
            report.push(Check::new("Device requirements", Status::Fail, e.to_string()));
            return;
        }
    };

    let checker = CapabilityChecker::new(requirements.clone());
    let mut suitable = 0usize;
    let verdicts: Vec<String> = devices
        .iter()
        .map(|d| match checker.check_device(d) {
            Ok(()) => {
                suitable += 1;
                format!("GPU {}: {} ({}) - ok", d.index, d.name, d.type_name())
            }
            Err(reason) => format!("GPU {}: {} - {}", d.index, d.name, reason),
        })
        .collect();
    let (status, message) = match suitable {
        0 => (Status::Fail, "No device meets the requirements".to_string()),
        n if n < devices.len() => (Status::Warn, format!("{} of {} device(s) qualify", n, devices.len())),
        n => (Status::Pass, format!("All {} device(s) qualify", n)),
    };
    report.push(
        verdicts
            .into_iter()
            .fold(Check::new("Device requirements", status, message), Check::with),
    );

    let mut selector = DeviceSelector::from_devices(devices, requirements, config.device.preference);
    if let Err(e) = selector.select_device(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, false) {
        report.push(Check::new("Device selection", Status::Fail, e.to_string()));
        return;
    }
    let selected = selector.selected();
    let mut check = Check::new(
        "Device selection",
        Status::Pass,
        format!("Selected '{}' ({})", selected.name, selected.type_name()),
    )
    .with(format!(
        "API {}, {} MB device-local",
        selected.api_version_string(),
        selected.device_local_memory() / (1024 * 1024)
    ));
    if let Ok(families) = selector.queue_families() {
        check = check.with(format!(
            "Queue families: graphics {}, compute {}, transfer {}",
            families.graphics, families.compute, families.transfer
        ));
    }
    if !selected.features.acceleration_structure {
        check = check.with("No acceleration structure support");
    }
    report.push(check);
}

#[cfg(test)]
mod tests {
    use super::*;
    use sxgpu_render::headless::synthetic_device;

    #[test]
    fn test_missing_config_warns_and_uses_defaults() {
        let mut report = Report::default();
        let config = check_config("/nonexistent/sxgpu.toml", &mut report);
        assert_eq!(report.checks[0].status, Status::Warn);
        assert_eq!(config.frames.frames_in_flight, GpuConfig::default().frames.frames_in_flight);
        assert!(!report.has_failures());
        assert_eq!(report.count(Status::Warn), 1);
    }

    #[test]
    fn test_missing_layer_fails() {
        let mut config = GpuConfig::default();
        config.device.enable_validation = true;
        config.device.validation_layers = vec!["VK_LAYER_KHRONOS_validation".to_string()];

        let mut report = Report::default();
        check_layers(&config, &[], &mut report);
        assert_eq!(report.checks[0].status, Status::Fail);
        assert!(report.checks[0].message.contains("VK_LAYER_KHRONOS_validation"));

        let mut report = Report::default();
        check_layers(&config, &["VK_LAYER_KHRONOS_validation".to_string()], &mut report);
        assert_eq!(report.checks[0].status, Status::Pass);
    }

    #[test]
    fn test_device_checks_on_synthetic_devices() {
        let mut old = synthetic_device("old", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::GRAPHICS]);
        old.api_version = vk::make_api_version(0, 1, 0, 0);
        let good = synthetic_device(
            "good",
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            &[vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER],
        );

        let mut report = Report::default();
        check_devices(&GpuConfig::default(), vec![old, good], &mut report);
        assert_eq!(report.checks[0].status, Status::Warn);
        assert_eq!(report.checks[1].status, Status::Pass);
        assert!(report.checks[1].message.contains("good"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json[0]["status"], "warn");
        assert_eq!(json[1]["name"], "Device selection");
    }

    #[test]
    fn test_no_suitable_device_fails() {
        let bare = synthetic_device("copy engine", vk::PhysicalDeviceType::DISCRETE_GPU, &[vk::QueueFlags::TRANSFER]);
        let mut report = Report::default();
        check_devices(&GpuConfig::default(), vec![bare], &mut report);
        assert!(report.has_failures());
        assert_eq!(report.checks[1].status, Status::Fail);
    }
}
