mod run;
mod verify;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;

use ash::vk;
use sxgpu_core::config::{default_config_path, GpuConfig};
use sxgpu_render::capability::{CapabilityChecker, DeviceRequirements};
use sxgpu_render::vulkan::VulkanInstance;
use sxgpu_render::{DeviceSource, PhysicalDeviceInfo};

#[derive(Parser)]
#[command(name = "sxgpu")]
#[command(about = "sxgpu - bindless GPU resources and frame pacing over Vulkan")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the Vulkan devices visible to the loader
    Devices {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Check the configuration, Vulkan loader and device requirements
    Verify {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Drive frames of allocate/stage/record/submit/free and report timings
    Run {
        /// Backend to run on
        #[arg(short, long, value_enum, default_value_t = Backend::Vulkan)]
        backend: Backend,

        /// Number of frames to drive
        #[arg(short, long, default_value_t = 120)]
        frames: u64,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Vulkan,
    Headless,
}

fn main() -> anyhow::Result<()> {
    sxgpu_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices { json, config } => {
            let config = load_config(config);
            list_devices(&config, json)?;
        }

        Commands::Verify { config, json } => {
            let config_path = config.unwrap_or_else(default_config_path);
            verify::run_verify(&config_path, json)?;
        }

        Commands::Run {
            backend,
            frames,
            config,
        } => {
            let config = load_config(config);
            info!("driving {} frame(s) on the {:?} backend", frames, backend);
            let report = match backend {
                Backend::Vulkan => {
                    let setup =
                        sxgpu_render::vulkan::bootstrap(&config, None, vk::QueueFlags::GRAPHICS)?;
                    run::run_frames(setup.device, config, frames)?
                }
                Backend::Headless => {
                    let device = std::sync::Arc::new(sxgpu_render::headless::HeadlessDevice::simple());
                    run::run_frames(device, config, frames)?
                }
            };
            report.print();
        }
    }

    Ok(())
}

fn load_config(path: Option<String>) -> GpuConfig {
    let path = path.unwrap_or_else(default_config_path);
    GpuConfig::load_or_default(&path)
}

// ── Device listing ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct DeviceSummary {
    index: usize,
    name: String,
    vendor: &'static str,
    device_type: &'static str,
    api_version: String,
    device_local_mb: u64,
    depth_format: Option<String>,
    queue_families: Vec<QueueFamilySummary>,
    suitable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rejection: Option<String>,
}

#[derive(Debug, Serialize)]
struct QueueFamilySummary {
    index: u32,
    flags: String,
    queue_count: u32,
    timestamp_valid_bits: u32,
}

impl DeviceSummary {
    fn new(info: &PhysicalDeviceInfo, checker: &CapabilityChecker) -> Self {
        let rejection = checker.check_device(info).err().map(|r| r.to_string());
        Self {
            index: info.index,
            name: info.name.clone(),
            vendor: info.vendor_name(),
            device_type: info.type_name(),
            api_version: info.api_version_string(),
            device_local_mb: info.device_local_memory() / (1024 * 1024),
            depth_format: info.depth_format.map(|f| format!("{:?}", f)),
            queue_families: info
                .queue_families
                .iter()
                .map(|f| QueueFamilySummary {
                    index: f.index,
                    flags: format!("{:?}", f.flags),
                    queue_count: f.queue_count,
                    timestamp_valid_bits: f.timestamp_valid_bits,
                })
                .collect(),
            suitable: rejection.is_none(),
            rejection,
        }
    }
}

fn list_devices(config: &GpuConfig, json: bool) -> anyhow::Result<()> {
    // Listing never needs validation layers.
    let mut device_config = config.device.clone();
    device_config.enable_validation = false;

    let instance = VulkanInstance::new(&device_config)?;
    let devices = instance.enumerate_devices(None)?;
    let checker = CapabilityChecker::new(DeviceRequirements::from_config(&config.device)?);
    let summaries: Vec<DeviceSummary> = devices
        .iter()
        .map(|d| DeviceSummary::new(d, &checker))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No Vulkan devices found.");
        return Ok(());
    }

    println!("Vulkan devices:");
    println!();
    for d in &summaries {
        println!("  GPU {}: {}", d.index, d.name);
        println!("    Vendor:   {}", d.vendor);
        println!("    Type:     {}", d.device_type);
        println!("    API:      {}", d.api_version);
        println!("    VRAM:     {} MB", d.device_local_mb);
        if let Some(ref format) = d.depth_format {
            println!("    Depth:    {}", format);
        }
        for f in &d.queue_families {
            println!(
                "    Family {}: {} x{} (timestamp bits {})",
                f.index, f.flags, f.queue_count, f.timestamp_valid_bits
            );
        }
        match d.rejection {
            Some(ref reason) => println!("    Suitable: no ({})", reason),
            None => println!("    Suitable: yes"),
        }
        println!();
    }

    Ok(())
}
