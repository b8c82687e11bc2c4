use serde::{Deserialize, Serialize};

use crate::error::{GpuError, GpuResult};

/// Top-level configuration, loaded from sxgpu.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuConfig {
    #[serde(default)]
    pub frames: FrameConfig,
    #[serde(default)]
    pub bindless: BindlessConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

/// Largest bindless table accepted. Slot ids must stay representable as a
/// non-negative `i32`, and tables are allocated up front.
pub const MAX_TABLE_CAPACITY: u32 = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Number of overlapping frames the CPU may record ahead of the GPU
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: u32,
    /// Staging buffer size in bytes, per queue per frame in flight
    #[serde(default = "default_staging_buffer_size")]
    pub staging_buffer_size: u64,
    /// Upper bound for the fence wait at the start of a recording
    #[serde(default = "default_fence_timeout_ms")]
    pub fence_timeout_ms: u64,
    /// Named timestamp intervals available per command buffer
    #[serde(default = "default_timestamp_queries")]
    pub timestamp_queries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindlessConfig {
    #[serde(default = "default_table_capacity")]
    pub buffer_capacity: u32,
    #[serde(default = "default_table_capacity")]
    pub image_capacity: u32,
    #[serde(default = "default_table_capacity")]
    pub acceleration_structure_capacity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_application_name")]
    pub application_name: String,
    /// Minimum instance/device API version, "major.minor"
    #[serde(default = "default_min_api_version")]
    pub min_api_version: String,
    /// Device extensions that must be present on the selected device
    #[serde(default = "default_required_extensions")]
    pub required_extensions: Vec<String>,
    /// Extra instance extensions (surface extensions come from the windowing layer)
    #[serde(default)]
    pub instance_extensions: Vec<String>,
    /// Layers enabled when `enable_validation` is set
    #[serde(default = "default_validation_layers")]
    pub validation_layers: Vec<String>,
    #[serde(default = "default_enable_validation")]
    pub enable_validation: bool,
    #[serde(default)]
    pub preference: DevicePreference,
    /// Record every live resource handle for leak reports at shutdown
    #[serde(default = "default_track_live_handles")]
    pub track_live_handles: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Fraction of the memory budget in use above which allocations warn
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
}

/// Which device type wins when several devices qualify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Discrete,
    Integrated,
    Any,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: default_frames_in_flight(),
            staging_buffer_size: default_staging_buffer_size(),
            fence_timeout_ms: default_fence_timeout_ms(),
            timestamp_queries: default_timestamp_queries(),
        }
    }
}

impl Default for BindlessConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_table_capacity(),
            image_capacity: default_table_capacity(),
            acceleration_structure_capacity: default_table_capacity(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            warning_threshold: default_warning_threshold(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            application_name: default_application_name(),
            min_api_version: default_min_api_version(),
            required_extensions: default_required_extensions(),
            instance_extensions: Vec::new(),
            validation_layers: default_validation_layers(),
            enable_validation: default_enable_validation(),
            preference: DevicePreference::default(),
            track_live_handles: default_track_live_handles(),
        }
    }
}

impl DeviceConfig {
    /// Parse `min_api_version` into its (major, minor) parts.
    pub fn api_version(&self) -> GpuResult<(u32, u32)> {
        parse_api_version(&self.min_api_version)
    }
}

impl GpuConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: GpuConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                if std::path::Path::new(path).exists() {
                    tracing::warn!("ignoring config {}: {}", path, e);
                }
                Self::default()
            }
        }
    }

    /// Reject values the rest of the system cannot work with.
    pub fn validate(&self) -> GpuResult<()> {
        if self.frames.frames_in_flight == 0 {
            return Err(GpuError::Config("frames_in_flight must be at least 1".into()));
        }
        if self.frames.staging_buffer_size == 0 {
            return Err(GpuError::Config("staging_buffer_size must be non-zero".into()));
        }
        if self.frames.fence_timeout_ms == 0 {
            return Err(GpuError::Config("fence_timeout_ms must be non-zero".into()));
        }
        let tables = [
            ("buffer_capacity", self.bindless.buffer_capacity),
            ("image_capacity", self.bindless.image_capacity),
            (
                "acceleration_structure_capacity",
                self.bindless.acceleration_structure_capacity,
            ),
        ];
        for (name, capacity) in tables {
            if capacity == 0 || capacity > MAX_TABLE_CAPACITY {
                return Err(GpuError::Config(format!(
                    "bindless {} must be in 1..={}, got {}",
                    name, MAX_TABLE_CAPACITY, capacity
                )));
            }
        }
        let threshold = self.memory.warning_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(GpuError::Config(format!(
                "memory warning_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        self.device.api_version()?;
        Ok(())
    }
}

/// Parse "major.minor" (a trailing ".patch" is accepted and ignored).
pub fn parse_api_version(s: &str) -> GpuResult<(u32, u32)> {
    let mut parts = s.trim().split('.');
    let major = parts.next().and_then(|p| p.parse::<u32>().ok());
    let minor = parts.next().and_then(|p| p.parse::<u32>().ok());
    match (major, minor) {
        (Some(major), Some(minor)) => Ok((major, minor)),
        _ => Err(GpuError::Config(format!(
            "invalid API version '{}', expected major.minor",
            s
        ))),
    }
}

/// Returns the default config file path based on platform conventions.
/// Search order:
/// 1. System-wide config: `%PROGRAMDATA%\SXGPU\sxgpu.toml` (Windows) or `/etc/sxgpu/sxgpu.toml`
/// 2. Local fallback: `./sxgpu.toml`
pub fn default_config_path() -> String {
    let system_path = std::path::Path::new(&sxgpu_common::platform::system_config_dir())
        .join("sxgpu.toml");
    if system_path.exists() {
        return system_path.to_string_lossy().into_owned();
    }
    "sxgpu.toml".to_string()
}

fn default_frames_in_flight() -> u32 {
    3
}

fn default_staging_buffer_size() -> u64 {
    64 * 1024 * 1024
}

fn default_fence_timeout_ms() -> u64 {
    5_000
}

fn default_timestamp_queries() -> u32 {
    32
}

fn default_table_capacity() -> u32 {
    1 << 16
}

fn default_warning_threshold() -> f64 {
    0.9
}

fn default_application_name() -> String {
    "sxgpu".to_string()
}

fn default_min_api_version() -> String {
    "1.2".to_string()
}

fn default_required_extensions() -> Vec<String> {
    vec!["VK_KHR_swapchain".to_string()]
}

fn default_validation_layers() -> Vec<String> {
    vec!["VK_LAYER_KHRONOS_validation".to_string()]
}

fn default_enable_validation() -> bool {
    cfg!(debug_assertions)
}

fn default_track_live_handles() -> bool {
    cfg!(debug_assertions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GpuConfig::default();
        assert_eq!(config.frames.frames_in_flight, 3);
        assert_eq!(config.bindless.buffer_capacity, 65536);
        assert_eq!(config.device.api_version().unwrap(), (1, 2));
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: GpuConfig = toml::from_str(
            r#"
            [frames]
            frames_in_flight = 2

            [device]
            preference = "integrated"
            required_extensions = []
            "#,
        )
        .unwrap();
        assert_eq!(config.frames.frames_in_flight, 2);
        assert_eq!(config.frames.staging_buffer_size, 64 * 1024 * 1024);
        assert_eq!(config.device.preference, DevicePreference::Integrated);
        assert!(config.device.required_extensions.is_empty());
        assert_eq!(config.bindless.image_capacity, 65536);
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        let mut config = GpuConfig::default();
        config.frames.frames_in_flight = 0;
        assert!(matches!(config.validate(), Err(GpuError::Config(_))));
    }

    #[test]
    fn table_capacities_are_bounded() {
        let mut config = GpuConfig::default();
        config.bindless.buffer_capacity = MAX_TABLE_CAPACITY;
        config.validate().unwrap();

        config.bindless.buffer_capacity = i32::MAX as u32 + 1;
        assert!(matches!(config.validate(), Err(GpuError::Config(_))));

        let mut config = GpuConfig::default();
        config.bindless.acceleration_structure_capacity = 0;
        match config.validate() {
            Err(GpuError::Config(msg)) => assert!(msg.contains("acceleration_structure_capacity")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn memory_threshold_range() {
        let config: GpuConfig = toml::from_str("[memory]\nwarning_threshold = 0.75\n").unwrap();
        assert_eq!(config.memory.warning_threshold, 0.75);
        config.validate().unwrap();

        for bad in [0.0, -0.5, 1.5, f64::NAN] {
            let mut config = GpuConfig::default();
            config.memory.warning_threshold = bad;
            assert!(config.validate().is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn api_version_parsing() {
        assert_eq!(parse_api_version("1.3").unwrap(), (1, 3));
        assert_eq!(parse_api_version("1.2.198").unwrap(), (1, 2));
        assert!(parse_api_version("one").is_err());
        assert!(parse_api_version("1").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = GpuConfig::load_or_default("/nonexistent/sxgpu.toml");
        assert_eq!(config.frames.frames_in_flight, 3);
    }
}
