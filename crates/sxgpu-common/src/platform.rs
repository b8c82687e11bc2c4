/// Returns the platform name string.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "windows")]
    { "windows" }
    #[cfg(target_os = "linux")]
    { "linux" }
    #[cfg(target_os = "macos")]
    { "macos" }
    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    { "unknown" }
}

/// Returns the file name of the Vulkan loader library for this platform.
pub fn vulkan_loader_name() -> &'static str {
    #[cfg(target_os = "windows")]
    { "vulkan-1.dll" }
    #[cfg(target_os = "macos")]
    { "libvulkan.1.dylib" }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    { "libvulkan.so.1" }
}

/// Directory for system-wide configuration files.
pub fn system_config_dir() -> String {
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        format!(r"{}\SXGPU", programdata)
    }
    #[cfg(not(windows))]
    {
        "/etc/sxgpu".to_string()
    }
}
