use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable read for the log filter.
pub const LOG_ENV: &str = "SXGPU_LOG";

/// Initialize structured logging with environment filter.
/// Set SXGPU_LOG=debug (or trace, info, warn, error, or a full directive such
/// as `sxgpu_render=trace`) for verbosity control.
pub fn init_logging() {
    fmt()
        .with_env_filter(env_filter("info"))
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`] but never panics when a global subscriber is already
/// installed. Intended for tests and embedding hosts.
pub fn try_init_logging(default_directive: &str) -> bool {
    fmt()
        .with_env_filter(env_filter(default_directive))
        .with_target(true)
        .with_thread_ids(true)
        .with_test_writer()
        .try_init()
        .is_ok()
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive))
}
