use crate::rid_pool::SlotKind;

pub type GpuResult<T> = Result<T, GpuError>;

/// Coarse classification of failures, used by callers to decide whether to
/// tear down the session, back off, or treat the error as a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No usable device, missing extension or layer, device lost.
    SetupFatal,
    /// Bindless pool, staging buffer or device memory ran out.
    ResourceExhaustion,
    /// The caller broke the API contract.
    ProgrammerMisuse,
}

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("no suitable physical device: {0}")]
    NoSuitableDevice(String),

    #[error("missing required extension: {0}")]
    MissingExtension(String),

    #[error("missing required layer: {0}")]
    MissingLayer(String),

    #[error("unsupported API version: required {required}, found {found}")]
    UnsupportedApiVersion { required: String, found: String },

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("{kind} slot pool exhausted (capacity {capacity})")]
    PoolExhausted { kind: SlotKind, capacity: u32 },

    #[error("staging buffer overflow: requested {requested} bytes, {remaining} remaining")]
    StagingOverflow { requested: u64, remaining: u64 },

    #[error("timestamp query pool exhausted (capacity {capacity} intervals)")]
    QueryPoolExhausted { capacity: u32 },

    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    #[error("reentrant recording: {active} is already recording, cannot begin {requested}")]
    ReentrantRecording { active: String, requested: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GpuError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            GpuError::NoSuitableDevice(_)
            | GpuError::MissingExtension(_)
            | GpuError::MissingLayer(_)
            | GpuError::UnsupportedApiVersion { .. }
            | GpuError::DeviceLost(_)
            | GpuError::Unsupported(_)
            | GpuError::Backend(_)
            | GpuError::Config(_)
            | GpuError::Io(_) => ErrorCategory::SetupFatal,
            GpuError::PoolExhausted { .. }
            | GpuError::StagingOverflow { .. }
            | GpuError::QueryPoolExhausted { .. }
            | GpuError::AllocationFailure(_) => ErrorCategory::ResourceExhaustion,
            GpuError::ReentrantRecording { .. }
            | GpuError::InvalidState(_)
            | GpuError::InvalidArgument(_) => ErrorCategory::ProgrammerMisuse,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::SetupFatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            GpuError::NoSuitableDevice("none".into()).category(),
            ErrorCategory::SetupFatal
        );
        assert_eq!(
            GpuError::DeviceLost("fence timeout".into()).category(),
            ErrorCategory::SetupFatal
        );
        assert_eq!(
            GpuError::PoolExhausted { kind: SlotKind::Buffer, capacity: 4 }.category(),
            ErrorCategory::ResourceExhaustion
        );
        assert_eq!(
            GpuError::StagingOverflow { requested: 10, remaining: 2 }.category(),
            ErrorCategory::ResourceExhaustion
        );
        assert_eq!(
            GpuError::ReentrantRecording {
                active: "graphics".into(),
                requested: "compute".into()
            }
            .category(),
            ErrorCategory::ProgrammerMisuse
        );
        assert!(GpuError::MissingLayer("VK_LAYER_KHRONOS_validation".into()).is_fatal());
    }

    #[test]
    fn messages_name_the_failure() {
        let e = GpuError::PoolExhausted { kind: SlotKind::Image, capacity: 16 };
        assert_eq!(e.to_string(), "image slot pool exhausted (capacity 16)");
        let e = GpuError::StagingOverflow { requested: 128, remaining: 64 };
        assert!(e.to_string().contains("128"));
    }
}
