//! Error types for testfleet
//!
//! `ResourceExhausted`, `RemoteUnavailable` and `AllocationConflict` abort a
//! test's setup. `NotFound` and `IoFailure` are usually logged and degraded
//! by the caller instead of propagated.

use crate::device::Platform;

/// Main error type for allocation and isolation operations
#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("No free {platform} device in pool")]
    ResourceExhausted { platform: Platform },

    #[error("Remote device service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Remote allocation conflict: {0}")]
    AllocationConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LabError {
    /// Whether this error must abort the test's setup
    pub fn is_fatal_for_setup(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. }
                | Self::RemoteUnavailable(_)
                | Self::AllocationConflict(_)
                | Self::IoFailure(_)
        )
    }
}

impl From<std::io::Error> for LabError {
    fn from(err: std::io::Error) -> Self {
        Self::IoFailure(err.to_string())
    }
}

impl From<serde_json::Error> for LabError {
    fn from(err: serde_json::Error) -> Self {
        Self::IoFailure(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for LabError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("TOML error: {}", err))
    }
}

/// Result type alias for testfleet operations
pub type Result<T> = std::result::Result<T, LabError>;
