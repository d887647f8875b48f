//! Error types for HwShield
//!
//! This module defines all error types used throughout the controller,
//! following the taxonomy the reservation logic depends on: validation
//! failures are caught before any hardware interaction, capability and
//! programming failures abort the run, and restore failures are logged
//! but never escalated.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for HwShield operations
#[derive(Error, Debug)]
pub enum ShieldError {
    /// Malformed or out-of-range CLI input; always caught before hardware
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested feature is unsupported or exceeds platform capacity
    #[error("Capability error: {0}")]
    Capability(String),

    /// A write was rejected by the device or arbiter
    #[error("Programming error for '{group}': {status}")]
    Programming { group: String, status: String },

    /// Post-write readback disagrees with the request
    #[error("Verification mismatch for {what}: expected {expected}, got {actual}")]
    VerificationMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    /// No contiguous run of the requested width fits in the exclusive region
    #[error("Cannot carve {ways} contiguous ways out of exclusive base {base:#x}")]
    CarvingFailed { ways: u32, base: u64 },

    /// A supervised sidecar process misbehaved
    #[error("Sidecar '{name}' (pid {pid}): {message}")]
    Sidecar {
        name: String,
        pid: i32,
        message: String,
    },

    /// Run interrupted from outside; teardown still runs before exit
    #[error("Run cancelled")]
    Cancelled,

    /// I/O error on a control file
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ShieldError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a capability error
    pub fn capability(message: impl Into<String>) -> Self {
        Self::Capability(message.into())
    }

    /// Create a programming error naming the rejected group
    pub fn programming(group: impl Into<String>, status: impl Into<String>) -> Self {
        Self::Programming {
            group: group.into(),
            status: status.into(),
        }
    }

    /// Create a verification mismatch error
    pub fn mismatch(
        what: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::VerificationMismatch {
            what: what.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an I/O error with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors the six optional controllers downgrade to a skip
    pub fn is_capability(&self) -> bool {
        matches!(self, Self::Capability(_))
    }
}

/// Result type alias for HwShield operations
pub type Result<T> = std::result::Result<T, ShieldError>;

/// Extension trait for adding path context to std::io::Result
pub trait IoResultExt<T> {
    /// Add path context to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| ShieldError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = ShieldError::io("/sys/fs/resctrl/schemata", io_err);
        assert!(err.to_string().contains("/sys/fs/resctrl/schemata"));
    }

    #[test]
    fn test_capability_classification() {
        assert!(ShieldError::capability("no L3 line").is_capability());
        assert!(!ShieldError::validation("bad percent").is_capability());
    }

    #[test]
    fn test_programming_error_names_group() {
        let err = ShieldError::programming("workload", "overlaps with exclusive group");
        let text = err.to_string();
        assert!(text.contains("workload"));
        assert!(text.contains("overlaps"));
    }
}
