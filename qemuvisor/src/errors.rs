//! Hierarchical error types for the supervisor.
//!
//! Errors are categorized by the phase that produced them:
//! - [`ConfigError`]: configuration/validation issues, returned before anything starts
//! - [`AllocationError`]: no forwardable address:port could be reserved
//! - [`LaunchError`]: pipe setup or process spawn failed, no monitors were started
//! - [`RemoteError`]: a remote command over the forwarded port failed
//!
//! Runtime termination (exit, kernel panic, timeout) is never an error value; it is
//! observed through the supervisor's terminal flags.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate.
pub type QemuResult<T> = Result<T, QemuError>;

// ============================================================================
// Top-Level Error
// ============================================================================

/// Errors returned by supervisor operations.
///
/// ```ignore
/// match supervisor.start().await {
///     Err(QemuError::Config(_)) => { /* user should fix config */ }
///     Err(QemuError::ImmediateExit { stderr, .. }) => { /* inspect emulator stderr */ }
///     _ => {}
/// }
/// ```
#[derive(Debug, Error)]
pub enum QemuError {
    /// Configuration or validation error (user-fixable).
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// No free address:port for network forwarding.
    #[error("port allocation: {0}")]
    Allocation(#[from] AllocationError),

    /// Emulator process could not be launched.
    #[error("launch: {0}")]
    Launch(#[from] LaunchError),

    /// Emulator exited within the startup grace interval.
    #[error("emulator died immediately ({status}): {stderr}")]
    ImmediateExit { status: String, stderr: String },

    /// Remote command execution failed.
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),

    /// Operation not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Unexpected internal failure (task join, channel closed).
    #[error("internal: {0}")]
    Internal(String),
}

// ============================================================================
// Config Errors
// ============================================================================

/// Errors detected while validating a machine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Emulator binary not found on the search path.
    #[error("emulator binary '{binary}' not found (searched: {searched})")]
    BinaryNotFound { binary: String, searched: String },

    /// Kernel image missing or unreadable.
    #[error("kernel image {path}: {source}")]
    KernelNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Initial ramdisk missing or unreadable.
    #[error("initrd {path}: {source}")]
    InitrdNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Backing disk image missing or unreadable.
    #[error("disk image {path}: {source}")]
    DiskNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Architecture tag not in the supported set.
    #[error("unsupported architecture '{0}' (supported: x86_64, i386)")]
    UnsupportedArch(String),

    /// CPU or memory count out of range.
    #[error("invalid resources: {0}")]
    InvalidResources(String),
}

// ============================================================================
// Allocation Errors
// ============================================================================

/// Errors from the port allocator.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Every candidate failed to bind within the time budget.
    #[error("no free address:port found within {budget:?} after {attempts} attempts")]
    Exhausted { budget: Duration, attempts: u64 },
}

// ============================================================================
// Launch Errors
// ============================================================================

/// Errors while launching the emulator process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// A standard stream was not piped.
    #[error("{0} pipe unavailable")]
    Pipe(&'static str),

    /// Process spawn failed.
    #[error("spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Spawned process has no pid (already reaped).
    #[error("emulator exited before its pid could be read")]
    NoPid,
}

// ============================================================================
// Remote Errors
// ============================================================================

/// Errors from the remote command collaborator.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Machine has no forwarded address yet.
    #[error("machine is not running (no forwarded address)")]
    NotRunning,

    /// Local ssh/scp client could not be started.
    #[error("spawn {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },

    /// Remote operation completed with a failure status.
    #[error("{program} failed ({status}): {output}")]
    Failed {
        program: &'static str,
        status: String,
        output: String,
    },
}

// ============================================================================
// Convenience Constructors
// ============================================================================

impl ConfigError {
    pub fn kernel(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::KernelNotFound {
            path: path.into(),
            source,
        }
    }

    pub fn initrd(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::InitrdNotFound {
            path: path.into(),
            source,
        }
    }

    pub fn disk(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::DiskNotFound {
            path: path.into(),
            source,
        }
    }
}

impl QemuError {
    /// Whether the error was raised before any process was spawned.
    pub fn is_pre_launch(&self) -> bool {
        matches!(
            self,
            QemuError::Config(_)
                | QemuError::Allocation(_)
                | QemuError::Launch(_)
                | QemuError::InvalidState(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_hierarchy() {
        let err: QemuError = ConfigError::UnsupportedArch("sparc".into()).into();
        assert!(matches!(err, QemuError::Config(_)));

        let err: QemuError = AllocationError::Exhausted {
            budget: Duration::from_secs(1),
            attempts: 10,
        }
        .into();
        assert!(matches!(err, QemuError::Allocation(_)));

        let err: QemuError = LaunchError::Pipe("stdin").into();
        assert!(matches!(err, QemuError::Launch(_)));

        let err: QemuError = RemoteError::NotRunning.into();
        assert!(matches!(err, QemuError::Remote(_)));
    }

    #[test]
    fn test_kernel_and_disk_errors_are_distinct() {
        let kernel = ConfigError::kernel("/boot/vmlinuz", io::Error::from(io::ErrorKind::NotFound));
        let disk = ConfigError::disk("/img/disk.img", io::Error::from(io::ErrorKind::NotFound));

        assert!(kernel.to_string().starts_with("kernel image /boot/vmlinuz"));
        assert!(disk.to_string().starts_with("disk image /img/disk.img"));
    }

    #[test]
    fn test_error_display() {
        let err = QemuError::ImmediateExit {
            status: "exit status: 1".into(),
            stderr: "could not open disk".into(),
        };
        assert_eq!(
            err.to_string(),
            "emulator died immediately (exit status: 1): could not open disk"
        );

        let err = QemuError::Config(ConfigError::UnsupportedArch("mips".into()));
        assert!(err.to_string().contains("unsupported architecture 'mips'"));
    }

    #[test]
    fn test_pre_launch_classification() {
        assert!(QemuError::from(LaunchError::NoPid).is_pre_launch());
        assert!(
            !QemuError::ImmediateExit {
                status: String::new(),
                stderr: String::new()
            }
            .is_pre_launch()
        );
    }
}
