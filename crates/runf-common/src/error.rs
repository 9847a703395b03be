//! Unified low-level error type for the runf workspace.
//!
//! Each higher-level crate defines its own domain-specific error enum that
//! wraps these variants where an operation can fail on the OS.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Low-level error shared across the workspace.
#[derive(Debug, Error)]
pub enum RunfError {
    /// An I/O operation on a path failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A system call failed.
    #[error("{operation} failed: {source}")]
    Syscall {
        /// Description of the failed operation.
        operation: String,
        /// Underlying OS error.
        source: io::Error,
    },

    /// A mount could not be performed.
    #[error("mount of {target} failed: {message}")]
    Mount {
        /// Destination of the failed mount.
        target: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// The operation is not available on this platform.
    #[error("unsupported: {message}")]
    Unsupported {
        /// Description of the unsupported operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl RunfError {
    /// Wraps an I/O error raised while operating on `path`.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps an OS error raised by the named operation.
    pub fn syscall(operation: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Self::Syscall {
            operation: operation.into(),
            source: source.into(),
        }
    }

    /// Returns whether the error stems from missing privileges.
    ///
    /// Covers `EPERM`, `EACCES`, and `EROFS` coming back from the kernel, as
    /// well as explicit [`RunfError::PermissionDenied`] values.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::Io { source, .. } | Self::Syscall { source, .. } => {
                source.kind() == io::ErrorKind::PermissionDenied
                    || source.kind() == io::ErrorKind::ReadOnlyFilesystem
            }
            Self::PermissionDenied { .. } => true,
            _ => false,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, RunfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eacces_is_a_permission_error() {
        let err = RunfError::io(
            "/sys/fs/cgroup/system",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(err.is_permission_denied());
    }

    #[test]
    fn eperm_is_a_permission_error() {
        let err = RunfError::syscall("mkdir", io::Error::from_raw_os_error(1));
        assert!(err.is_permission_denied());
    }

    #[test]
    fn missing_path_is_not_a_permission_error() {
        let err = RunfError::io("/nope", io::Error::from(io::ErrorKind::NotFound));
        assert!(!err.is_permission_denied());
    }

    #[test]
    fn syscall_error_names_the_operation() {
        let err = RunfError::syscall("pivot_root", io::Error::from_raw_os_error(22));
        assert!(err.to_string().starts_with("pivot_root failed"));
    }
}
