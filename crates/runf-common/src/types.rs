//! Domain primitive types used across the runf workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RunfError};

/// Maximum length of a container identifier; it doubles as the hostname.
const MAX_ID_LEN: usize = 64;

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks that the identifier can be used as a directory name and a hostname.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is empty, longer than 64 bytes, or
    /// contains anything other than ASCII alphanumerics, `-`, `_` and `.`,
    /// or if it is `.` / `..`.
    pub fn validate(&self) -> Result<()> {
        let id = self.0.as_str();
        let valid_chars = id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        if id.is_empty() || id.len() > MAX_ID_LEN || !valid_chars || id == "." || id == ".." {
            return Err(RunfError::Config {
                message: format!("invalid container id: {id:?}"),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource limits for a container's cgroup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU weight (1-10000).
    pub cpu_weight: Option<u64>,
    /// Memory limit in bytes.
    pub memory_bytes: Option<u64>,
    /// I/O weight (1-10000).
    pub io_weight: Option<u16>,
    /// Maximum number of tasks.
    pub pids_max: Option<u64>,
}

impl ResourceLimits {
    /// Returns whether no limit is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.cpu_weight.is_none()
            && self.memory_bytes.is_none()
            && self.io_weight.is_none()
            && self.pids_max.is_none()
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Container has been created but not yet started.
    Created,
    /// Container process is running.
    Running,
    /// Container process has exited.
    Stopped,
    /// Container resources have been released.
    Destroyed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}
