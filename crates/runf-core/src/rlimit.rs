//! Process resource limits applied inside the container before exec.

use std::fmt;

use runf_common::constants::DEFAULT_NOFILE_LIMIT;
use runf_common::error::Result;
use serde::{Deserialize, Serialize};

/// A `setrlimit(2)` resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RlimitKind {
    /// `RLIMIT_NOFILE`: open file descriptors.
    Nofile,
    /// `RLIMIT_NPROC`: processes per real user.
    Nproc,
    /// `RLIMIT_CORE`: core dump size.
    Core,
    /// `RLIMIT_MEMLOCK`: locked memory.
    Memlock,
    /// `RLIMIT_STACK`: stack size.
    Stack,
    /// `RLIMIT_FSIZE`: file size.
    Fsize,
    /// `RLIMIT_CPU`: CPU seconds.
    Cpu,
    /// `RLIMIT_AS`: address space.
    As,
}

impl RlimitKind {
    #[cfg(target_os = "linux")]
    const fn resource(self) -> nix::sys::resource::Resource {
        use nix::sys::resource::Resource;

        match self {
            Self::Nofile => Resource::RLIMIT_NOFILE,
            Self::Nproc => Resource::RLIMIT_NPROC,
            Self::Core => Resource::RLIMIT_CORE,
            Self::Memlock => Resource::RLIMIT_MEMLOCK,
            Self::Stack => Resource::RLIMIT_STACK,
            Self::Fsize => Resource::RLIMIT_FSIZE,
            Self::Cpu => Resource::RLIMIT_CPU,
            Self::As => Resource::RLIMIT_AS,
        }
    }
}

impl fmt::Display for RlimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nofile => "RLIMIT_NOFILE",
            Self::Nproc => "RLIMIT_NPROC",
            Self::Core => "RLIMIT_CORE",
            Self::Memlock => "RLIMIT_MEMLOCK",
            Self::Stack => "RLIMIT_STACK",
            Self::Fsize => "RLIMIT_FSIZE",
            Self::Cpu => "RLIMIT_CPU",
            Self::As => "RLIMIT_AS",
        };
        f.write_str(name)
    }
}

/// A soft/hard limit pair for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    /// Resource being limited.
    pub kind: RlimitKind,
    /// Soft limit.
    pub soft: u64,
    /// Hard limit; must not be below `soft`.
    pub hard: u64,
}

impl Rlimit {
    /// Sets soft and hard limit to the same value.
    #[must_use]
    pub const fn fixed(kind: RlimitKind, value: u64) -> Self {
        Self {
            kind,
            soft: value,
            hard: value,
        }
    }

    /// Returns whether the soft limit does not exceed the hard limit.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.soft <= self.hard
    }
}

/// `NOFILE 1024/1024`.
#[must_use]
pub fn default_rlimits() -> Vec<Rlimit> {
    vec![Rlimit::fixed(RlimitKind::Nofile, DEFAULT_NOFILE_LIMIT)]
}

/// Applies every limit to the calling process, in order.
///
/// # Errors
///
/// Returns an error naming the first limit `setrlimit(2)` rejects.
#[cfg(target_os = "linux")]
pub fn apply_rlimits(rlimits: &[Rlimit]) -> Result<()> {
    use runf_common::error::RunfError;

    for limit in rlimits {
        nix::sys::resource::setrlimit(limit.kind.resource(), limit.soft, limit.hard).map_err(|e| {
            RunfError::syscall(format!("setrlimit {}={}/{}", limit.kind, limit.soft, limit.hard), e)
        })?;
        tracing::debug!(kind = %limit.kind, soft = limit.soft, hard = limit.hard, "rlimit applied");
    }
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error.
#[cfg(not(target_os = "linux"))]
pub fn apply_rlimits(_rlimits: &[Rlimit]) -> Result<()> {
    Err(runf_common::error::RunfError::Unsupported {
        message: "Linux required for native container operations".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_open_files() {
        assert_eq!(default_rlimits(), vec![Rlimit::fixed(RlimitKind::Nofile, 1024)]);
    }

    #[test]
    fn soft_above_hard_is_inconsistent() {
        let limit = Rlimit {
            kind: RlimitKind::Core,
            soft: 10,
            hard: 5,
        };
        assert!(!limit.is_consistent());
    }
}
