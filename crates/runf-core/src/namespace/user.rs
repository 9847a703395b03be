//! User namespace isolation.
//!
//! Maps container UIDs/GIDs to host UIDs/GIDs, enabling rootless containers.
//! A single self-mapping can be written by the unprivileged parent directly;
//! anything wider goes through the setuid `newuidmap`/`newgidmap` helpers and
//! must fall inside the user's subordinate ranges.

use std::fmt;

use runf_common::error::{Result, RunfError};
use serde::{Deserialize, Serialize};

/// One line of `/proc/<pid>/uid_map` or `/proc/<pid>/gid_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdMapping {
    /// First ID inside the container.
    pub container_id: u32,
    /// First ID on the host.
    pub host_id: u32,
    /// Number of consecutive IDs mapped.
    pub size: u32,
}

impl IdMapping {
    /// Maps container root onto exactly one host ID.
    #[must_use]
    pub const fn root_to(host_id: u32) -> Self {
        Self {
            container_id: 0,
            host_id,
            size: 1,
        }
    }

    /// Returns whether every host ID of this mapping lies in `range`.
    #[must_use]
    pub fn within(&self, range: &SubordinateRange) -> bool {
        let end = u64::from(self.host_id) + u64::from(self.size);
        self.host_id >= range.start && end <= u64::from(range.start) + u64::from(range.count)
    }
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.container_id, self.host_id, self.size)
    }
}

/// Which of the two ID spaces a mapping belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    /// User IDs (`uid_map`, `/etc/subuid`, `newuidmap`).
    User,
    /// Group IDs (`gid_map`, `/etc/subgid`, `newgidmap`).
    Group,
}

impl IdKind {
    /// Name of the map file under `/proc/<pid>/`.
    #[must_use]
    pub const fn map_file(self) -> &'static str {
        match self {
            Self::User => "uid_map",
            Self::Group => "gid_map",
        }
    }

    /// Path of the subordinate ID database.
    #[must_use]
    pub const fn subordinate_file(self) -> &'static str {
        match self {
            Self::User => "/etc/subuid",
            Self::Group => "/etc/subgid",
        }
    }

    /// The setuid helper writing wide mappings.
    #[must_use]
    pub const fn helper(self) -> &'static str {
        match self {
            Self::User => "newuidmap",
            Self::Group => "newgidmap",
        }
    }
}

/// A range delegated to a user in `/etc/subuid` or `/etc/subgid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubordinateRange {
    /// First delegated host ID.
    pub start: u32,
    /// Number of delegated IDs.
    pub count: u32,
}

/// Renders mappings in the kernel's map file format.
#[must_use]
pub fn format_mappings(mappings: &[IdMapping]) -> String {
    mappings
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Returns whether `mappings` is the single `0 <own_id> 1` entry an
/// unprivileged process may write on its own.
#[must_use]
pub fn is_self_mapping(mappings: &[IdMapping], own_id: u32) -> bool {
    matches!(mappings, [only] if *only == IdMapping::root_to(own_id))
}

/// Extracts the ranges delegated to a user from subuid/subgid contents.
///
/// Entries may name the user either by login name or by numeric ID.
/// Malformed lines are skipped.
#[must_use]
pub fn parse_subordinate_ranges(contents: &str, user: &str, id: u32) -> Vec<SubordinateRange> {
    let id = id.to_string();
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let owner = fields.next()?;
            let start = fields.next()?.parse().ok()?;
            let count = fields.next()?.parse().ok()?;
            (owner == user || owner == id).then_some(SubordinateRange { start, count })
        })
        .collect()
}

/// Checks that every mapping is either the caller's own ID or falls inside
/// one of its subordinate ranges.
///
/// # Errors
///
/// Returns [`RunfError::PermissionDenied`] naming the first mapping that is
/// not covered.
pub fn check_mappings_permitted(
    kind: IdKind,
    mappings: &[IdMapping],
    own_id: u32,
    ranges: &[SubordinateRange],
) -> Result<()> {
    for mapping in mappings {
        let own = mapping.size == 1 && mapping.host_id == own_id;
        if !own && !ranges.iter().any(|range| mapping.within(range)) {
            return Err(RunfError::PermissionDenied {
                message: format!(
                    "mapping {mapping} is not covered by {}",
                    kind.subordinate_file()
                ),
            });
        }
    }
    Ok(())
}

/// Writes UID and GID mappings for the user namespace of `pid`.
///
/// When the caller maps only its own IDs (or is real root), the map files
/// are written directly after denying `setgroups`; otherwise the
/// `newuidmap`/`newgidmap` helpers are invoked.
///
/// # Errors
///
/// Returns an error if writing to `/proc/<pid>/{setgroups,uid_map,gid_map}`
/// fails or a helper exits unsuccessfully.
#[cfg(target_os = "linux")]
pub fn write_id_mappings(
    pid: nix::unistd::Pid,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
) -> Result<()> {
    use nix::unistd::{getegid, geteuid};

    let privileged = geteuid().is_root();
    let own_uid = geteuid().as_raw();
    let own_gid = getegid().as_raw();

    if privileged || is_self_mapping(uid_mappings, own_uid) {
        write_map_file(pid, IdKind::User, uid_mappings)?;
    } else {
        run_map_helper(pid, IdKind::User, uid_mappings)?;
    }

    if privileged || is_self_mapping(gid_mappings, own_gid) {
        if !privileged {
            deny_setgroups(pid)?;
        }
        write_map_file(pid, IdKind::Group, gid_mappings)?;
    } else {
        run_map_helper(pid, IdKind::Group, gid_mappings)?;
    }

    tracing::debug!(
        pid = pid.as_raw(),
        uid = %format_mappings(uid_mappings),
        gid = %format_mappings(gid_mappings),
        "wrote ID mappings"
    );
    Ok(())
}

#[cfg(target_os = "linux")]
fn deny_setgroups(pid: nix::unistd::Pid) -> Result<()> {
    let path = format!("/proc/{pid}/setgroups");
    if std::path::Path::new(&path).exists() {
        std::fs::write(&path, "deny").map_err(|e| RunfError::io(&path, e))?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn write_map_file(pid: nix::unistd::Pid, kind: IdKind, mappings: &[IdMapping]) -> Result<()> {
    let path = format!("/proc/{pid}/{}", kind.map_file());
    std::fs::write(&path, format_mappings(mappings)).map_err(|e| RunfError::io(&path, e))
}

#[cfg(target_os = "linux")]
fn run_map_helper(pid: nix::unistd::Pid, kind: IdKind, mappings: &[IdMapping]) -> Result<()> {
    let mut command = std::process::Command::new(kind.helper());
    let _ = command.arg(pid.to_string());
    for mapping in mappings {
        let _ = command.args([
            mapping.container_id.to_string(),
            mapping.host_id.to_string(),
            mapping.size.to_string(),
        ]);
    }
    let output = command
        .output()
        .map_err(|e| RunfError::syscall(format!("spawn {}", kind.helper()), e))?;
    if !output.status.success() {
        return Err(RunfError::PermissionDenied {
            message: format!(
                "{} exited with {}: {}",
                kind.helper(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}
