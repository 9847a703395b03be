//! Linux namespace management for container isolation.
//!
//! Namespaces are created all at once when the init process is cloned; this
//! module maps the declarative [`NamespaceKind`] set onto `clone(2)` flags.

pub mod user;
pub mod uts;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A kind of kernel namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceKind {
    /// Private mount table.
    Mount,
    /// Private hostname and domain name.
    Uts,
    /// Private System V IPC objects and POSIX message queues.
    Ipc,
    /// Private process ID space; the init process becomes PID 1.
    Pid,
    /// Private UID/GID space, required for rootless containers.
    User,
    /// Private network stack.
    Network,
    /// Private view of the cgroup hierarchy.
    Cgroup,
}

/// An unordered set of namespaces to create.
pub type NamespaceSet = BTreeSet<NamespaceKind>;

impl NamespaceKind {
    /// Name of the namespace link under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Mount => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Pid => "pid",
            Self::User => "user",
            Self::Network => "net",
            Self::Cgroup => "cgroup",
        }
    }

    /// The `CLONE_NEW*` flag creating this namespace.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub const fn clone_flag(self) -> nix::sched::CloneFlags {
        use nix::sched::CloneFlags;

        match self {
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::User => CloneFlags::CLONE_NEWUSER,
            Self::Network => CloneFlags::CLONE_NEWNET,
            Self::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// Namespaces created for every default container.
#[must_use]
pub fn default_namespaces() -> NamespaceSet {
    [
        NamespaceKind::Mount,
        NamespaceKind::Uts,
        NamespaceKind::Ipc,
        NamespaceKind::Pid,
        NamespaceKind::User,
    ]
    .into_iter()
    .collect()
}

/// Combines the clone flags of every namespace in the set.
#[cfg(target_os = "linux")]
#[must_use]
pub fn clone_flags(namespaces: &NamespaceSet) -> nix::sched::CloneFlags {
    namespaces
        .iter()
        .fold(nix::sched::CloneFlags::empty(), |flags, kind| flags | kind.clone_flag())
}
