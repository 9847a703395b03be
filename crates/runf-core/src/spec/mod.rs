//! The isolation specification: an immutable description of one container.
//!
//! An [`IsolationSpec`] is only obtained through [`SpecBuilder::build`] (or
//! by deserializing one that was built that way), so its invariants hold
//! wherever it is used. It is serializable so the driver can hand it to the
//! init process over the sync socket.

mod builder;

use std::path::{Path, PathBuf};

pub use builder::{ConfigurationError, Identity, SpecBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::CapabilitySets;
use crate::cgroup::CgroupSpec;
use crate::filesystem::is_contained_path;
use crate::filesystem::mount::Mount;
use crate::namespace::user::IdMapping;
use crate::namespace::{NamespaceKind, NamespaceSet};
use crate::rlimit::Rlimit;

/// A rule an [`IsolationSpec`] breaks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// No root filesystem was set.
    #[error("rootfs is not set")]
    MissingRootfs,

    /// The root filesystem path is relative.
    #[error("rootfs {path} is not absolute")]
    RelativeRootfs {
        /// The offending path.
        path: PathBuf,
    },

    /// Rootless mode needs a user namespace.
    #[error("rootless containers require a user namespace")]
    RootlessWithoutUserNamespace,

    /// A user namespace was requested without mappings for both ID kinds.
    #[error("user namespace requires both uid and gid mappings")]
    MissingIdMappings,

    /// Mappings were given but no user namespace will exist to hold them.
    #[error("ID mappings require a user namespace")]
    MappingsWithoutUserNamespace,

    /// A mapping covers zero IDs.
    #[error("ID mapping {mapping} has size zero")]
    EmptyMapping {
        /// The offending mapping.
        mapping: IdMapping,
    },

    /// A mount destination is relative or climbs out of the rootfs.
    #[error("mount destination {path} must be absolute and must not contain '..'")]
    InvalidMountDestination {
        /// The offending destination.
        path: PathBuf,
    },

    /// A hostname was set without a UTS namespace.
    #[error("setting a hostname requires a UTS namespace")]
    HostnameWithoutUts,

    /// A capability name is unknown or a set exceeds the bounding set.
    #[error("invalid capabilities: {message}")]
    InvalidCapabilities {
        /// Description of the problem.
        message: String,
    },

    /// A soft rlimit exceeds its hard limit.
    #[error("rlimit {kind}: soft limit {soft} exceeds hard limit {hard}")]
    InvalidRlimit {
        /// Resource name.
        kind: String,
        /// Soft limit.
        soft: u64,
        /// Hard limit.
        hard: u64,
    },
}

/// Validated, immutable description of a container's isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationSpec {
    rootfs: PathBuf,
    readonly_root: bool,
    no_new_privileges: bool,
    rootless: bool,
    capabilities: CapabilitySets,
    namespaces: NamespaceSet,
    cgroup: CgroupSpec,
    masked_paths: Vec<PathBuf>,
    readonly_paths: Vec<PathBuf>,
    mounts: Vec<Mount>,
    devices: Vec<PathBuf>,
    rlimits: Vec<Rlimit>,
    uid_mappings: Vec<IdMapping>,
    gid_mappings: Vec<IdMapping>,
    hostname: Option<String>,
}

impl IsolationSpec {
    /// Absolute path of the container's root filesystem on the host.
    #[must_use]
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Whether the root filesystem is remounted read-only.
    #[must_use]
    pub const fn readonly_root(&self) -> bool {
        self.readonly_root
    }

    /// Whether `PR_SET_NO_NEW_PRIVS` is set before exec.
    #[must_use]
    pub const fn no_new_privileges(&self) -> bool {
        self.no_new_privileges
    }

    /// Whether the container runs without host privileges.
    #[must_use]
    pub const fn rootless(&self) -> bool {
        self.rootless
    }

    /// The five capability sets.
    #[must_use]
    pub const fn capabilities(&self) -> &CapabilitySets {
        &self.capabilities
    }

    /// Namespaces created for the container.
    #[must_use]
    pub const fn namespaces(&self) -> &NamespaceSet {
        &self.namespaces
    }

    /// Returns whether the namespace of `kind` is created.
    #[must_use]
    pub fn has_namespace(&self, kind: NamespaceKind) -> bool {
        self.namespaces.contains(&kind)
    }

    /// Cgroup placement and limits.
    #[must_use]
    pub const fn cgroup(&self) -> &CgroupSpec {
        &self.cgroup
    }

    /// Paths hidden from the container.
    #[must_use]
    pub fn masked_paths(&self) -> &[PathBuf] {
        &self.masked_paths
    }

    /// Paths made read-only inside the container.
    #[must_use]
    pub fn readonly_paths(&self) -> &[PathBuf] {
        &self.readonly_paths
    }

    /// Mounts performed below the rootfs, in order.
    #[must_use]
    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// Host device nodes exposed in the container's `/dev`.
    #[must_use]
    pub fn devices(&self) -> &[PathBuf] {
        &self.devices
    }

    /// Resource limits applied before exec.
    #[must_use]
    pub fn rlimits(&self) -> &[Rlimit] {
        &self.rlimits
    }

    /// UID mappings of the user namespace.
    #[must_use]
    pub fn uid_mappings(&self) -> &[IdMapping] {
        &self.uid_mappings
    }

    /// GID mappings of the user namespace.
    #[must_use]
    pub fn gid_mappings(&self) -> &[IdMapping] {
        &self.gid_mappings
    }

    /// Hostname set inside the UTS namespace.
    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Checks every structural rule of a spec.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.rootfs.as_os_str().is_empty() {
            return Err(ValidationError::MissingRootfs);
        }
        if !self.rootfs.is_absolute() {
            return Err(ValidationError::RelativeRootfs {
                path: self.rootfs.clone(),
            });
        }

        let user_ns = self.has_namespace(NamespaceKind::User);
        if self.rootless && !user_ns {
            return Err(ValidationError::RootlessWithoutUserNamespace);
        }
        let has_mappings = !self.uid_mappings.is_empty() || !self.gid_mappings.is_empty();
        if user_ns && (self.uid_mappings.is_empty() || self.gid_mappings.is_empty()) {
            return Err(ValidationError::MissingIdMappings);
        }
        if !user_ns && has_mappings {
            return Err(ValidationError::MappingsWithoutUserNamespace);
        }
        if let Some(mapping) = self
            .uid_mappings
            .iter()
            .chain(&self.gid_mappings)
            .find(|m| m.size == 0)
        {
            return Err(ValidationError::EmptyMapping { mapping: *mapping });
        }

        if let Some(mount) = self
            .mounts
            .iter()
            .find(|m| !is_contained_path(&m.destination))
        {
            return Err(ValidationError::InvalidMountDestination {
                path: mount.destination.clone(),
            });
        }

        if self.hostname.is_some() && !self.has_namespace(NamespaceKind::Uts) {
            return Err(ValidationError::HostnameWithoutUts);
        }

        self.capabilities
            .validate()
            .map_err(|e| ValidationError::InvalidCapabilities {
                message: e.to_string(),
            })?;

        if let Some(limit) = self.rlimits.iter().find(|l| !l.is_consistent()) {
            return Err(ValidationError::InvalidRlimit {
                kind: limit.kind.to_string(),
                soft: limit.soft,
                hard: limit.hard,
            });
        }
        Ok(())
    }
}
