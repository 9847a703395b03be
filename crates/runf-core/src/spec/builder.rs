//! Fluent construction of [`IsolationSpec`] values with secure defaults.

use std::path::PathBuf;

use runf_common::constants::DEFAULT_ROOTFS_DIR;
use runf_common::error::RunfError;
use runf_common::types::ResourceLimits;
use thiserror::Error;

use super::{IsolationSpec, ValidationError};
use crate::capability::{CapabilitySet, CapabilitySets};
use crate::cgroup::CgroupSpec;
use crate::filesystem::device::default_devices;
use crate::filesystem::mount::{Mount, default_mounts};
use crate::namespace::user::IdMapping;
use crate::namespace::{NamespaceKind, NamespaceSet, default_namespaces};
use crate::rlimit::{Rlimit, default_rlimits};

const DEFAULT_MASKED_PATHS: &[&str] = &[
    "/proc/kcore",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/sys/firmware",
    "/proc/scsi",
];

const DEFAULT_READONLY_PATHS: &[&str] = &[
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Failure to derive a spec from the invoking environment.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The passwd database could not be queried.
    #[error("failed to look up the invoking user: {source}")]
    IdentityLookup {
        /// Underlying error.
        source: RunfError,
    },

    /// The invoking uid has no passwd entry.
    #[error("invoking uid {uid} has no user entry")]
    UnknownUser {
        /// The unresolved uid.
        uid: u32,
    },

    /// The current working directory could not be determined.
    #[error("failed to resolve the working directory: {source}")]
    WorkingDirectory {
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The resulting spec is invalid.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// The user on whose behalf containers are created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Effective host uid.
    pub uid: u32,
    /// Effective host gid.
    pub gid: u32,
    /// Login name.
    pub name: String,
}

impl Identity {
    /// Reads the invoking process's uid and gid and resolves its user entry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::IdentityLookup`] if the passwd lookup
    /// fails and [`ConfigurationError::UnknownUser`] if there is no entry.
    #[cfg(unix)]
    pub fn current() -> Result<Self, ConfigurationError> {
        use nix::unistd::{User, getegid, geteuid};

        let uid = geteuid();
        let user = User::from_uid(uid)
            .map_err(|e| ConfigurationError::IdentityLookup {
                source: RunfError::syscall("getpwuid_r", e),
            })?
            .ok_or(ConfigurationError::UnknownUser { uid: uid.as_raw() })?;
        Ok(Self {
            uid: uid.as_raw(),
            gid: getegid().as_raw(),
            name: user.name,
        })
    }
}

impl IsolationSpec {
    /// Starts a builder with the default rootless configuration for `id`,
    /// mapping container root onto `identity`.
    ///
    /// The rootfs is left unset.
    #[must_use]
    pub fn builder(id: &str, identity: &Identity) -> SpecBuilder {
        SpecBuilder::defaults(id, identity)
    }

    /// Starts a builder for the invoking user with `<cwd>/rootfs` as rootfs.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the identity or working directory
    /// cannot be resolved.
    #[cfg(unix)]
    pub fn for_current_user(id: &str) -> Result<SpecBuilder, ConfigurationError> {
        let identity = Identity::current()?;
        let cwd = std::env::current_dir()
            .map_err(|source| ConfigurationError::WorkingDirectory { source })?;
        Ok(Self::builder(id, &identity).rootfs(cwd.join(DEFAULT_ROOTFS_DIR)))
    }
}

/// Builder for [`IsolationSpec`].
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    spec: IsolationSpec,
}

impl SpecBuilder {
    fn defaults(id: &str, identity: &Identity) -> Self {
        Self {
            spec: IsolationSpec {
                rootfs: PathBuf::new(),
                readonly_root: true,
                no_new_privileges: true,
                rootless: true,
                capabilities: CapabilitySets::default(),
                namespaces: default_namespaces(),
                cgroup: CgroupSpec::default(),
                masked_paths: DEFAULT_MASKED_PATHS.iter().map(PathBuf::from).collect(),
                readonly_paths: DEFAULT_READONLY_PATHS.iter().map(PathBuf::from).collect(),
                mounts: default_mounts(),
                devices: default_devices(),
                rlimits: default_rlimits(),
                uid_mappings: vec![IdMapping::root_to(identity.uid)],
                gid_mappings: vec![IdMapping::root_to(identity.gid)],
                hostname: Some(id.to_owned()),
            },
        }
    }

    /// Sets the root filesystem.
    #[must_use]
    pub fn rootfs(mut self, rootfs: impl Into<PathBuf>) -> Self {
        self.spec.rootfs = rootfs.into();
        self
    }

    /// Sets whether the root filesystem is remounted read-only.
    #[must_use]
    pub const fn readonly_root(mut self, readonly: bool) -> Self {
        self.spec.readonly_root = readonly;
        self
    }

    /// Sets whether `PR_SET_NO_NEW_PRIVS` is applied.
    #[must_use]
    pub const fn no_new_privileges(mut self, enabled: bool) -> Self {
        self.spec.no_new_privileges = enabled;
        self
    }

    /// Sets rootless mode.
    #[must_use]
    pub const fn rootless(mut self, rootless: bool) -> Self {
        self.spec.rootless = rootless;
        self
    }

    /// Replaces all five capability sets with the same names.
    #[must_use]
    pub fn capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.spec.capabilities = CapabilitySets::uniform(names);
        self
    }

    /// Narrows a single capability set. The result must stay inside the
    /// bounding set or `build` fails.
    #[must_use]
    pub fn narrow_capabilities<I, S>(mut self, set: CapabilitySet, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.spec.capabilities.replace(set, names);
        self
    }

    /// Replaces the namespace set.
    #[must_use]
    pub fn namespaces(mut self, namespaces: NamespaceSet) -> Self {
        self.spec.namespaces = namespaces;
        self
    }

    /// Adds a namespace.
    #[must_use]
    pub fn add_namespace(mut self, kind: NamespaceKind) -> Self {
        let _ = self.spec.namespaces.insert(kind);
        self
    }

    /// Removes a namespace.
    #[must_use]
    pub fn remove_namespace(mut self, kind: NamespaceKind) -> Self {
        let _ = self.spec.namespaces.remove(&kind);
        self
    }

    /// Replaces cgroup placement and limits.
    #[must_use]
    pub fn cgroup(mut self, cgroup: CgroupSpec) -> Self {
        self.spec.cgroup = cgroup;
        self
    }

    /// Sets the cgroup resource limits.
    #[must_use]
    pub const fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.spec.cgroup.limits = limits;
        self
    }

    /// Replaces the masked paths.
    #[must_use]
    pub fn masked_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.spec.masked_paths = paths;
        self
    }

    /// Replaces the read-only paths.
    #[must_use]
    pub fn readonly_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.spec.readonly_paths = paths;
        self
    }

    /// Replaces the mount list.
    #[must_use]
    pub fn mounts(mut self, mounts: Vec<Mount>) -> Self {
        self.spec.mounts = mounts;
        self
    }

    /// Appends a mount after the existing ones.
    #[must_use]
    pub fn add_mount(mut self, mount: Mount) -> Self {
        self.spec.mounts.push(mount);
        self
    }

    /// Replaces the host devices exposed in `/dev`.
    #[must_use]
    pub fn devices(mut self, devices: Vec<PathBuf>) -> Self {
        self.spec.devices = devices;
        self
    }

    /// Replaces the resource limits applied before exec.
    #[must_use]
    pub fn rlimits(mut self, rlimits: Vec<Rlimit>) -> Self {
        self.spec.rlimits = rlimits;
        self
    }

    /// Replaces the UID mappings.
    #[must_use]
    pub fn uid_mappings(mut self, mappings: Vec<IdMapping>) -> Self {
        self.spec.uid_mappings = mappings;
        self
    }

    /// Replaces the GID mappings.
    #[must_use]
    pub fn gid_mappings(mut self, mappings: Vec<IdMapping>) -> Self {
        self.spec.gid_mappings = mappings;
        self
    }

    /// Sets or clears the hostname.
    #[must_use]
    pub fn hostname<S: Into<String>>(mut self, hostname: Option<S>) -> Self {
        self.spec.hostname = hostname.map(Into::into);
        self
    }

    /// Validates and returns the spec.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] the configuration breaks.
    pub fn build(self) -> Result<IsolationSpec, ValidationError> {
        self.spec.validate()?;
        tracing::debug!(rootfs = %self.spec.rootfs.display(), "isolation spec built");
        Ok(self.spec)
    }
}
