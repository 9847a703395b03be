//! Creation of containers from validated specs.

use std::path::PathBuf;
use std::sync::Arc;

use runf_common::config::RuntimeConfig;
use runf_common::error::RunfError;
use runf_common::types::ContainerId;
use runf_core::namespace::NamespaceKind;
use runf_core::namespace::user::{IdKind, check_mappings_permitted, is_self_mapping};
use runf_core::provider::IsolationProvider;
use runf_core::spec::IsolationSpec;

use crate::container::Container;
use crate::error::CreateError;

/// Creates containers that share one runtime configuration and provider.
#[derive(Debug, Clone)]
pub struct ContainerFactory {
    config: RuntimeConfig,
    provider: Arc<dyn IsolationProvider>,
}

impl ContainerFactory {
    /// Creates a factory using the given provider.
    #[must_use]
    pub fn new(config: RuntimeConfig, provider: Arc<dyn IsolationProvider>) -> Self {
        Self { config, provider }
    }

    /// Creates a factory backed by real system calls.
    #[cfg(target_os = "linux")]
    #[must_use]
    pub fn linux(config: RuntimeConfig) -> Self {
        Self::new(config, Arc::new(runf_core::provider::LinuxProvider::new()))
    }

    /// The runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Provisions a container: work directory, state file and cgroup.
    ///
    /// Everything is validated before anything is created, and a failure
    /// halfway through removes what was already created. No process is
    /// started.
    ///
    /// # Errors
    ///
    /// Returns a [`CreateError`] describing the first check or
    /// provisioning step that failed.
    pub fn create(&self, id: ContainerId, spec: IsolationSpec) -> Result<Container, CreateError> {
        id.validate().map_err(|source| CreateError::InvalidId { source })?;
        spec.validate()?;
        if !spec.rootfs().is_dir() {
            return Err(CreateError::RootfsNotFound {
                path: spec.rootfs().to_path_buf(),
            });
        }
        let state_dir = self.config.work_dir.join(id.as_str());
        if state_dir.exists() {
            return Err(CreateError::AlreadyExists { id });
        }
        self.check_id_mappings(&spec)?;

        std::fs::create_dir_all(&self.config.work_dir)
            .map_err(|e| CreateError::WorkDir {
                source: RunfError::io(&self.config.work_dir, e),
            })?;
        match std::fs::create_dir(&state_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CreateError::AlreadyExists { id });
            }
            Err(e) => {
                return Err(CreateError::WorkDir {
                    source: RunfError::io(&state_dir, e),
                });
            }
        }

        let cgroup = match self.provision_cgroup(&id, &spec) {
            Ok(cgroup) => cgroup,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&state_dir) {
                    tracing::warn!(
                        path = %state_dir.display(),
                        error = %cleanup,
                        "failed to remove work directory"
                    );
                }
                return Err(e);
            }
        };

        // from here on, dropping the container rolls back
        let container = Container::new(
            id,
            spec,
            self.config.clone(),
            state_dir,
            cgroup,
            Arc::clone(&self.provider),
        );
        container
            .save()
            .map_err(|source| CreateError::WorkDir { source })?;
        tracing::info!(
            id = %container.id(),
            rootfs = %container.spec().rootfs().display(),
            cgroup = ?container.cgroup_path(),
            "container created"
        );
        Ok(container)
    }

    fn provision_cgroup(
        &self,
        id: &ContainerId,
        spec: &IsolationSpec,
    ) -> Result<Option<PathBuf>, CreateError> {
        let root = &self.config.cgroup_root;
        let path = spec.cgroup().path_for(root, id);
        let limits = &spec.cgroup().limits;
        match self.provider.create_cgroup(root, &path, limits) {
            Ok(()) => Ok(Some(path)),
            Err(e) if spec.rootless() && limits.is_empty() && e.is_permission_denied() => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "no cgroup delegation, running without a cgroup"
                );
                Ok(None)
            }
            Err(source) => Err(CreateError::Cgroup { source }),
        }
    }

    /// Rejects mappings an unprivileged user is not delegated.
    fn check_id_mappings(&self, spec: &IsolationSpec) -> Result<(), CreateError> {
        use nix::unistd::{User, getegid, geteuid};

        let euid = geteuid();
        if euid.is_root() || !spec.has_namespace(NamespaceKind::User) {
            return Ok(());
        }
        let uid = euid.as_raw();
        let gid = getegid().as_raw();
        let checks = [
            (IdKind::User, spec.uid_mappings(), uid),
            (IdKind::Group, spec.gid_mappings(), gid),
        ];
        if checks.iter().all(|(_, mappings, own)| is_self_mapping(mappings, *own)) {
            return Ok(());
        }

        let name = User::from_uid(euid)
            .ok()
            .flatten()
            .map_or_else(|| uid.to_string(), |user| user.name);
        for (kind, mappings, own) in checks {
            if is_self_mapping(mappings, own) {
                continue;
            }
            let ranges = self
                .provider
                .subordinate_ranges(kind, &name, uid)
                .map_err(|source| CreateError::SubordinateIds { source })?;
            check_mappings_permitted(kind, mappings, own, &ranges)
                .map_err(|source| CreateError::SubordinateIds { source })?;
        }
        Ok(())
    }
}
