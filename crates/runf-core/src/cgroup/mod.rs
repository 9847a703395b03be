//! Cgroups v2 resource management.
//!
//! Every container gets its own leaf at
//! `<cgroup_root>/<parent>/<name>/<container id>` in the unified hierarchy.
//! Limits are written through subsystem-specific helpers.

pub mod cpu;
pub mod io;
pub mod memory;
pub mod pids;

use std::path::{Path, PathBuf};

use runf_common::constants::{DEFAULT_CGROUP_NAME, DEFAULT_CGROUP_PARENT};
use runf_common::error::{Result, RunfError};
use runf_common::types::{ContainerId, ResourceLimits};
use serde::{Deserialize, Serialize};

/// Declarative cgroup placement and limits for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupSpec {
    /// Name of the group holding runf containers.
    pub name: String,
    /// Parent path of that group, relative to the hierarchy root.
    pub parent: PathBuf,
    /// Limits applied to each container's leaf.
    pub limits: ResourceLimits,
}

impl CgroupSpec {
    /// Returns the leaf directory for `id` under the hierarchy mounted at `root`.
    #[must_use]
    pub fn path_for(&self, root: &Path, id: &ContainerId) -> PathBuf {
        root.join(&self.parent).join(&self.name).join(id.as_str())
    }
}

impl Default for CgroupSpec {
    fn default() -> Self {
        Self {
            name: DEFAULT_CGROUP_NAME.to_owned(),
            parent: PathBuf::from(DEFAULT_CGROUP_PARENT),
            limits: ResourceLimits::default(),
        }
    }
}

/// Handle to a cgroup for a specific container.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    path: PathBuf,
}

impl CgroupManager {
    /// Wraps an existing or to-be-created cgroup directory.
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Returns the cgroup directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the cgroup directory, including missing ancestors.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path).map_err(|e| RunfError::io(&self.path, e))?;
        tracing::info!(path = %self.path.display(), "cgroup created");
        Ok(())
    }

    /// Enables the controllers needed by `limits` in every ancestor between
    /// `root` and this cgroup.
    ///
    /// Failures are logged and ignored: an already-delegated hierarchy works
    /// without it, and a missing controller surfaces when limits are written.
    pub fn enable_controllers(&self, root: &Path, limits: &ResourceLimits) {
        let controllers = required_controllers(limits);
        if controllers.is_empty() {
            return;
        }
        let Ok(relative) = self.path.strip_prefix(root) else {
            return;
        };
        let line = controllers
            .iter()
            .map(|c| format!("+{c}"))
            .collect::<Vec<_>>()
            .join(" ");

        let mut current = root.to_path_buf();
        let mut components = relative.components().peekable();
        while let Some(component) = components.next() {
            if components.peek().is_none() {
                break;
            }
            let control = current.join("cgroup.subtree_control");
            if let Err(e) = std::fs::write(&control, &line) {
                tracing::warn!(
                    path = %control.display(),
                    error = %e,
                    "could not enable controllers"
                );
            }
            current.push(component);
        }
        let control = current.join("cgroup.subtree_control");
        if let Err(e) = std::fs::write(&control, &line) {
            tracing::warn!(path = %control.display(), error = %e, "could not enable controllers");
        }
    }

    /// Applies resource limits to this cgroup.
    ///
    /// Delegates to subsystem-specific writers for CPU, memory, I/O and pids.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to cgroup control files fails.
    pub fn apply_limits(&self, limits: &ResourceLimits) -> Result<()> {
        if let Some(mem) = limits.memory_bytes {
            memory::set_memory_max(&self.path, mem)?;
        }
        if let Some(cpu_weight) = limits.cpu_weight {
            cpu::set_cpu_weight(&self.path, cpu_weight)?;
        }
        if let Some(io_weight) = limits.io_weight {
            io::set_io_weight(&self.path, io_weight)?;
        }
        if let Some(max) = limits.pids_max {
            pids::set_pids_max(&self.path, max)?;
        }
        Ok(())
    }

    /// Adds a process to this cgroup by writing its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `cgroup.procs` fails.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        let procs_path = self.path.join("cgroup.procs");
        std::fs::write(&procs_path, pid.to_string()).map_err(|e| RunfError::io(&procs_path, e))?;
        tracing::debug!(pid, "added process to cgroup");
        Ok(())
    }

    /// Removes the cgroup leaf.
    ///
    /// Only the container's own directory is removed; the shared parent
    /// groups stay. A cgroup directory is removed with `rmdir(2)` and only
    /// succeeds once no process is left in it. A missing directory is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        match std::fs::remove_dir(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(RunfError::io(&self.path, e)),
        }
        tracing::info!(path = %self.path.display(), "cgroup destroyed");
        Ok(())
    }
}

fn required_controllers(limits: &ResourceLimits) -> Vec<&'static str> {
    let mut controllers = Vec::new();
    if limits.cpu_weight.is_some() {
        controllers.push("cpu");
    }
    if limits.memory_bytes.is_some() {
        controllers.push("memory");
    }
    if limits.io_weight.is_some() {
        controllers.push("io");
    }
    if limits.pids_max.is_some() {
        controllers.push("pids");
    }
    controllers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_path_nests_parent_name_and_id() {
        let spec = CgroupSpec::default();
        let path = spec.path_for(Path::new("/sys/fs/cgroup"), &ContainerId::new("demo"));
        assert_eq!(path, PathBuf::from("/sys/fs/cgroup/system/runf/demo"));
    }

    #[test]
    fn create_and_destroy_leave_parents_in_place() {
        let root = tempfile::tempdir().unwrap();
        let path = CgroupSpec::default().path_for(root.path(), &ContainerId::new("demo"));
        let manager = CgroupManager::new(path.clone());

        manager.create().unwrap();
        assert!(path.is_dir());

        manager.destroy().unwrap();
        assert!(!path.exists());
        assert!(root.path().join("system/runf").is_dir());
    }

    #[test]
    fn destroy_of_missing_cgroup_is_ok() {
        let root = tempfile::tempdir().unwrap();
        let manager = CgroupManager::new(root.path().join("gone"));
        assert!(manager.destroy().is_ok());
    }

    #[test]
    fn limits_are_written_to_control_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CgroupManager::new(dir.path().to_path_buf());
        let limits = ResourceLimits {
            memory_bytes: Some(64 * 1024 * 1024),
            pids_max: Some(32),
            ..ResourceLimits::default()
        };
        manager.apply_limits(&limits).unwrap();
        let memory = std::fs::read_to_string(dir.path().join("memory.max")).unwrap();
        let pids = std::fs::read_to_string(dir.path().join("pids.max")).unwrap();
        assert_eq!(memory, "67108864");
        assert_eq!(pids, "32");
    }

    #[test]
    fn controllers_are_enabled_down_to_the_parent() {
        let root = tempfile::tempdir().unwrap();
        let path = CgroupSpec::default().path_for(root.path(), &ContainerId::new("demo"));
        let manager = CgroupManager::new(path);
        manager.create().unwrap();
        let limits = ResourceLimits {
            pids_max: Some(8),
            ..ResourceLimits::default()
        };
        manager.enable_controllers(root.path(), &limits);

        let dirs = [
            root.path().to_path_buf(),
            root.path().join("system"),
            root.path().join("system/runf"),
        ];
        for dir in dirs {
            let control = std::fs::read_to_string(dir.join("cgroup.subtree_control")).unwrap();
            assert_eq!(control, "+pids");
        }
        assert!(!root.path().join("system/runf/demo/cgroup.subtree_control").exists());
    }

    #[test]
    fn add_process_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CgroupManager::new(dir.path().to_path_buf());
        manager.add_process(4242).unwrap();
        let procs = std::fs::read_to_string(dir.path().join("cgroup.procs")).unwrap();
        assert_eq!(procs, "4242");
    }
}
