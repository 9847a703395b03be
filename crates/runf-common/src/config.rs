//! Runtime configuration threaded through the factory and every container.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Root configuration for the runf runtime.
///
/// There is no process-wide instance: the driver builds one value and hands
/// it to the factory, which copies what each container needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory under which each container gets `<work_dir>/<id>`.
    pub work_dir: PathBuf,
    /// Mount point of the cgroups v2 unified hierarchy.
    pub cgroup_root: PathBuf,
    /// Executable re-invoked as the container's init process.
    pub init_path: PathBuf,
    /// Arguments passed to `init_path`; the first selects the init entry point.
    pub init_args: Vec<String>,
}

impl RuntimeConfig {
    /// Returns a configuration rooted at `work_dir` with all other defaults.
    #[must_use]
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(constants::DEFAULT_WORK_DIR),
            cgroup_root: PathBuf::from(constants::CGROUP_V2_PATH),
            init_path: PathBuf::from(constants::DEFAULT_INIT_PATH),
            init_args: vec![constants::INIT_SENTINEL.to_owned()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_init_strategy_reexecs_self() {
        let config = RuntimeConfig::default();
        assert_eq!(config.init_path, PathBuf::from("/proc/self/exe"));
        assert_eq!(config.init_args, vec!["init".to_owned()]);
    }

    #[test]
    fn with_work_dir_keeps_other_defaults() {
        let config = RuntimeConfig::with_work_dir("/run/user/1000/runf");
        assert_eq!(config.work_dir, PathBuf::from("/run/user/1000/runf"));
        assert_eq!(config.cgroup_root, PathBuf::from(constants::CGROUP_V2_PATH));
    }
}
