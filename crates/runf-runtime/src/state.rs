//! Persistent state management.
//!
//! Every container keeps a `state.json` in its work directory so the
//! container can be inspected (and cleaned up by hand) without a daemon.
//! The file is replaced atomically on each lifecycle transition and
//! disappears with the work directory on destroy.

use std::path::{Path, PathBuf};

use runf_common::constants::STATE_FILE_NAME;
use runf_common::error::{Result, RunfError};
use runf_common::types::{ContainerId, ContainerState};
use serde::{Deserialize, Serialize};

/// Persistent record of a container's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Container identifier.
    pub id: ContainerId,
    /// Current lifecycle state.
    pub state: ContainerState,
    /// PID of the init process (if running).
    pub pid: Option<i32>,
    /// Root filesystem on the host.
    pub rootfs: PathBuf,
    /// Cgroup leaf, if one was created.
    pub cgroup: Option<PathBuf>,
    /// RFC 3339 timestamp of creation.
    pub created_at: String,
}

/// Loads the state entry stored in `dir`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_state(dir: &Path) -> Result<StateEntry> {
    let path = dir.join(STATE_FILE_NAME);
    tracing::debug!(path = %path.display(), "loading container state");
    let contents = std::fs::read_to_string(&path).map_err(|e| RunfError::io(&path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Persists the state entry to `dir` atomically.
///
/// The entry is written to a temporary file that is then renamed over
/// `state.json`, so readers never observe a partial file.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn save_state(dir: &Path, entry: &StateEntry) -> Result<()> {
    let path = dir.join(STATE_FILE_NAME);
    let tmp = dir.join(format!(".{STATE_FILE_NAME}.tmp"));
    let contents = serde_json::to_vec_pretty(entry)?;
    std::fs::write(&tmp, contents).map_err(|e| RunfError::io(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| RunfError::io(&path, e))?;
    tracing::debug!(path = %path.display(), state = %entry.state, "container state saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> StateEntry {
        StateEntry {
            id: ContainerId::new("demo"),
            state: ContainerState::Running,
            pid: Some(4242),
            rootfs: PathBuf::from("/srv/rootfs"),
            cgroup: None,
            created_at: "2026-01-01T00:00:00+00:00".into(),
        }
    }

    #[test]
    fn saved_state_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        save_state(dir.path(), &entry()).unwrap();
        assert_eq!(load_state(dir.path()).unwrap(), entry());
    }

    #[test]
    fn save_leaves_no_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        save_state(dir.path(), &entry()).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("state.json")]);
    }

    #[test]
    fn state_is_serialized_in_snake_case() {
        let dir = tempfile::tempdir().unwrap();
        save_state(dir.path(), &entry()).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("state.json")).unwrap();
        assert!(raw.contains("\"running\""));
    }

    #[test]
    fn missing_state_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_state(dir.path()), Err(RunfError::Io { .. })));
    }
}
