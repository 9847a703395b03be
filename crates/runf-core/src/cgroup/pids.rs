//! Task-count control via cgroups v2.

use std::path::Path;

use runf_common::error::{Result, RunfError};

/// Caps the number of tasks in a cgroup.
///
/// # Errors
///
/// Returns an error if writing to `pids.max` fails.
pub fn set_pids_max(cgroup_path: &Path, max: u64) -> Result<()> {
    let file = cgroup_path.join("pids.max");
    std::fs::write(&file, max.to_string()).map_err(|e| RunfError::io(&file, e))?;
    tracing::debug!(max, "pids max set");
    Ok(())
}
