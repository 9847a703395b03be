//! I/O resource control via cgroups v2.

use std::path::Path;

use runf_common::error::{Result, RunfError};

/// Sets the default I/O weight for a cgroup.
///
/// # Errors
///
/// Returns an error if writing to `io.weight` fails.
pub fn set_io_weight(cgroup_path: &Path, weight: u16) -> Result<()> {
    let file = cgroup_path.join("io.weight");
    std::fs::write(&file, format!("default {weight}")).map_err(|e| RunfError::io(&file, e))?;
    tracing::debug!(weight, "I/O weight set");
    Ok(())
}
