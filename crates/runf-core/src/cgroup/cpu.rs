//! CPU resource control via cgroups v2.
//!
//! Manages `cpu.weight`.

use std::path::Path;

use runf_common::error::{Result, RunfError};

/// Sets the CPU weight for a cgroup.
///
/// Weight is a value between 1 and 10000 that controls the relative
/// share of CPU time this cgroup receives under contention.
///
/// # Errors
///
/// Returns an error if the weight is out of range or writing to
/// `cpu.weight` fails.
pub fn set_cpu_weight(cgroup_path: &Path, weight: u64) -> Result<()> {
    if !(1..=10_000).contains(&weight) {
        return Err(RunfError::Config {
            message: format!("cpu weight {weight} outside 1..=10000"),
        });
    }
    let file = cgroup_path.join("cpu.weight");
    std::fs::write(&file, weight.to_string()).map_err(|e| RunfError::io(&file, e))?;
    tracing::debug!(weight, "CPU weight set");
    Ok(())
}
