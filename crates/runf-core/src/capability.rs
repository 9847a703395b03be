//! Linux capability management for least-privilege execution.
//!
//! A container carries five capability sets. They start out identical and
//! can only be narrowed, never widened past the bounding set.

use std::collections::BTreeSet;
use std::fmt;

use runf_common::error::{Result, RunfError};
use serde::{Deserialize, Serialize};

/// Capabilities retained by every default container.
pub const DEFAULT_CAPABILITIES: &[&str] = &["CAP_AUDIT_WRITE", "CAP_KILL", "CAP_NET_BIND_SERVICE"];

/// One of the five per-process capability buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilitySet {
    /// Upper limit for every other set, inherited across `execve`.
    Bounding,
    /// Capabilities the process may assume.
    Permitted,
    /// Capabilities preserved across `execve` for capability-aware binaries.
    Inheritable,
    /// Capabilities preserved across `execve` for ordinary binaries.
    Ambient,
    /// Capabilities currently in force.
    Effective,
}

impl CapabilitySet {
    /// Every set, in the order they are reported.
    pub const ALL: [Self; 5] = [
        Self::Bounding,
        Self::Permitted,
        Self::Inheritable,
        Self::Ambient,
        Self::Effective,
    ];
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bounding => "bounding",
            Self::Permitted => "permitted",
            Self::Inheritable => "inheritable",
            Self::Ambient => "ambient",
            Self::Effective => "effective",
        };
        f.write_str(name)
    }
}

/// The five capability sets of a container, by canonical `CAP_*` name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySets {
    bounding: BTreeSet<String>,
    permitted: BTreeSet<String>,
    inheritable: BTreeSet<String>,
    ambient: BTreeSet<String>,
    effective: BTreeSet<String>,
}

impl CapabilitySets {
    /// Builds five identical sets from the given names.
    ///
    /// Names are canonicalized: `kill` and `CAP_KILL` are the same capability.
    pub fn uniform<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = names.into_iter().map(|n| canonical_name(n.as_ref())).collect();
        Self {
            bounding: set.clone(),
            permitted: set.clone(),
            inheritable: set.clone(),
            ambient: set.clone(),
            effective: set,
        }
    }

    /// Returns the named set.
    #[must_use]
    pub const fn get(&self, set: CapabilitySet) -> &BTreeSet<String> {
        match set {
            CapabilitySet::Bounding => &self.bounding,
            CapabilitySet::Permitted => &self.permitted,
            CapabilitySet::Inheritable => &self.inheritable,
            CapabilitySet::Ambient => &self.ambient,
            CapabilitySet::Effective => &self.effective,
        }
    }

    /// Replaces one set with the given names.
    pub fn replace<I, S>(&mut self, set: CapabilitySet, names: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = names.into_iter().map(|n| canonical_name(n.as_ref())).collect();
        match set {
            CapabilitySet::Bounding => self.bounding = names,
            CapabilitySet::Permitted => self.permitted = names,
            CapabilitySet::Inheritable => self.inheritable = names,
            CapabilitySet::Ambient => self.ambient = names,
            CapabilitySet::Effective => self.effective = names,
        }
    }

    /// Returns whether all five sets hold the same capabilities.
    #[must_use]
    pub fn is_uniform(&self) -> bool {
        CapabilitySet::ALL
            .iter()
            .all(|set| self.get(*set) == &self.bounding)
    }

    /// Checks that every name is a known capability and that no set
    /// exceeds the bounding set.
    ///
    /// # Errors
    ///
    /// Returns [`RunfError::Config`] naming the first offending capability.
    pub fn validate(&self) -> Result<()> {
        for set in CapabilitySet::ALL {
            for name in self.get(set) {
                if !is_known(name) {
                    return Err(RunfError::Config {
                        message: format!("unknown capability {name} in {set} set"),
                    });
                }
                if set != CapabilitySet::Bounding && !self.bounding.contains(name) {
                    return Err(RunfError::Config {
                        message: format!("{name} in {set} set is outside the bounding set"),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for CapabilitySets {
    fn default() -> Self {
        Self::uniform(DEFAULT_CAPABILITIES)
    }
}

/// Upper-cases a capability name and adds the `CAP_` prefix if missing.
#[must_use]
pub fn canonical_name(name: &str) -> String {
    let upper = name.trim().to_ascii_uppercase();
    if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    }
}

#[cfg(target_os = "linux")]
fn is_known(name: &str) -> bool {
    name.parse::<caps::Capability>().is_ok()
}

#[cfg(not(target_os = "linux"))]
fn is_known(name: &str) -> bool {
    name.len() > 4 && name[4..].bytes().all(|b| b.is_ascii_uppercase() || b == b'_')
}

#[cfg(target_os = "linux")]
fn to_caps(names: &BTreeSet<String>) -> Result<caps::CapsHashSet> {
    names
        .iter()
        .map(|name| {
            name.parse::<caps::Capability>().map_err(|e| RunfError::Config {
                message: format!("unknown capability {name}: {e}"),
            })
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn caps_error(operation: &str, err: &caps::errors::CapsError) -> RunfError {
    RunfError::PermissionDenied {
        message: format!("{operation}: {err}"),
    }
}

/// Drops every capability outside the bounding set.
///
/// Must run while the process still holds `CAP_SETPCAP`, i.e. before
/// switching to the target user.
///
/// # Errors
///
/// Returns an error if reading or shrinking the bounding set fails.
#[cfg(target_os = "linux")]
pub fn apply_bounding_set(sets: &CapabilitySets) -> Result<()> {
    use caps::CapSet;

    let keep = to_caps(sets.get(CapabilitySet::Bounding))?;
    let current =
        caps::read(None, CapSet::Bounding).map_err(|e| caps_error("read bounding set", &e))?;
    for cap in current.difference(&keep) {
        caps::drop(None, CapSet::Bounding, *cap)
            .map_err(|e| caps_error(&format!("drop {cap} from bounding set"), &e))?;
    }
    tracing::debug!(retained = keep.len(), "bounding set applied");
    Ok(())
}

/// Installs the inheritable, effective, permitted, and ambient sets.
///
/// The order matters: a capability can only be raised in the ambient set
/// once it is both permitted and inheritable.
///
/// # Errors
///
/// Returns an error if any `capset(2)` or ambient `prctl(2)` call fails.
#[cfg(target_os = "linux")]
pub fn apply_process_sets(sets: &CapabilitySets) -> Result<()> {
    use caps::CapSet;

    let order = [
        (CapabilitySet::Inheritable, CapSet::Inheritable),
        (CapabilitySet::Effective, CapSet::Effective),
        (CapabilitySet::Permitted, CapSet::Permitted),
        (CapabilitySet::Ambient, CapSet::Ambient),
    ];
    for (set, target) in order {
        let value = to_caps(sets.get(set))?;
        caps::set(None, target, &value)
            .map_err(|e| caps_error(&format!("set {set} capabilities"), &e))?;
    }
    tracing::info!(retained = sets.get(CapabilitySet::Effective).len(), "capabilities applied");
    Ok(())
}
