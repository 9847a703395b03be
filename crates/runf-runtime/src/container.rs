//! The container handle and its teardown.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use runf_common::config::RuntimeConfig;
use runf_common::error::{Result, RunfError};
use runf_common::types::{ContainerId, ContainerState};
use runf_core::provider::{ExitStatus, IsolationProvider};
use runf_core::spec::IsolationSpec;

use crate::error::DestroyError;
use crate::state::{StateEntry, save_state};

/// Single-use guard making destroy run at most once.
#[derive(Debug, Default)]
pub(crate) struct DestroyOnce(AtomicBool);

impl DestroyOnce {
    /// Returns `true` for exactly one caller.
    pub(crate) fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Orders signals against reaping: once the init pid is about to be
/// reaped no further signal is sent to it, since the pid may be reused.
#[derive(Debug, Default)]
pub(crate) struct ReapGate(Mutex<bool>);

impl ReapGate {
    /// Runs `f` unless the process has been reaped, holding the gate so
    /// reaping cannot start meanwhile.
    #[allow(clippy::significant_drop_tightening)]
    pub(crate) fn unless_reaped<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let reaped = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *reaped { None } else { Some(f()) }
    }

    fn close(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

/// A created container owning its work directory, cgroup and init process.
///
/// Dropping the handle destroys the container.
#[derive(Debug)]
pub struct Container {
    pub(crate) id: ContainerId,
    pub(crate) spec: IsolationSpec,
    pub(crate) config: RuntimeConfig,
    pub(crate) state_dir: PathBuf,
    pub(crate) cgroup: Option<PathBuf>,
    pub(crate) provider: Arc<dyn IsolationProvider>,
    pub(crate) state: ContainerState,
    pub(crate) init_pid: Option<Pid>,
    pub(crate) reap_gate: Arc<ReapGate>,
    created_at: String,
    destroyed: DestroyOnce,
}

impl Container {
    pub(crate) fn new(
        id: ContainerId,
        spec: IsolationSpec,
        config: RuntimeConfig,
        state_dir: PathBuf,
        cgroup: Option<PathBuf>,
        provider: Arc<dyn IsolationProvider>,
    ) -> Self {
        Self {
            id,
            spec,
            config,
            state_dir,
            cgroup,
            provider,
            state: ContainerState::Created,
            init_pid: None,
            reap_gate: Arc::default(),
            created_at: chrono::Utc::now().to_rfc3339(),
            destroyed: DestroyOnce::default(),
        }
    }

    /// The container identifier.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// The spec the container was created from.
    #[must_use]
    pub const fn spec(&self) -> &IsolationSpec {
        &self.spec
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        if self.destroyed.is_claimed() {
            ContainerState::Destroyed
        } else {
            self.state
        }
    }

    /// The container's work directory, `<work_dir>/<id>`.
    #[must_use]
    pub fn work_dir(&self) -> &Path {
        &self.state_dir
    }

    /// The cgroup leaf, if one was created.
    #[must_use]
    pub fn cgroup_path(&self) -> Option<&Path> {
        self.cgroup.as_deref()
    }

    /// PID of the init process while it runs.
    #[must_use]
    pub const fn init_pid(&self) -> Option<Pid> {
        self.init_pid
    }

    /// RFC 3339 creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.is_claimed()
    }

    /// Waits for `pid` to exit, closes the reap gate, then reaps it.
    pub(crate) fn reap(&self, pid: Pid) -> Result<ExitStatus> {
        self.provider.wait_exited(pid)?;
        self.reap_gate.close();
        self.provider.wait(pid)
    }

    /// Writes the current state to `state.json`.
    pub(crate) fn save(&self) -> Result<()> {
        let entry = StateEntry {
            id: self.id.clone(),
            state: self.state,
            pid: self.init_pid.map(Pid::as_raw),
            rootfs: self.spec.rootfs().to_path_buf(),
            cgroup: self.cgroup.clone(),
            created_at: self.created_at.clone(),
        };
        save_state(&self.state_dir, &entry)
    }

    /// Records a transition and persists it; a failed write is only logged.
    pub(crate) fn transition(&mut self, state: ContainerState) {
        self.state = state;
        if let Err(e) = self.save() {
            tracing::warn!(id = %self.id, error = %e, "failed to persist container state");
        }
        tracing::info!(id = %self.id, %state, "container state changed");
    }

    /// Releases everything the container owns: kills and reaps a running
    /// init process, removes the cgroup and deletes the work directory.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    /// Every step is attempted even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns a [`DestroyError`] listing each step that failed.
    pub fn destroy(&self) -> std::result::Result<(), DestroyError> {
        if !self.destroyed.claim() {
            tracing::debug!(id = %self.id, "container already destroyed");
            return Ok(());
        }

        let mut failures = Vec::new();
        if let Some(pid) = self.init_pid {
            if let Err(e) = self.provider.signal(pid, Signal::SIGKILL) {
                failures.push(e);
            }
            match self.reap(pid) {
                Ok(status) => {
                    tracing::debug!(
                        id = %self.id,
                        pid = pid.as_raw(),
                        %status,
                        "init process reaped"
                    );
                }
                Err(e) => failures.push(e),
            }
        }
        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = self.provider.remove_cgroup(cgroup) {
                failures.push(e);
            }
        }
        match std::fs::remove_dir_all(&self.state_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => failures.push(RunfError::io(&self.state_dir, e)),
        }

        if failures.is_empty() {
            tracing::info!(id = %self.id, "container destroyed");
            Ok(())
        } else {
            for failure in &failures {
                tracing::warn!(id = %self.id, error = %failure, "container cleanup step failed");
            }
            Err(DestroyError { failures })
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!(id = %self.id, error = %e, "destroy on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_guard_is_claimed_once() {
        let guard = DestroyOnce::default();
        assert!(!guard.is_claimed());
        assert!(guard.claim());
        assert!(!guard.claim());
        assert!(guard.is_claimed());
    }

    #[test]
    fn reap_gate_blocks_work_once_closed() {
        let gate = ReapGate::default();
        assert_eq!(gate.unless_reaped(|| 7), Some(7));
        gate.close();
        assert_eq!(gate.unless_reaped(|| 7), None);
    }

    #[test]
    fn guard_is_claimed_once_across_threads() {
        let guard = Arc::new(DestroyOnce::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || guard.claim())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
