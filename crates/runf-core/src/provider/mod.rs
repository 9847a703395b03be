//! The seam between container lifecycle logic and the kernel.
//!
//! Every system call the runtime makes goes through an
//! [`IsolationProvider`]. The host-side half runs in the driver, the
//! init-side half runs inside the freshly cloned init process.

#[cfg(target_os = "linux")]
pub mod linux;

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use runf_common::error::Result;
use runf_common::types::ResourceLimits;

#[cfg(target_os = "linux")]
pub use linux::LinuxProvider;

use crate::capability::CapabilitySets;
use crate::namespace::NamespaceSet;
use crate::namespace::user::{IdKind, IdMapping, SubordinateRange};
use crate::process::{ProcessArgs, ProcessUser};
use crate::rlimit::Rlimit;
use crate::spec::IsolationSpec;

/// Where one standard stream of the target points.
#[derive(Debug, Default)]
pub enum Stdio {
    /// Keep the driver's stream.
    #[default]
    Inherit,
    /// Use the given descriptor.
    Fd(OwnedFd),
}

impl Stdio {
    /// The descriptor to install, if any.
    #[must_use]
    pub fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Self::Inherit => None,
            Self::Fd(fd) => Some(fd.as_raw_fd()),
        }
    }
}

/// The three standard streams of the target.
#[derive(Debug, Default)]
pub struct StdioBindings {
    /// Standard input.
    pub stdin: Stdio,
    /// Standard output.
    pub stdout: Stdio,
    /// Standard error.
    pub stderr: Stdio,
}

/// Everything needed to start the init process.
#[derive(Debug)]
pub struct InitSpawn<'a> {
    /// Executable re-invoked as init.
    pub program: &'a Path,
    /// Arguments after the program name.
    pub args: &'a [String],
    /// Extra environment for init.
    pub env: Vec<(String, String)>,
    /// Namespaces init is created in.
    pub namespaces: &'a NamespaceSet,
    /// Streams installed as init's (and so the target's) stdio.
    pub stdio: &'a StdioBindings,
    /// Init's end of the sync socket; closed in the driver once spawned.
    pub sync: UnixStream,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
}

impl ExitStatus {
    /// Shell-style exit code: the status, or `128 + signal`.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal,
        }
    }

    /// Returns whether the process exited with status 0.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Returned by [`IsolationProvider::exec`] when the provider does not
/// actually replace the process image. A real exec never returns success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replaced;

/// Kernel operations needed to create, run and tear down a container.
pub trait IsolationProvider: fmt::Debug + Send + Sync {
    /// Creates a cgroup leaf, enables controllers between `root` and it,
    /// and applies `limits`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cgroup cannot be created or a limit cannot
    /// be written; a partially created leaf is removed.
    fn create_cgroup(&self, root: &Path, path: &Path, limits: &ResourceLimits) -> Result<()>;

    /// Moves `pid` into the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` cannot be written.
    fn attach_cgroup(&self, path: &Path, pid: Pid) -> Result<()>;

    /// Removes a cgroup leaf. A missing leaf is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    fn remove_cgroup(&self, path: &Path) -> Result<()>;

    /// Ranges of host IDs delegated to `user` (`id` is its numeric ID).
    ///
    /// # Errors
    ///
    /// Returns an error if the subordinate ID file exists but cannot be read.
    fn subordinate_ranges(
        &self,
        kind: IdKind,
        user: &str,
        id: u32,
    ) -> Result<Vec<SubordinateRange>>;

    /// Starts the init process in new namespaces.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be created.
    fn spawn_init(&self, spawn: InitSpawn<'_>) -> Result<Pid>;

    /// Writes the user namespace ID maps of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if a map cannot be written.
    fn write_id_mappings(
        &self,
        pid: Pid,
        uid_mappings: &[IdMapping],
        gid_mappings: &[IdMapping],
    ) -> Result<()>;

    /// Sends a signal. A process that is already gone is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    fn signal(&self, pid: Pid, signal: Signal) -> Result<()>;

    /// Blocks until the process has exited without reaping it, so its pid
    /// stays reserved until [`IsolationProvider::wait`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is not a child or waiting fails.
    fn wait_exited(&self, pid: Pid) -> Result<()>;

    /// Blocks until the process ends and reaps it.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is not a child or waiting fails.
    fn wait(&self, pid: Pid) -> Result<ExitStatus>;

    /// Becomes root inside the new user namespace and detaches the mount
    /// tree from the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials or mount propagation cannot be
    /// changed.
    fn enter_namespaces(&self, spec: &IsolationSpec) -> Result<()>;

    /// Mounts, populates `/dev`, pivots into the rootfs, and applies the
    /// masked, read-only and read-only-root policies.
    ///
    /// # Errors
    ///
    /// Returns [`runf_common::error::RunfError::Mount`] for mount failures.
    fn prepare_rootfs(&self, spec: &IsolationSpec) -> Result<()>;

    /// Sets the hostname in the UTS namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if `sethostname(2)` fails.
    fn set_hostname(&self, hostname: &str) -> Result<()>;

    /// Applies resource limits to the calling process.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is rejected.
    fn apply_rlimits(&self, rlimits: &[Rlimit]) -> Result<()>;

    /// Switches to `user` and installs the capability sets.
    ///
    /// # Errors
    ///
    /// Returns an error if any credential or capability call fails.
    fn set_credentials(&self, user: ProcessUser, capabilities: &CapabilitySets) -> Result<()>;

    /// Sets `PR_SET_NO_NEW_PRIVS`.
    ///
    /// # Errors
    ///
    /// Returns an error if `prctl(2)` fails.
    fn set_no_new_privileges(&self) -> Result<()>;

    /// Replaces the calling process with the target.
    ///
    /// # Errors
    ///
    /// Returns an error if the target cannot be executed.
    fn exec(&self, process: &ProcessArgs) -> Result<Replaced>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaled_status_maps_to_shell_code() {
        assert_eq!(ExitStatus::Signaled(9).code(), 137);
        assert_eq!(ExitStatus::Exited(3).code(), 3);
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Signaled(15).success());
    }

    #[test]
    fn inherited_stdio_has_no_descriptor() {
        assert_eq!(StdioBindings::default().stdout.raw_fd(), None);
    }
}
