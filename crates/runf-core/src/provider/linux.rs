//! The Linux isolation provider.
//!
//! The init process is created with `clone(2)` so it is born inside every
//! requested namespace (and becomes PID 1 of a new PID namespace). The
//! cloned child only installs its stdio and re-executes the runtime binary;
//! everything else happens in the init entry point after the handshake.

use std::ffi::{CString, c_char};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use runf_common::constants::SYNC_FD_ENV;
use runf_common::error::{Result, RunfError};
use runf_common::types::ResourceLimits;

use super::{ExitStatus, InitSpawn, IsolationProvider, Replaced};
use crate::capability::{self, CapabilitySets};
use crate::cgroup::CgroupManager;
use crate::filesystem::mount::{self, check_supported, mount_into, parse_filesystems};
use crate::filesystem::{device, pivot_root};
use crate::namespace::user::{self, IdKind, IdMapping, SubordinateRange, parse_subordinate_ranges};
use crate::namespace::{NamespaceKind, clone_flags, uts};
use crate::process::{self, ProcessArgs, ProcessUser};
use crate::rlimit::{self, Rlimit};
use crate::spec::IsolationSpec;

/// Stack handed to the cloned child; it only runs until `execve`.
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Exit status of the cloned child when stdio cannot be installed.
const CHILD_SETUP_FAILED: isize = 126;

/// Exit status of the cloned child when `execve` fails.
const CHILD_EXEC_FAILED: isize = 127;

/// Performs every operation with real system calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxProvider;

impl LinuxProvider {
    /// Creates the provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| RunfError::Config {
        message: format!("NUL byte in {:?}", String::from_utf8_lossy(bytes)),
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Body of the cloned child. Runs between `clone` and `execve` and only
/// makes async-signal-safe calls on memory prepared by the parent.
fn init_trampoline(
    program: &CString,
    argv: &[*const c_char],
    envp: &[*const c_char],
    stdio: &[(RawFd, Option<RawFd>); 3],
    sync_fd: RawFd,
) -> isize {
    for (target, source) in stdio {
        if let Some(source) = source {
            // SAFETY: dup2 on descriptors inherited from the parent.
            if unsafe { libc::dup2(*source, *target) } < 0 {
                return CHILD_SETUP_FAILED;
            }
        }
    }
    // SAFETY: clears FD_CLOEXEC so the sync socket survives the exec.
    if unsafe { libc::fcntl(sync_fd, libc::F_SETFD, 0) } < 0 {
        return CHILD_SETUP_FAILED;
    }
    // SAFETY: argv and envp are NULL-terminated arrays of pointers into
    // CStrings that outlive this call.
    let _ = unsafe { libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
    CHILD_EXEC_FAILED
}

impl IsolationProvider for LinuxProvider {
    fn create_cgroup(&self, root: &Path, path: &Path, limits: &ResourceLimits) -> Result<()> {
        let manager = CgroupManager::new(path.to_path_buf());
        manager.create()?;
        manager.enable_controllers(root, limits);
        if let Err(e) = manager.apply_limits(limits) {
            if let Err(cleanup) = manager.destroy() {
                tracing::warn!(
                    path = %path.display(),
                    error = %cleanup,
                    "failed to remove partial cgroup"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    fn attach_cgroup(&self, path: &Path, pid: Pid) -> Result<()> {
        CgroupManager::new(path.to_path_buf()).add_process(pid.as_raw().unsigned_abs())
    }

    fn remove_cgroup(&self, path: &Path) -> Result<()> {
        CgroupManager::new(path.to_path_buf()).destroy()
    }

    fn subordinate_ranges(
        &self,
        kind: IdKind,
        user: &str,
        id: u32,
    ) -> Result<Vec<SubordinateRange>> {
        let file = kind.subordinate_file();
        match std::fs::read_to_string(file) {
            Ok(contents) => Ok(parse_subordinate_ranges(&contents, user, id)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(RunfError::io(file, e)),
        }
    }

    fn spawn_init(&self, spawn: InitSpawn<'_>) -> Result<Pid> {
        let sync_fd = spawn.sync.as_raw_fd();

        let program = cstring(spawn.program.as_os_str().as_bytes())?;
        let mut args = vec![program.clone()];
        for arg in spawn.args {
            args.push(cstring(arg.as_bytes())?);
        }
        let mut env = Vec::with_capacity(spawn.env.len() + 1);
        for (key, value) in &spawn.env {
            env.push(cstring(format!("{key}={value}").as_bytes())?);
        }
        env.push(cstring(format!("{SYNC_FD_ENV}={sync_fd}").as_bytes())?);

        let argv = null_terminated(&args);
        let envp = null_terminated(&env);
        let stdio = [
            (libc::STDIN_FILENO, spawn.stdio.stdin.raw_fd()),
            (libc::STDOUT_FILENO, spawn.stdio.stdout.raw_fd()),
            (libc::STDERR_FILENO, spawn.stdio.stderr.raw_fd()),
        ];

        let mut stack = vec![0_u8; CHILD_STACK_SIZE];
        let flags = clone_flags(spawn.namespaces);
        let callback = Box::new(|| init_trampoline(&program, &argv, &envp, &stdio, sync_fd));

        // SAFETY: the child gets a copy of this address space and only runs
        // `init_trampoline`, which performs async-signal-safe calls on
        // buffers prepared above before replacing itself with `execve`.
        let pid = unsafe { nix::sched::clone(callback, &mut stack, flags, Some(libc::SIGCHLD)) }
            .map_err(|e| RunfError::syscall("clone", e))?;

        tracing::debug!(pid = pid.as_raw(), ?flags, "init process cloned");
        drop(spawn.sync);
        Ok(pid)
    }

    fn write_id_mappings(
        &self,
        pid: Pid,
        uid_mappings: &[IdMapping],
        gid_mappings: &[IdMapping],
    ) -> Result<()> {
        user::write_id_mappings(pid, uid_mappings, gid_mappings)
    }

    fn signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        match nix::sys::signal::kill(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(RunfError::syscall(format!("kill {pid} {signal}"), e)),
        }
    }

    fn wait_exited(&self, pid: Pid) -> Result<()> {
        use nix::sys::wait::{Id, WaitPidFlag, waitid};

        loop {
            match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => return Ok(()),
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(RunfError::syscall(format!("waitid {pid}"), e)),
            }
        }
    }

    fn wait(&self, pid: Pid) -> Result<ExitStatus> {
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::Exited(code)),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return Ok(ExitStatus::Signaled(signal as i32));
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(RunfError::syscall(format!("waitpid {pid}"), e)),
            }
        }
    }

    fn enter_namespaces(&self, spec: &IsolationSpec) -> Result<()> {
        use nix::unistd::{Gid, Uid, setresgid, setresuid};

        if spec.has_namespace(NamespaceKind::User) {
            let root_gid = Gid::from_raw(0);
            let root_uid = Uid::from_raw(0);
            setresgid(root_gid, root_gid, root_gid)
                .map_err(|e| RunfError::syscall("setresgid 0", e))?;
            setresuid(root_uid, root_uid, root_uid)
                .map_err(|e| RunfError::syscall("setresuid 0", e))?;
        }
        if spec.has_namespace(NamespaceKind::Mount) {
            mount::make_private(Path::new("/"))?;
        }
        tracing::debug!(namespaces = ?spec.namespaces(), "namespaces entered");
        Ok(())
    }

    fn prepare_rootfs(&self, spec: &IsolationSpec) -> Result<()> {
        let rootfs = spec.rootfs();
        pivot_root::prepare_new_root(rootfs)?;

        let filesystems = std::fs::read_to_string("/proc/filesystems")
            .map_err(|e| RunfError::io("/proc/filesystems", e))?;
        let supported = parse_filesystems(&filesystems);
        for entry in spec.mounts() {
            check_supported(entry, &supported)?;
            mount_into(rootfs, entry)?;
        }
        device::bind_devices(rootfs, spec.devices())?;
        device::create_dev_symlinks(rootfs)?;

        pivot_root::pivot_root(rootfs)?;

        for path in spec.masked_paths() {
            mount::mask_path(path)?;
        }
        for path in spec.readonly_paths() {
            mount::readonly_path(path)?;
        }
        if spec.readonly_root() {
            mount::remount_readonly(Path::new("/"))?;
        }
        tracing::debug!(rootfs = %rootfs.display(), "rootfs prepared");
        Ok(())
    }

    fn set_hostname(&self, hostname: &str) -> Result<()> {
        uts::set_hostname(hostname)
    }

    fn apply_rlimits(&self, rlimits: &[Rlimit]) -> Result<()> {
        rlimit::apply_rlimits(rlimits)
    }

    fn set_credentials(&self, user: ProcessUser, capabilities: &CapabilitySets) -> Result<()> {
        use nix::sys::prctl;
        use nix::unistd::{Gid, Uid, setgroups, setresgid, setresuid};

        capability::apply_bounding_set(capabilities)?;
        prctl::set_keepcaps(true).map_err(|e| RunfError::syscall("PR_SET_KEEPCAPS", e))?;

        let gid = Gid::from_raw(user.gid);
        let uid = Uid::from_raw(user.uid);
        // denied in rootless user namespaces where setgroups is disabled
        if let Err(e) = setgroups(&[gid]) {
            tracing::debug!(error = %e, "setgroups not permitted, keeping supplementary groups");
        }
        setresgid(gid, gid, gid).map_err(|e| RunfError::syscall(format!("setresgid {gid}"), e))?;
        setresuid(uid, uid, uid).map_err(|e| RunfError::syscall(format!("setresuid {uid}"), e))?;

        prctl::set_keepcaps(false).map_err(|e| RunfError::syscall("PR_SET_KEEPCAPS", e))?;
        capability::apply_process_sets(capabilities)?;
        tracing::debug!(uid = user.uid, gid = user.gid, "credentials set");
        Ok(())
    }

    fn set_no_new_privileges(&self) -> Result<()> {
        nix::sys::prctl::set_no_new_privs()
            .map_err(|e| RunfError::syscall("PR_SET_NO_NEW_PRIVS", e))
    }

    fn exec(&self, process: &ProcessArgs) -> Result<Replaced> {
        match process::exec(process)? {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_arrays_are_null_terminated() {
        let strings = vec![CString::new("a").unwrap(), CString::new("b").unwrap()];
        let pointers = null_terminated(&strings);
        assert_eq!(pointers.len(), 3);
        assert!(pointers[2].is_null());
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(cstring(b"bad\0arg").is_err());
    }

    #[test]
    fn missing_subordinate_file_means_no_ranges() {
        // an unknown user never has ranges, whether or not the file exists
        let ranges = LinuxProvider::new()
            .subordinate_ranges(IdKind::User, "runf-no-such-user", u32::MAX)
            .unwrap();
        assert!(ranges.is_empty());
    }

    #[test]
    fn exited_child_stays_reapable() {
        let child = std::process::Command::new("false").spawn().unwrap();
        let pid = Pid::from_raw(i32::try_from(child.id()).unwrap());
        let provider = LinuxProvider::new();
        provider.wait_exited(pid).unwrap();
        provider.wait_exited(pid).unwrap();
        assert_eq!(provider.wait(pid).unwrap(), ExitStatus::Exited(1));
    }

    #[test]
    fn signalling_a_reaped_process_is_ok() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = Pid::from_raw(i32::try_from(child.id()).unwrap());
        let status = LinuxProvider::new().wait(pid).unwrap();
        assert_eq!(status, ExitStatus::Exited(0));
        assert!(LinuxProvider::new().signal(pid, Signal::SIGTERM).is_ok());
    }
}
