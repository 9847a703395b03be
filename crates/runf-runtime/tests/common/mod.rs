//! Shared fixtures for runtime integration tests.
//!
//! [`FakeProvider`] keeps the real handshake and init state machine but
//! replaces every privileged kernel call: `spawn_init` runs
//! [`Initializer`] on a thread, cgroups are plain directories, and the
//! init-side operations only record that they were called.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use runf_common::config::RuntimeConfig;
use runf_common::error::{Result, RunfError};
use runf_common::types::{ContainerId, ResourceLimits};
use runf_core::capability::CapabilitySets;
use runf_core::cgroup::CgroupManager;
use runf_core::filesystem::mount::{check_supported, parse_filesystems};
use runf_core::namespace::user::{IdKind, IdMapping, SubordinateRange};
use runf_core::process::{ProcessArgs, ProcessUser};
use runf_core::provider::{ExitStatus, InitSpawn, IsolationProvider, Replaced};
use runf_core::rlimit::Rlimit;
use runf_core::spec::{Identity, IsolationSpec, SpecBuilder};
use runf_runtime::ContainerFactory;
use runf_runtime::handshake::SyncChannel;
use runf_runtime::init::Initializer;
use tempfile::TempDir;

/// Filesystems the fake kernel supports.
const FAKE_FILESYSTEMS: &str = "nodev\tproc\nnodev\ttmpfs\nnodev\tdevpts\n";

type InitThread = JoinHandle<std::result::Result<Replaced, runf_runtime::StartInitializationError>>;

#[derive(Debug, Default)]
struct Inner {
    deny_namespace_entry: bool,
    next_pid: AtomicI32,
    calls: Mutex<Vec<String>>,
    threads: Mutex<HashMap<i32, InitThread>>,
    exits: Mutex<HashMap<i32, ExitStatus>>,
}

/// In-process provider driving the real init state machine.
#[derive(Debug, Clone, Default)]
pub struct FakeProvider {
    inner: Arc<Inner>,
}

impl FakeProvider {
    /// A provider on which every operation succeeds.
    pub fn new() -> Self {
        Self::with(false)
    }

    /// A provider whose init cannot enter its namespaces.
    pub fn denying_namespace_entry() -> Self {
        Self::with(true)
    }

    fn with(deny_namespace_entry: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                deny_namespace_entry,
                next_pid: AtomicI32::new(100_000),
                ..Inner::default()
            }),
        }
    }

    /// Every operation recorded so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().unwrap().clone()
    }

    /// Returns whether an operation with this name was called.
    pub fn called(&self, operation: &str) -> bool {
        self.calls().iter().any(|c| c == operation)
    }

    /// Exit status of a reaped fake init.
    pub fn exit_status(&self, pid: Pid) -> Option<ExitStatus> {
        self.inner.exits.lock().unwrap().get(&pid.as_raw()).copied()
    }

    /// The most recently spawned fake pid.
    pub fn last_pid(&self) -> Option<Pid> {
        let next = self.inner.next_pid.load(Ordering::SeqCst);
        (next > 100_000).then(|| Pid::from_raw(next - 1))
    }

    fn record(&self, operation: &str) {
        self.inner.calls.lock().unwrap().push(operation.to_owned());
    }
}

impl IsolationProvider for FakeProvider {
    fn create_cgroup(&self, _root: &Path, path: &Path, _limits: &ResourceLimits) -> Result<()> {
        self.record("create_cgroup");
        CgroupManager::new(path.to_path_buf()).create()
    }

    fn attach_cgroup(&self, _path: &Path, _pid: Pid) -> Result<()> {
        self.record("attach_cgroup");
        Ok(())
    }

    fn remove_cgroup(&self, path: &Path) -> Result<()> {
        self.record("remove_cgroup");
        CgroupManager::new(path.to_path_buf()).destroy()
    }

    fn subordinate_ranges(
        &self,
        _kind: IdKind,
        _user: &str,
        _id: u32,
    ) -> Result<Vec<SubordinateRange>> {
        self.record("subordinate_ranges");
        Ok(Vec::new())
    }

    fn spawn_init(&self, spawn: InitSpawn<'_>) -> Result<Pid> {
        self.record("spawn_init");
        let pid = self.inner.next_pid.fetch_add(1, Ordering::SeqCst);
        let channel = SyncChannel::new(spawn.sync)
            .map_err(|e| RunfError::syscall("dup sync socket", e))?;
        let provider = self.clone();
        let thread = std::thread::spawn(move || Initializer::new(&provider, channel).run());
        let _ = self.inner.threads.lock().unwrap().insert(pid, thread);
        Ok(Pid::from_raw(pid))
    }

    fn write_id_mappings(&self, _pid: Pid, _uid: &[IdMapping], _gid: &[IdMapping]) -> Result<()> {
        self.record("write_id_mappings");
        Ok(())
    }

    fn signal(&self, _pid: Pid, signal: Signal) -> Result<()> {
        self.record(&format!("signal {signal}"));
        Ok(())
    }

    fn wait_exited(&self, _pid: Pid) -> Result<()> {
        self.record("wait_exited");
        Ok(())
    }

    fn wait(&self, pid: Pid) -> Result<ExitStatus> {
        self.record("wait");
        let thread = self
            .inner
            .threads
            .lock()
            .unwrap()
            .remove(&pid.as_raw())
            .ok_or_else(|| RunfError::NotFound {
                kind: "process",
                id: pid.to_string(),
            })?;
        let status = match thread.join() {
            Ok(Ok(Replaced)) => ExitStatus::Exited(0),
            Ok(Err(_)) => ExitStatus::Exited(1),
            Err(_) => ExitStatus::Signaled(Signal::SIGABRT as i32),
        };
        let _ = self.inner.exits.lock().unwrap().insert(pid.as_raw(), status);
        Ok(status)
    }

    fn enter_namespaces(&self, _spec: &IsolationSpec) -> Result<()> {
        self.record("enter_namespaces");
        if self.inner.deny_namespace_entry {
            return Err(RunfError::PermissionDenied {
                message: "namespace entry denied".into(),
            });
        }
        Ok(())
    }

    fn prepare_rootfs(&self, spec: &IsolationSpec) -> Result<()> {
        self.record("prepare_rootfs");
        let supported: BTreeSet<String> = parse_filesystems(FAKE_FILESYSTEMS);
        for mount in spec.mounts() {
            check_supported(mount, &supported)?;
        }
        Ok(())
    }

    fn set_hostname(&self, _hostname: &str) -> Result<()> {
        self.record("set_hostname");
        Ok(())
    }

    fn apply_rlimits(&self, _rlimits: &[Rlimit]) -> Result<()> {
        self.record("apply_rlimits");
        Ok(())
    }

    fn set_credentials(&self, _user: ProcessUser, _capabilities: &CapabilitySets) -> Result<()> {
        self.record("set_credentials");
        Ok(())
    }

    fn set_no_new_privileges(&self) -> Result<()> {
        self.record("set_no_new_privileges");
        Ok(())
    }

    fn exec(&self, _process: &ProcessArgs) -> Result<Replaced> {
        self.record("exec");
        Ok(Replaced)
    }
}

/// Scratch directories for one test: a rootfs, a work dir and a cgroup root.
pub struct Sandbox {
    pub dir: TempDir,
    pub rootfs: PathBuf,
    pub work_dir: PathBuf,
    pub cgroup_root: PathBuf,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        let work_dir = dir.path().join("work");
        let cgroup_root = dir.path().join("cgroup");
        std::fs::create_dir_all(&rootfs).unwrap();
        std::fs::create_dir_all(&cgroup_root).unwrap();
        Self {
            dir,
            rootfs,
            work_dir,
            cgroup_root,
        }
    }

    pub fn config(&self) -> RuntimeConfig {
        RuntimeConfig {
            work_dir: self.work_dir.clone(),
            cgroup_root: self.cgroup_root.clone(),
            ..RuntimeConfig::default()
        }
    }

    pub fn factory(&self, provider: &FakeProvider) -> ContainerFactory {
        ContainerFactory::new(self.config(), Arc::new(provider.clone()))
    }

    /// The default spec for `id` rooted at this sandbox's rootfs.
    pub fn spec_builder(&self, id: &str) -> SpecBuilder {
        IsolationSpec::builder(id, &invoking_identity()).rootfs(&self.rootfs)
    }

    pub fn spec(&self, id: &str) -> IsolationSpec {
        self.spec_builder(id).build().unwrap()
    }

    /// Where the cgroup leaf of `id` is created under the default spec.
    pub fn cgroup_path(&self, id: &str) -> PathBuf {
        runf_core::cgroup::CgroupSpec::default().path_for(&self.cgroup_root, &ContainerId::new(id))
    }
}

/// The test process's own credentials, so ID mappings are self-mappings.
pub fn invoking_identity() -> Identity {
    Identity {
        uid: nix::unistd::geteuid().as_raw(),
        gid: nix::unistd::getegid().as_raw(),
        name: "runf-test".into(),
    }
}
