//! Starting the target process inside a container and waiting for it.
//!
//! The driver half of the handshake lives here; the init half is in
//! [`crate::init`].

use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use runf_common::error::RunfError;
use runf_common::types::ContainerState;
use runf_core::namespace::NamespaceKind;
use runf_core::process::{ProcessArgs, container_environment};
use runf_core::provider::{ExitStatus, InitSpawn, IsolationProvider, Stdio, StdioBindings};

use crate::container::{Container, ReapGate};
use crate::error::{RunError, WaitError};
use crate::handshake::{HandshakeError, InitConfig, SyncChannel, SyncMessage};

/// The command to run in a container, consumed by [`Container::run`].
#[derive(Debug)]
pub struct ProcessSpec {
    /// Command and arguments.
    pub args: Vec<String>,
    /// Extra `KEY=VALUE` entries; they override the baseline environment.
    pub env: Vec<String>,
    /// `root`, a user name, `uid`, or `uid:gid`.
    pub user: String,
    /// Absolute working directory inside the container.
    pub cwd: PathBuf,
    /// Standard streams of the target.
    pub stdio: StdioBindings,
}

impl ProcessSpec {
    /// Runs `args` as root in `/` with inherited stdio.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            user: "root".to_owned(),
            cwd: PathBuf::from("/"),
            stdio: StdioBindings::default(),
        }
    }

    /// Adds an environment entry.
    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }

    /// Sets the user.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Binds standard input.
    #[must_use]
    pub fn stdin(mut self, stdin: Stdio) -> Self {
        self.stdio.stdin = stdin;
        self
    }

    /// Binds standard output.
    #[must_use]
    pub fn stdout(mut self, stdout: Stdio) -> Self {
        self.stdio.stdout = stdout;
        self
    }

    /// Binds standard error.
    #[must_use]
    pub fn stderr(mut self, stderr: Stdio) -> Self {
        self.stdio.stderr = stderr;
        self
    }
}

/// A process running in a container.
///
/// Cheap to clone; clones can signal the process from other threads while
/// the owner waits on it. Once the process has been reaped, signals are
/// dropped instead of reaching a recycled pid.
#[derive(Debug, Clone)]
pub struct Process {
    pid: Pid,
    provider: Arc<dyn IsolationProvider>,
    gate: Arc<ReapGate>,
}

impl Process {
    /// Host PID of the container's init, which became the target.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Sends a signal to the process. Does nothing once it has been reaped.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    pub fn signal(&self, signal: Signal) -> Result<(), RunfError> {
        self.gate
            .unless_reaped(|| {
                tracing::debug!(pid = self.pid.as_raw(), %signal, "signalling container process");
                self.provider.signal(self.pid, signal)
            })
            .unwrap_or_else(|| {
                tracing::debug!(
                    pid = self.pid.as_raw(),
                    %signal,
                    "process already reaped, not signalling"
                );
                Ok(())
            })
    }
}

impl Container {
    /// Starts `process` inside the container.
    ///
    /// Returns once the target has been executed. On any failure, including
    /// a rejected process or a container that already ran one, the init
    /// process is killed and the container destroyed before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::AlreadyDestroyed`] after [`Container::destroy`],
    /// [`RunError::InvalidState`] if a process already ran, and the
    /// remaining variants for failures while starting.
    pub fn run(&mut self, process: ProcessSpec) -> Result<Process, RunError> {
        match self.start(process) {
            Ok(pid) => {
                self.transition(ContainerState::Running);
                tracing::info!(id = %self.id, pid = pid.as_raw(), "container process started");
                Ok(Process {
                    pid,
                    provider: Arc::clone(&self.provider),
                    gate: Arc::clone(&self.reap_gate),
                })
            }
            Err(e) => {
                tracing::warn!(id = %self.id, error = %e, "container start failed, destroying");
                if let Err(cleanup) = self.destroy() {
                    tracing::warn!(
                        id = %self.id,
                        error = %cleanup,
                        "cleanup after failed start incomplete"
                    );
                }
                Err(e)
            }
        }
    }

    fn start(&mut self, process: ProcessSpec) -> Result<Pid, RunError> {
        if self.is_destroyed() {
            return Err(RunError::AlreadyDestroyed);
        }
        if self.state != ContainerState::Created {
            return Err(RunError::InvalidState { state: self.state });
        }

        let hostname = self.spec.hostname().unwrap_or(self.id.as_str()).to_owned();
        let args = ProcessArgs {
            args: process.args,
            env: container_environment(&hostname, &process.env),
            user: process.user,
            cwd: process.cwd,
        };
        args.validate()
            .map_err(|source| RunError::InvalidProcess { source })?;
        self.launch(args, &process.stdio)
    }

    /// Drives the host side of the handshake. The channel is dropped on
    /// return, so a waiting init sees EOF.
    fn launch(&mut self, args: ProcessArgs, stdio: &StdioBindings) -> Result<Pid, RunError> {
        let (mut channel, init_end) = SyncChannel::pair().map_err(HandshakeError::from)?;
        let pid = self
            .provider
            .spawn_init(InitSpawn {
                program: &self.config.init_path,
                args: &self.config.init_args,
                env: Vec::new(),
                namespaces: self.spec.namespaces(),
                stdio,
                sync: init_end,
            })
            .map_err(|source| RunError::Spawn { source })?;
        self.init_pid = Some(pid);
        tracing::debug!(id = %self.id, pid = pid.as_raw(), "init process spawned");

        channel.send(&SyncMessage::Bootstrap {
            config: Box::new(InitConfig {
                spec: self.spec.clone(),
                process: args,
            }),
        })?;

        if self.spec.has_namespace(NamespaceKind::User) {
            self.provider
                .write_id_mappings(pid, self.spec.uid_mappings(), self.spec.gid_mappings())
                .map_err(|source| RunError::Setup { source })?;
        }
        if let Some(cgroup) = &self.cgroup {
            self.provider
                .attach_cgroup(cgroup, pid)
                .map_err(|source| RunError::Setup { source })?;
        }
        channel.send(&SyncMessage::SetupComplete)?;

        match channel.recv()? {
            Some(SyncMessage::Ready) => {}
            Some(SyncMessage::Error { stage, message }) => {
                return Err(RunError::from_init(stage, message));
            }
            None => return Err(RunError::InitExited),
            Some(other) => return Err(HandshakeError::unexpected("ready", Some(&other)).into()),
        }
        match channel.recv()? {
            None => Ok(pid),
            Some(SyncMessage::Error { message, .. }) => Err(RunError::Exec { message }),
            Some(other) => Err(HandshakeError::unexpected("end of stream", Some(&other)).into()),
        }
    }

    /// Blocks until `process` exits and returns its status.
    ///
    /// There is no timeout; use [`Process::signal`] from another thread to
    /// cut it short.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::NotRunning`] if `process` is not this
    /// container's running process, [`WaitError::Wait`] if waiting fails.
    pub fn wait(&mut self, process: Process) -> Result<ExitStatus, WaitError> {
        let state = self.state();
        if state != ContainerState::Running || self.init_pid != Some(process.pid) {
            return Err(WaitError::NotRunning { state });
        }
        let status = self
            .reap(process.pid)
            .map_err(|source| WaitError::Wait { source })?;
        self.init_pid = None;
        self.transition(ContainerState::Stopped);
        tracing::info!(id = %self.id, %status, "container process exited");
        Ok(status)
    }
}
