//! The init entry point, run when the binary is re-executed inside a new
//! container.
//!
//! Init walks `Unstarted → InitRequested → NamespaceEntered → Ready →
//! Execed`, driven by messages from the driver over the sync socket. Every
//! failure is reported back to the driver before init exits.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use runf_common::constants::{INIT_SENTINEL, SYNC_FD_ENV};
use runf_common::error::{Result, RunfError};
use runf_core::process::resolve_user;
use runf_core::provider::{IsolationProvider, Replaced};

use crate::error::StartInitializationError;
use crate::handshake::{HandshakeError, InitConfig, InitStage, SyncChannel, SyncMessage};

/// Progress of the init state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// Nothing received yet.
    Unstarted,
    /// The bootstrap arrived.
    InitRequested,
    /// Credentials and mount propagation inside the namespaces are set.
    NamespaceEntered,
    /// Isolation is complete and the driver has been told.
    Ready,
    /// The target has been executed.
    Execed,
}

/// Returns whether this process was started as a container's init.
#[must_use]
pub fn is_init_invocation() -> bool {
    is_init_args(std::env::args_os().map(|arg| arg.to_string_lossy().into_owned()))
}

/// Returns whether an argument vector selects the init entry point.
#[must_use]
pub fn is_init_args<I, S>(args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .nth(1)
        .is_some_and(|arg| arg.as_ref() == INIT_SENTINEL)
}

/// Parses the `Threads:` line of `/proc/<pid>/status`.
#[must_use]
pub fn thread_count(status: &str) -> Option<usize> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|count| count.trim().parse().ok())
}

fn ensure_single_threaded() -> std::result::Result<(), StartInitializationError> {
    let status = std::fs::read_to_string("/proc/self/status").map_err(|e| {
        StartInitializationError::Stage {
            stage: InitStage::Handshake,
            source: RunfError::io("/proc/self/status", e),
        }
    })?;
    match thread_count(&status) {
        Some(1) => Ok(()),
        Some(count) => Err(StartInitializationError::NotSingleThreaded(count)),
        None => Err(StartInitializationError::Stage {
            stage: InitStage::Handshake,
            source: RunfError::Config {
                message: "no thread count in /proc/self/status".into(),
            },
        }),
    }
}

fn channel_from_env() -> std::result::Result<SyncChannel, StartInitializationError> {
    use nix::fcntl::{FcntlArg, FdFlag, fcntl};

    let raw: RawFd = std::env::var(SYNC_FD_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .filter(|fd| *fd > 2)
        .ok_or(StartInitializationError::MissingSyncFd)?;
    // SAFETY: the driver left this descriptor open across exec for us and
    // nothing else in this process refers to it.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    let _ = fcntl(&fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(|e| {
        StartInitializationError::Stage {
            stage: InitStage::Handshake,
            source: RunfError::syscall("set close-on-exec on sync socket", e),
        }
    })?;
    SyncChannel::new(UnixStream::from(fd)).map_err(|e| HandshakeError::Io(e).into())
}

/// Runs the init process and exits.
///
/// On success the calling process is replaced by the target and this
/// function never gets to exit. Any failure is reported to the driver and
/// the process exits with status 1.
pub fn start_initialization(provider: &dyn IsolationProvider) -> ! {
    let code = match ensure_single_threaded()
        .and_then(|()| channel_from_env())
        .and_then(|channel| Initializer::new(provider, channel).run())
    {
        Ok(Replaced) => 0,
        Err(e) => {
            tracing::error!(error = %e, "container init failed");
            1
        }
    };
    std::process::exit(code)
}

/// The init state machine over one sync channel.
#[derive(Debug)]
pub struct Initializer<'a> {
    provider: &'a dyn IsolationProvider,
    channel: SyncChannel,
    state: InitState,
}

impl<'a> Initializer<'a> {
    /// Prepares to initialize a container over `channel`.
    #[must_use]
    pub fn new(provider: &'a dyn IsolationProvider, channel: SyncChannel) -> Self {
        Self {
            provider,
            channel,
            state: InitState::Unstarted,
        }
    }

    /// How far initialization got.
    #[must_use]
    pub const fn state(&self) -> InitState {
        self.state
    }

    /// Runs every stage through to exec.
    ///
    /// # Errors
    ///
    /// Returns the first failure after reporting it to the driver.
    pub fn run(&mut self) -> std::result::Result<Replaced, StartInitializationError> {
        self.run_stages().inspect_err(|e| {
            let report = SyncMessage::Error {
                stage: e.stage(),
                message: e.to_string(),
            };
            if let Err(send) = self.channel.send(&report) {
                tracing::debug!(error = %send, "could not report init failure");
            }
        })
    }

    fn run_stages(&mut self) -> std::result::Result<Replaced, StartInitializationError> {
        let config: InitConfig = match self.channel.recv()? {
            Some(SyncMessage::Bootstrap { config }) => *config,
            other => return Err(HandshakeError::unexpected("bootstrap", other.as_ref()).into()),
        };
        self.state = InitState::InitRequested;

        match self.channel.recv()? {
            Some(SyncMessage::SetupComplete) => {}
            other => {
                return Err(HandshakeError::unexpected("setup_complete", other.as_ref()).into());
            }
        }

        let spec = &config.spec;
        let provider = self.provider;
        at(InitStage::Namespaces, provider.enter_namespaces(spec))?;
        self.state = InitState::NamespaceEntered;

        at(InitStage::Rootfs, provider.prepare_rootfs(spec))?;
        if let Some(hostname) = spec.hostname() {
            at(InitStage::Hostname, provider.set_hostname(hostname))?;
        }
        at(InitStage::Rlimits, provider.apply_rlimits(spec.rlimits()))?;
        let user = at(InitStage::User, resolve_user(&config.process.user))?;
        at(InitStage::Credentials, provider.set_credentials(user, spec.capabilities()))?;
        if spec.no_new_privileges() {
            at(InitStage::NoNewPrivileges, provider.set_no_new_privileges())?;
        }

        self.channel.send(&SyncMessage::Ready)?;
        self.state = InitState::Ready;

        let replaced = at(InitStage::Exec, provider.exec(&config.process))?;
        self.state = InitState::Execed;
        Ok(replaced)
    }
}

fn at<T>(stage: InitStage, result: Result<T>) -> std::result::Result<T, StartInitializationError> {
    result.map_err(|source| StartInitializationError::Stage { stage, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_selected_by_first_argument() {
        assert!(is_init_args(["/proc/self/exe", "init"]));
        assert!(!is_init_args(["runf", "--rootfs", "/srv", "init"]));
        assert!(!is_init_args(["runf"]));
    }

    #[test]
    fn thread_count_is_parsed_from_status() {
        let status = "Name:\trunf\nState:\tR (running)\nThreads:\t1\nSigQ:\t0/63456\n";
        assert_eq!(thread_count(status), Some(1));
        assert_eq!(thread_count("Name:\trunf\n"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_status_reports_threads() {
        let status = std::fs::read_to_string("/proc/self/status").unwrap();
        assert!(thread_count(&status).unwrap() >= 1);
    }
}
