//! `runf [OPTIONS] <COMMAND>...`: run one command in a new container.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use nix::sys::signal::Signal;
use runf_common::config::RuntimeConfig;
use runf_common::constants;
use runf_common::names::{NameProvider, RandomNames};
use runf_common::types::ContainerId;
use runf_core::namespace::NamespaceKind;
use runf_core::provider::ExitStatus;
use runf_core::spec::IsolationSpec;
use runf_runtime::{ContainerFactory, DestroyError, Process, ProcessSpec};

/// Arguments for running a container.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Directory holding per-container state.
    #[arg(long, env = "RUNF_WORK_DIR", default_value = constants::DEFAULT_WORK_DIR)]
    pub work_dir: PathBuf,

    /// Mount point of the cgroups v2 hierarchy.
    #[arg(long, env = "RUNF_CGROUP_ROOT", default_value = constants::CGROUP_V2_PATH)]
    pub cgroup_root: PathBuf,

    /// Root filesystem of the container [default: ./rootfs].
    #[arg(long)]
    pub rootfs: Option<PathBuf>,

    /// Container name; a random one is generated when omitted.
    #[arg(long)]
    pub name: Option<String>,

    /// Extra environment entry for the process, as KEY=VALUE.
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// User to run as: a name, a uid, or uid:gid.
    #[arg(short, long, default_value = "root")]
    pub user: String,

    /// Working directory inside the container.
    #[arg(long, default_value = "/")]
    pub cwd: PathBuf,

    /// Kill the container after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Run as real root without a user namespace.
    #[arg(long)]
    pub no_rootless: bool,

    /// Leave the root filesystem writable.
    #[arg(long)]
    pub writable_root: bool,

    /// Command and arguments to run.
    #[arg(required = true, trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

/// Executes the run.
///
/// # Errors
///
/// Returns an error if the container cannot be created, started, or waited
/// for. A failed cleanup after a successful wait is reported but the
/// process's exit status is still returned.
pub fn execute(args: RunArgs) -> anyhow::Result<ExitCode> {
    let id = args
        .name
        .clone()
        .map_or_else(|| RandomNames::default().next_name(), ContainerId::new);
    let spec = build_spec(&args, &id)?;
    let config = RuntimeConfig {
        work_dir: args.work_dir.clone(),
        cgroup_root: args.cgroup_root.clone(),
        ..RuntimeConfig::default()
    };

    let factory = factory(config)?;
    let mut container = factory
        .create(id.clone(), spec)
        .with_context(|| format!("failed to create container {id}"))?;
    let process = container
        .run(process_spec(args.command, &args.env, args.user, args.cwd))
        .with_context(|| format!("failed to start container {id}"))?;

    let watchdog = args
        .timeout
        .map(|secs| Watchdog::start(process.clone(), Duration::from_secs(secs)));
    let status = container
        .wait(process)
        .with_context(|| format!("failed to wait for container {id}"))?;
    if let Some(watchdog) = watchdog {
        watchdog.cancel();
    }

    Ok(ExitCode::from(conclude(&id, status, container.destroy())))
}

/// Picks the exit byte once the process has been waited for. Cleanup
/// failures are reported without replacing the process's status.
fn conclude(id: &ContainerId, status: ExitStatus, cleanup: Result<(), DestroyError>) -> u8 {
    if let Err(e) = cleanup {
        tracing::warn!(id = %id, %status, error = %e, "container cleanup incomplete");
        #[allow(clippy::print_stderr)]
        {
            eprintln!("runf: failed to clean up container {id}: {e}");
        }
    }
    exit_byte(status)
}

fn build_spec(args: &RunArgs, id: &ContainerId) -> anyhow::Result<IsolationSpec> {
    let mut builder = IsolationSpec::for_current_user(id.as_str())
        .context("failed to prepare isolation settings")?;
    if let Some(rootfs) = &args.rootfs {
        let rootfs = std::path::absolute(rootfs)
            .with_context(|| format!("invalid rootfs {}", rootfs.display()))?;
        builder = builder.rootfs(rootfs);
    }
    if args.no_rootless {
        builder = builder
            .rootless(false)
            .remove_namespace(NamespaceKind::User)
            .uid_mappings(Vec::new())
            .gid_mappings(Vec::new());
    }
    if args.writable_root {
        builder = builder.readonly_root(false);
    }
    builder.build().context("invalid isolation settings")
}

fn process_spec(
    command: Vec<String>,
    env: &[(String, String)],
    user: String,
    cwd: PathBuf,
) -> ProcessSpec {
    env.iter()
        .fold(ProcessSpec::new(command), |spec, (key, value)| spec.env(key, value))
        .user(user)
        .cwd(cwd)
}

#[cfg(target_os = "linux")]
#[allow(clippy::unnecessary_wraps)]
fn factory(config: RuntimeConfig) -> anyhow::Result<ContainerFactory> {
    Ok(ContainerFactory::linux(config))
}

#[cfg(not(target_os = "linux"))]
fn factory(_config: RuntimeConfig) -> anyhow::Result<ContainerFactory> {
    Err(runf_common::error::RunfError::Unsupported {
        message: "Linux required for native container operations".into(),
    }
    .into())
}

fn parse_env(entry: &str) -> Result<(String, String), String> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got `{entry}`")),
    }
}

fn exit_byte(status: ExitStatus) -> u8 {
    u8::try_from(status.code()).unwrap_or(u8::MAX)
}

/// Kills the container's process if it outlives a deadline.
struct Watchdog {
    cancel: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl Watchdog {
    fn start(process: Process, timeout: Duration) -> Self {
        let (cancel, cancelled) = mpsc::channel();
        let thread = std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                tracing::warn!(
                    pid = process.pid().as_raw(),
                    timeout_secs = timeout.as_secs(),
                    "deadline reached, killing container"
                );
                if let Err(e) = process.signal(Signal::SIGKILL) {
                    tracing::warn!(error = %e, "failed to kill container process");
                }
            }
        });
        Self { cancel, thread }
    }

    fn cancel(self) {
        drop(self.cancel);
        if self.thread.join().is_err() {
            tracing::warn!("watchdog thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use runf_common::error::RunfError;

    use super::*;

    #[test]
    fn env_entries_split_on_first_equals() {
        assert_eq!(parse_env("A=b=c").unwrap(), ("A".to_owned(), "b=c".to_owned()));
        assert_eq!(parse_env("EMPTY=").unwrap(), ("EMPTY".to_owned(), String::new()));
    }

    #[test]
    fn env_entries_need_a_key_and_equals() {
        assert!(parse_env("NOEQUALS").is_err());
        assert!(parse_env("=value").is_err());
    }

    #[test]
    fn signal_deaths_map_to_128_plus_signal() {
        assert_eq!(exit_byte(ExitStatus::Exited(3)), 3);
        assert_eq!(exit_byte(ExitStatus::Signaled(9)), 137);
        assert_eq!(exit_byte(ExitStatus::Exited(300)), 255);
    }

    #[test]
    fn cleanup_failure_keeps_the_process_status() {
        let id = ContainerId::new("leftover");
        let failed = Err(DestroyError {
            failures: vec![RunfError::io(
                "/sys/fs/cgroup/system/runf/leftover",
                std::io::Error::from(std::io::ErrorKind::DirectoryNotEmpty),
            )],
        });
        assert_eq!(conclude(&id, ExitStatus::Exited(0), failed), 0);
        assert_eq!(conclude(&id, ExitStatus::Exited(3), Ok(())), 3);
    }

    #[test]
    fn process_spec_carries_cli_settings() {
        let spec = process_spec(
            vec!["/bin/env".into()],
            &[("TERM".into(), "dumb".into())],
            "1000:1000".into(),
            PathBuf::from("/tmp"),
        );
        assert_eq!(spec.args, vec!["/bin/env"]);
        assert_eq!(spec.env, vec!["TERM=dumb"]);
        assert_eq!(spec.user, "1000:1000");
        assert_eq!(spec.cwd, PathBuf::from("/tmp"));
    }
}
