//! System-wide constants and default paths.

/// Default directory holding per-container runtime state.
pub const DEFAULT_WORK_DIR: &str = "/tmp/runf";

/// Name of the state file written inside each container's work directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// Cgroups v2 unified hierarchy mount point.
pub const CGROUP_V2_PATH: &str = "/sys/fs/cgroup";

/// Default cgroup name under which containers are grouped.
pub const DEFAULT_CGROUP_NAME: &str = "runf";

/// Default parent of the runf cgroup.
pub const DEFAULT_CGROUP_PARENT: &str = "system";

/// First argument that switches the binary into the init entry point.
pub const INIT_SENTINEL: &str = "init";

/// Binary used to re-execute the runtime as the container's init process.
pub const DEFAULT_INIT_PATH: &str = "/proc/self/exe";

/// Environment variable carrying the init side of the sync socket.
pub const SYNC_FD_ENV: &str = "_RUNF_SYNC_FD";

/// Directory name (relative to the working directory) of the default rootfs.
pub const DEFAULT_ROOTFS_DIR: &str = "rootfs";

/// `PATH` injected into every contained process.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// `TERM` injected into every contained process.
pub const DEFAULT_TERM: &str = "xterm";

/// Soft and hard `RLIMIT_NOFILE` applied by default.
pub const DEFAULT_NOFILE_LIMIT: u64 = 1024;

/// Application name used in log output and state files.
pub const APP_NAME: &str = "runf";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "runf";
