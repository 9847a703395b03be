//! Mount utilities for container filesystem setup.
//!
//! Describes the container's mount list and performs the mounts, bind
//! mounts, masking, and read-only remounts inside the container's mount
//! namespace.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use runf_common::error::{Result, RunfError};
use serde::{Deserialize, Serialize};

/// A single `mount(2)` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountFlag {
    /// `MS_RDONLY`
    ReadOnly,
    /// `MS_NOSUID`
    NoSuid,
    /// `MS_NODEV`
    NoDev,
    /// `MS_NOEXEC`
    NoExec,
    /// `MS_STRICTATIME`
    StrictAtime,
    /// `MS_RELATIME`
    RelAtime,
    /// `MS_NOATIME`
    NoAtime,
    /// `MS_BIND`
    Bind,
    /// `MS_REC`
    Recursive,
}

/// A set of mount flags.
pub type MountFlags = BTreeSet<MountFlag>;

#[cfg(target_os = "linux")]
impl MountFlag {
    /// The kernel flag bit.
    #[must_use]
    pub const fn ms_flag(self) -> nix::mount::MsFlags {
        use nix::mount::MsFlags;

        match self {
            Self::ReadOnly => MsFlags::MS_RDONLY,
            Self::NoSuid => MsFlags::MS_NOSUID,
            Self::NoDev => MsFlags::MS_NODEV,
            Self::NoExec => MsFlags::MS_NOEXEC,
            Self::StrictAtime => MsFlags::MS_STRICTATIME,
            Self::RelAtime => MsFlags::MS_RELATIME,
            Self::NoAtime => MsFlags::MS_NOATIME,
            Self::Bind => MsFlags::MS_BIND,
            Self::Recursive => MsFlags::MS_REC,
        }
    }
}

/// Combines a flag set into kernel flags.
#[cfg(target_os = "linux")]
#[must_use]
pub fn ms_flags(flags: &MountFlags) -> nix::mount::MsFlags {
    flags
        .iter()
        .fold(nix::mount::MsFlags::empty(), |acc, flag| acc | flag.ms_flag())
}

/// One entry of the container's mount list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount source (device, filesystem label, or host path for binds).
    pub source: String,
    /// Absolute destination inside the container.
    pub destination: PathBuf,
    /// Filesystem type, or `bind`.
    pub device: String,
    /// Mount flags.
    pub flags: MountFlags,
    /// Filesystem-specific options.
    pub data: Option<String>,
}

impl Mount {
    /// Creates a mount without flags or options.
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<PathBuf>,
        device: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            device: device.into(),
            flags: MountFlags::new(),
            data: None,
        }
    }

    /// Replaces the flag set.
    #[must_use]
    pub fn with_flags(mut self, flags: impl IntoIterator<Item = MountFlag>) -> Self {
        self.flags = flags.into_iter().collect();
        self
    }

    /// Sets filesystem-specific options.
    #[must_use]
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Returns whether this is a bind mount of a host path.
    #[must_use]
    pub fn is_bind(&self) -> bool {
        self.device == "bind" || self.flags.contains(&MountFlag::Bind)
    }
}

/// `NOEXEC | NOSUID | NODEV`, the default combination for pseudo-filesystems.
#[must_use]
pub fn default_mount_flags() -> MountFlags {
    [MountFlag::NoExec, MountFlag::NoSuid, MountFlag::NoDev]
        .into_iter()
        .collect()
}

/// `/proc`, `/dev`, `/dev/pts` and `/dev/shm`, in mount order.
#[must_use]
pub fn default_mounts() -> Vec<Mount> {
    vec![
        Mount::new("proc", "/proc", "proc").with_flags(default_mount_flags()),
        Mount::new("tmpfs", "/dev", "tmpfs")
            .with_flags([MountFlag::NoSuid, MountFlag::StrictAtime])
            .with_data("mode=755"),
        Mount::new("devpts", "/dev/pts", "devpts")
            .with_flags([MountFlag::NoSuid, MountFlag::NoExec])
            .with_data("newinstance,ptmxmode=0666,mode=0620"),
        Mount::new("shm", "/dev/shm", "tmpfs")
            .with_flags(default_mount_flags())
            .with_data("mode=1777,size=65536k"),
    ]
}

/// Parses `/proc/filesystems` into the set of supported filesystem types.
#[must_use]
pub fn parse_filesystems(contents: &str) -> BTreeSet<String> {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .map(str::to_owned)
        .collect()
}

/// Rejects a mount whose filesystem type the kernel does not know.
///
/// # Errors
///
/// Returns [`RunfError::Mount`] for an unsupported device type.
pub fn check_supported(mount: &Mount, supported: &BTreeSet<String>) -> Result<()> {
    if mount.is_bind() || supported.contains(&mount.device) {
        return Ok(());
    }
    Err(RunfError::Mount {
        target: mount.destination.clone(),
        message: format!("unsupported device type {:?}", mount.device),
    })
}

/// Resolves a mount destination to its host path below `rootfs`, following
/// symlinks inside the rootfs the way the container would.
///
/// # Errors
///
/// Returns [`RunfError::Mount`] if the destination cannot be resolved.
pub fn container_path(rootfs: &Path, destination: &Path) -> Result<PathBuf> {
    super::resolve_in_rootfs(rootfs, destination).map_err(|e| RunfError::Mount {
        target: destination.to_path_buf(),
        message: format!("resolve below rootfs: {e}"),
    })
}

#[cfg(target_os = "linux")]
fn mount_error(target: &Path, what: &str, err: nix::errno::Errno) -> RunfError {
    RunfError::Mount {
        target: target.to_path_buf(),
        message: format!("{what}: {err}"),
    }
}

/// Performs one entry of the mount list below `rootfs`.
///
/// # Errors
///
/// Returns [`RunfError::Mount`] if the target cannot be prepared or
/// `mount(2)` fails.
#[cfg(target_os = "linux")]
pub fn mount_into(rootfs: &Path, mount: &Mount) -> Result<()> {
    use nix::mount::MsFlags;

    let target = container_path(rootfs, &mount.destination)?;
    if mount.is_bind() {
        let recursive = mount.flags.contains(&MountFlag::Recursive);
        bind_mount(Path::new(&mount.source), &target, recursive)?;
        if mount.flags.contains(&MountFlag::ReadOnly) {
            remount_readonly(&target)?;
        }
        return Ok(());
    }

    std::fs::create_dir_all(&target).map_err(|e| RunfError::Mount {
        target: mount.destination.clone(),
        message: format!("create mount point: {e}"),
    })?;
    nix::mount::mount(
        Some(mount.source.as_str()),
        &target,
        Some(mount.device.as_str()),
        ms_flags(&mount.flags) - MsFlags::MS_BIND,
        mount.data.as_deref(),
    )
    .map_err(|e| mount_error(&mount.destination, &format!("mount {}", mount.device), e))?;
    tracing::debug!(device = %mount.device, destination = %mount.destination.display(), "mounted");
    Ok(())
}

/// Creates a bind mount from source to target.
///
/// The target is created as a directory or an empty file to match the
/// source.
///
/// # Errors
///
/// Returns an error if the target cannot be created or `mount(2)` fails.
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path, recursive: bool) -> Result<()> {
    use nix::mount::MsFlags;

    let source_is_dir = std::fs::metadata(source)
        .map_err(|e| RunfError::io(source, e))?
        .is_dir();
    if source_is_dir {
        std::fs::create_dir_all(target).map_err(|e| RunfError::io(target, e))?;
    } else if !target.exists() {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RunfError::io(parent, e))?;
        }
        let _ = std::fs::File::create(target).map_err(|e| RunfError::io(target, e))?;
    }

    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    nix::mount::mount(Some(source), target, None::<&str>, flags, None::<&str>)
        .map_err(|e| mount_error(target, &format!("bind {}", source.display()), e))?;
    tracing::debug!(source = %source.display(), target = %target.display(), "bind mounted");
    Ok(())
}

/// Flags the kernel refuses to clear on a remount inside a user namespace.
#[cfg(target_os = "linux")]
fn locked_flags(path: &Path) -> nix::mount::MsFlags {
    use nix::mount::MsFlags;
    use nix::sys::statvfs::{FsFlags, statvfs};

    let Ok(stat) = statvfs(path) else {
        return MsFlags::empty();
    };
    let current = stat.flags();
    [
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
    ]
    .into_iter()
    .filter(|(st, _)| current.contains(*st))
    .fold(MsFlags::empty(), |acc, (_, ms)| acc | ms)
}

/// Remounts an existing mount point read-only, keeping its other flags.
///
/// # Errors
///
/// Returns an error if the remount fails.
#[cfg(target_os = "linux")]
pub fn remount_readonly(path: &Path) -> Result<()> {
    use nix::mount::MsFlags;

    let flags = MsFlags::MS_BIND
        | MsFlags::MS_REMOUNT
        | MsFlags::MS_RDONLY
        | MsFlags::MS_REC
        | locked_flags(path);
    nix::mount::mount(None::<&str>, path, None::<&str>, flags, None::<&str>)
        .map_err(|e| mount_error(path, "remount read-only", e))?;
    tracing::debug!(path = %path.display(), "remounted read-only");
    Ok(())
}

/// Hides a path: directories get an empty read-only tmpfs, files get
/// `/dev/null` bound over them. Missing paths are skipped.
///
/// # Errors
///
/// Returns an error if the masking mount fails.
#[cfg(target_os = "linux")]
pub fn mask_path(path: &Path) -> Result<()> {
    use nix::mount::MsFlags;

    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(RunfError::io(path, e)),
    };
    if metadata.is_dir() {
        nix::mount::mount(Some("tmpfs"), path, Some("tmpfs"), MsFlags::MS_RDONLY, None::<&str>)
            .map_err(|e| mount_error(path, "mask directory", e))?;
    } else {
        nix::mount::mount(Some("/dev/null"), path, None::<&str>, MsFlags::MS_BIND, None::<&str>)
            .map_err(|e| mount_error(path, "mask file", e))?;
    }
    tracing::debug!(path = %path.display(), "path masked");
    Ok(())
}

/// Makes a path read-only by binding it onto itself and remounting.
/// Missing paths are skipped.
///
/// # Errors
///
/// Returns an error if either mount fails.
#[cfg(target_os = "linux")]
pub fn readonly_path(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    bind_mount(path, path, true)?;
    remount_readonly(path)
}

/// Stops mount events from propagating between the container and the host.
///
/// # Errors
///
/// Returns an error if `mount(2)` with `MS_REC | MS_PRIVATE` fails.
#[cfg(target_os = "linux")]
pub fn make_private(path: &Path) -> Result<()> {
    use nix::mount::MsFlags;

    nix::mount::mount(
        None::<&str>,
        path,
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| RunfError::syscall(format!("make {} private", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_FILESYSTEMS: &str =
        "nodev\tsysfs\nnodev\ttmpfs\nnodev\tproc\nnodev\tdevpts\n\text4\n";

    #[test]
    fn default_mounts_cover_proc_and_dev() {
        let mounts = default_mounts();
        let destinations: Vec<_> = mounts.iter().map(|m| m.destination.clone()).collect();
        assert_eq!(
            destinations,
            ["/proc", "/dev", "/dev/pts", "/dev/shm"].map(PathBuf::from)
        );
        assert_eq!(mounts[0].flags, default_mount_flags());
    }

    #[test]
    fn dev_is_only_nosuid() {
        let dev = &default_mounts()[1];
        assert!(dev.flags.contains(&MountFlag::NoSuid));
        assert!(!dev.flags.contains(&MountFlag::NoExec));
        assert!(!dev.flags.contains(&MountFlag::NoDev));
    }

    #[test]
    fn filesystems_are_parsed_with_and_without_nodev() {
        let supported = parse_filesystems(PROC_FILESYSTEMS);
        assert!(supported.contains("proc"));
        assert!(supported.contains("ext4"));
        assert!(!supported.contains("nodev"));
    }

    #[test]
    fn unknown_device_type_is_a_mount_error() {
        let supported = parse_filesystems(PROC_FILESYSTEMS);
        let bogus = Mount::new("none", "/data", "bogusfs");
        let err = check_supported(&bogus, &supported).unwrap_err();
        assert!(matches!(err, RunfError::Mount { .. }));

        let bind = Mount::new("/srv/data", "/data", "bind");
        assert!(check_supported(&bind, &supported).is_ok());
    }

    #[test]
    fn container_path_stays_below_rootfs() {
        let rootfs = tempfile::tempdir().unwrap();
        std::fs::create_dir(rootfs.path().join("dev")).unwrap();

        let path = container_path(rootfs.path(), Path::new("/dev/pts")).unwrap();
        assert_eq!(path, rootfs.path().join("dev/pts"));
    }

    #[test]
    fn symlinked_destination_is_resolved_inside_rootfs() {
        let rootfs = tempfile::tempdir().unwrap();
        std::fs::create_dir(rootfs.path().join("srv")).unwrap();
        std::os::unix::fs::symlink("/etc", rootfs.path().join("srv/data")).unwrap();

        let path = container_path(rootfs.path(), Path::new("/srv/data")).unwrap();
        assert_eq!(path, rootfs.path().join("etc"));
        assert!(!path.starts_with("/etc"));
    }

    #[test]
    fn looping_destination_is_a_mount_error() {
        let rootfs = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/loop", rootfs.path().join("loop")).unwrap();

        let err = container_path(rootfs.path(), Path::new("/loop")).unwrap_err();
        assert!(matches!(err, RunfError::Mount { .. }), "{err}");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn flag_set_maps_to_kernel_bits() {
        use nix::mount::MsFlags;

        let flags = ms_flags(&default_mount_flags());
        assert_eq!(flags, MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV);
    }
}
