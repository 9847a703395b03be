//! Device nodes and `/dev` symlinks inside the container.
//!
//! Device nodes cannot be created with `mknod(2)` inside a user namespace,
//! so the host nodes are bind-mounted over empty files instead.

use std::path::PathBuf;

/// Host devices exposed in every default container.
pub const DEFAULT_DEVICES: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/full",
    "/dev/random",
    "/dev/urandom",
    "/dev/tty",
];

/// `(link target, link path)` pairs created under the container's `/dev`.
pub const DEV_SYMLINKS: &[(&str, &str)] = &[
    ("/proc/self/fd", "/dev/fd"),
    ("/proc/self/fd/0", "/dev/stdin"),
    ("/proc/self/fd/1", "/dev/stdout"),
    ("/proc/self/fd/2", "/dev/stderr"),
    ("pts/ptmx", "/dev/ptmx"),
];

/// The default device list as owned paths.
#[must_use]
pub fn default_devices() -> Vec<PathBuf> {
    DEFAULT_DEVICES.iter().map(PathBuf::from).collect()
}

/// Bind-mounts each host device to the same path below `rootfs`.
///
/// Devices missing on the host are skipped.
///
/// # Errors
///
/// Returns an error if a bind mount fails.
#[cfg(target_os = "linux")]
pub fn bind_devices(
    rootfs: &std::path::Path,
    devices: &[PathBuf],
) -> runf_common::error::Result<()> {
    use super::mount::{bind_mount, container_path};

    for device in devices {
        if !device.exists() {
            tracing::debug!(device = %device.display(), "host device missing, skipped");
            continue;
        }
        bind_mount(device, &container_path(rootfs, device)?, false)?;
    }
    Ok(())
}

/// Creates the standard `/dev` symlinks below `rootfs`.
///
/// # Errors
///
/// Returns an error if a link cannot be created for a reason other than
/// already existing.
#[cfg(target_os = "linux")]
pub fn create_dev_symlinks(rootfs: &std::path::Path) -> runf_common::error::Result<()> {
    use runf_common::error::RunfError;

    use super::mount::container_path;

    for (target, link) in DEV_SYMLINKS {
        let link = std::path::Path::new(link);
        let (Some(dir), Some(name)) = (link.parent(), link.file_name()) else {
            continue;
        };
        // the link itself is replaced, only its directory is resolved
        let link = container_path(rootfs, dir)?.join(name);
        match std::os::unix::fs::symlink(target, &link) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(RunfError::io(&link, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_devices_live_in_dev() {
        assert!(default_devices().iter().all(|d| d.starts_with("/dev")));
        assert_eq!(default_devices().len(), 6);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn symlinks_are_created_once() {
        let rootfs = tempfile::tempdir().unwrap();
        std::fs::create_dir(rootfs.path().join("dev")).unwrap();

        create_dev_symlinks(rootfs.path()).unwrap();
        create_dev_symlinks(rootfs.path()).unwrap();

        let fd = std::fs::read_link(rootfs.path().join("dev/fd")).unwrap();
        assert_eq!(fd, PathBuf::from("/proc/self/fd"));
        let ptmx = std::fs::read_link(rootfs.path().join("dev/ptmx")).unwrap();
        assert_eq!(ptmx, PathBuf::from("pts/ptmx"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn symlinked_dev_stays_inside_rootfs() {
        let rootfs = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        // `/dev` points at a host directory by its absolute path
        std::os::unix::fs::symlink(outside.path(), rootfs.path().join("dev")).unwrap();
        let shadow = rootfs.path().join(outside.path().strip_prefix("/").unwrap());
        std::fs::create_dir_all(&shadow).unwrap();

        create_dev_symlinks(rootfs.path()).unwrap();

        assert!(shadow.join("fd").symlink_metadata().is_ok());
        assert!(std::fs::read_dir(outside.path()).unwrap().next().is_none());
    }
}
