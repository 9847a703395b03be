//! Filesystem management for container isolation.
//!
//! Provides the mount list, device nodes, `pivot_root` for secure root
//! filesystem switching, and the masking and read-only helpers applied
//! once the new root is in place.

pub mod device;
pub mod mount;
pub mod pivot_root;

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use runf_common::error::{Result, RunfError};

/// Symlinks followed while resolving one path before giving up with `ELOOP`.
pub const MAX_SYMLINK_FOLLOWS: usize = 40;

/// Returns whether `path` is absolute and free of `..` components.
///
/// Mount destinations are joined onto the rootfs, so a `..` could escape it.
#[must_use]
pub fn is_contained_path(path: &Path) -> bool {
    path.is_absolute() && !path.components().any(|c| c == Component::ParentDir)
}

/// Resolves a container-absolute path to a host path below `rootfs`.
///
/// The path is walked one component at a time. Symlinks found inside the
/// rootfs are followed as the container would see them: absolute targets
/// restart at `rootfs` and `..` never climbs above it. Components that do
/// not exist yet are joined as-is.
///
/// # Errors
///
/// Returns an error if a component cannot be inspected, or with `ELOOP`
/// after [`MAX_SYMLINK_FOLLOWS`] symlinks.
pub fn resolve_in_rootfs(rootfs: &Path, path: &Path) -> Result<PathBuf> {
    let mut pending: VecDeque<OsString> = VecDeque::new();
    push_components(&mut pending, path, false);

    let mut resolved = PathBuf::new();
    let mut follows = 0;
    while let Some(part) = pending.pop_front() {
        if part == ".." {
            let _ = resolved.pop();
            continue;
        }
        let candidate = resolved.join(&part);
        let host = rootfs.join(&candidate);
        match std::fs::symlink_metadata(&host) {
            Ok(meta) if meta.file_type().is_symlink() => {
                follows += 1;
                if follows > MAX_SYMLINK_FOLLOWS {
                    return Err(RunfError::io(host, io::Error::from_raw_os_error(libc::ELOOP)));
                }
                let target = std::fs::read_link(&host).map_err(|e| RunfError::io(&host, e))?;
                if target.is_absolute() {
                    resolved.clear();
                }
                push_components(&mut pending, &target, true);
            }
            Ok(_) => resolved = candidate,
            Err(e) if e.kind() == io::ErrorKind::NotFound => resolved = candidate,
            Err(e) => return Err(RunfError::io(host, e)),
        }
    }
    Ok(rootfs.join(resolved))
}

/// Queues the named components of `path`, at the front when `first`.
fn push_components(pending: &mut VecDeque<OsString>, path: &Path, first: bool) {
    let parts: Vec<OsString> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            Component::ParentDir => Some(OsString::from("..")),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
        })
        .collect();
    if first {
        for part in parts.into_iter().rev() {
            pending.push_front(part);
        }
    } else {
        pending.extend(parts);
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    #[test]
    fn contained_paths_are_absolute_without_parent_components() {
        assert!(is_contained_path(Path::new("/dev/shm")));
        assert!(!is_contained_path(Path::new("dev/shm")));
        assert!(!is_contained_path(Path::new("/dev/../../etc")));
    }

    #[test]
    fn plain_paths_join_below_rootfs() {
        let rootfs = tempfile::tempdir().unwrap();
        std::fs::create_dir(rootfs.path().join("dev")).unwrap();

        let path = resolve_in_rootfs(rootfs.path(), Path::new("/dev/pts")).unwrap();
        assert_eq!(path, rootfs.path().join("dev/pts"));
    }

    #[test]
    fn absolute_symlinks_restart_at_rootfs() {
        let rootfs = tempfile::tempdir().unwrap();
        std::fs::create_dir(rootfs.path().join("etc")).unwrap();
        symlink("/etc", rootfs.path().join("data")).unwrap();

        let path = resolve_in_rootfs(rootfs.path(), Path::new("/data/passwd")).unwrap();
        assert_eq!(path, rootfs.path().join("etc/passwd"));
    }

    #[test]
    fn relative_symlinks_cannot_climb_out() {
        let rootfs = tempfile::tempdir().unwrap();
        std::fs::create_dir(rootfs.path().join("var")).unwrap();
        symlink("../../../../tmp", rootfs.path().join("var/run")).unwrap();

        let path = resolve_in_rootfs(rootfs.path(), Path::new("/var/run/app")).unwrap();
        assert_eq!(path, rootfs.path().join("tmp/app"));
    }

    #[test]
    fn parent_components_are_clamped_at_rootfs() {
        let rootfs = tempfile::tempdir().unwrap();
        let path = resolve_in_rootfs(rootfs.path(), Path::new("/../../etc")).unwrap();
        assert_eq!(path, rootfs.path().join("etc"));
    }

    #[test]
    fn symlink_loops_fail() {
        let rootfs = tempfile::tempdir().unwrap();
        symlink("/b", rootfs.path().join("a")).unwrap();
        symlink("/a", rootfs.path().join("b")).unwrap();

        let err = resolve_in_rootfs(rootfs.path(), Path::new("/a/x")).unwrap_err();
        assert!(matches!(err, RunfError::Io { .. }), "{err}");
    }
}
