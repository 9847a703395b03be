//! Secure root filesystem switching via `pivot_root(2)`.
//!
//! More secure than `chroot` because it actually changes the root mount
//! point rather than just the process's view of `/`.

use std::path::Path;

use runf_common::error::Result;

/// Turns `rootfs` into a mount point by binding it onto itself.
///
/// `pivot_root(2)` refuses a new root that is not a mount point.
///
/// # Errors
///
/// Returns an error if the bind mount fails.
#[cfg(target_os = "linux")]
pub fn prepare_new_root(rootfs: &Path) -> Result<()> {
    super::mount::bind_mount(rootfs, rootfs, true)
}

/// Switches the root filesystem to `new_root` and detaches the old one.
///
/// Uses the `pivot_root(".", ".")` form: the old root ends up stacked on
/// the new one and is lazily unmounted, so no `put_old` directory is needed.
///
/// # Errors
///
/// Returns an error if any of the `chdir(2)`, `pivot_root(2)`, `mount(2)` or
/// `umount2(2)` calls fails.
#[cfg(target_os = "linux")]
pub fn pivot_root(new_root: &Path) -> Result<()> {
    use nix::mount::{MntFlags, MsFlags, mount, umount2};
    use nix::unistd::chdir;
    use runf_common::error::RunfError;

    tracing::debug!(new_root = %new_root.display(), "performing pivot_root");

    chdir(new_root).map_err(|e| RunfError::syscall(format!("chdir {}", new_root.display()), e))?;
    nix::unistd::pivot_root(".", ".").map_err(|e| RunfError::syscall("pivot_root", e))?;
    // unmounting the old root must not propagate to the host
    mount(None::<&str>, ".", None::<&str>, MsFlags::MS_SLAVE | MsFlags::MS_REC, None::<&str>)
        .map_err(|e| RunfError::syscall("make old root slave", e))?;
    umount2(".", MntFlags::MNT_DETACH).map_err(|e| RunfError::syscall("detach old root", e))?;
    chdir("/").map_err(|e| RunfError::syscall("chdir /", e))?;
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: `pivot_root(2)` requires Linux.
#[cfg(not(target_os = "linux"))]
pub fn pivot_root(_new_root: &Path) -> Result<()> {
    Err(runf_common::error::RunfError::Unsupported {
        message: "Linux required for native container operations".into(),
    })
}
