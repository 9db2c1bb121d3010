//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Unix-like systems. On Linux we support unprivileged mount via fusermount3.
//! - These helpers are thin wrappers over rfuse3 raw Session APIs.
//! - `default_permissions` is deliberately left off: files are reported as
//!   0555 and writes are arbitrated by the write token instead.

use std::path::Path;

use rfuse3::MountOptions;

use crate::chuck::ChunkStore;
use crate::vfs::VFS;

/// Build default mount options for a GridFS-backed mount.
fn default_mount_options(fs_name: &str) -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name(fs_name);
    // Keep defaults conservative: no allow_other, require empty mountpoint.
    mo
}

/// Mount a VFS instance to the given empty directory using unprivileged mode when available.
#[cfg(target_os = "linux")]
pub async fn mount_vfs_unprivileged<S>(
    fs: VFS<S>,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    S: ChunkStore + 'static,
{
    let opts = default_mount_options("gridfs");
    let session = rfuse3::raw::Session::new(opts);
    // Prefer unprivileged mount on Linux (requires fusermount3 in PATH)
    session.mount_with_unprivileged(fs, mount_point).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_vfs_unprivileged<S>(
    _fs: VFS<S>,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle>
where
    S: ChunkStore + 'static,
{
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
