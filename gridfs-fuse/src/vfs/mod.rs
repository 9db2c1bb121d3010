//! Filesystem core: namespace, write arbitration, file handles and the
//! driver that the FUSE adapter talks to.
//!
//! - `index`: flat name -> file map with inode numbers
//! - `table`: open files, handle registry and the per-file write token
//! - `handles`: cursor, reads and the write owner's chunk buffer
//! - `fs`: the driver tying the above to a [`ChunkStore`](crate::chuck::ChunkStore)

pub mod config;
pub mod error;
pub mod fs;
pub mod handles;
pub mod index;
pub mod table;

pub use config::VfsConfig;
pub use error::{VfsError, VfsResult};
pub use fs::{OpenFlags, VFS};
pub use handles::{FileHandle, HandleId, OpenMode};
pub use index::{DirEntry, FileAttr, FileType, ROOT_INO};

use crate::chuck::StoreResult;
use std::future::Future;
use std::time::Duration;

/// Run one backing-store call under the configured deadline.
pub(crate) async fn store_call<T, F>(limit: Duration, fut: F) -> VfsResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res.map_err(VfsError::from),
        Err(_) => Err(VfsError::timed_out(limit)),
    }
}
