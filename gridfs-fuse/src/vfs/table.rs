//! Registry of open files and their handles.
//!
//! Each open file carries a handle count and at most one write token. The
//! token is keyed by file id rather than name, so it follows the file across
//! renames and a replaced name can be written by a new owner immediately.

use super::error::{VfsError, VfsResult};
use super::handles::{FileHandle, HandleId, OpenMode};
use super::index::FileNode;
use crate::chuck::FileId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

pub type SharedHandle = Arc<Mutex<FileHandle>>;

#[derive(Debug, Default)]
struct OpenFile {
    handles: usize,
    writer: Option<HandleId>,
}

#[derive(Default)]
struct TableInner {
    files: HashMap<FileId, OpenFile>,
    handles: HashMap<HandleId, SharedHandle>,
}

pub struct FileTable {
    inner: Mutex<TableInner>,
    next_fh: AtomicU64,
    io_timeout: Duration,
}

impl FileTable {
    pub fn new(io_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(TableInner::default()),
            // 0 is never handed out.
            next_fh: AtomicU64::new(1),
            io_timeout,
        }
    }

    fn alloc_fh(&self) -> HandleId {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn open_for_read(&self, node: Arc<FileNode>) -> (HandleId, SharedHandle) {
        let fh = self.alloc_fh();
        let handle = Arc::new(Mutex::new(FileHandle::new(
            fh,
            Arc::clone(&node),
            OpenMode::Read,
            0,
            self.io_timeout,
        )));
        let mut inner = self.inner.lock().await;
        inner.files.entry(node.id().clone()).or_default().handles += 1;
        inner.handles.insert(fh, Arc::clone(&handle));
        debug!(fh, file = %node.id(), "opened for read");
        (fh, handle)
    }

    /// Grant the write token for `node`, or fail with `Busy` naming `name`.
    pub async fn open_for_write(
        &self,
        node: Arc<FileNode>,
        name: &str,
    ) -> VfsResult<(HandleId, SharedHandle)> {
        let mut inner = self.inner.lock().await;
        let open = inner.files.entry(node.id().clone()).or_default();
        if let Some(owner) = open.writer {
            debug!(file = %node.id(), owner, "write token already taken");
            return Err(VfsError::busy(name));
        }
        let fh = self.alloc_fh();
        open.writer = Some(fh);
        open.handles += 1;

        // The previous owner flushed before giving the token back, so the
        // size read here is final.
        let committed = node.size().await;
        let handle = Arc::new(Mutex::new(FileHandle::new(
            fh,
            Arc::clone(&node),
            OpenMode::Write,
            committed,
            self.io_timeout,
        )));
        inner.handles.insert(fh, Arc::clone(&handle));
        debug!(fh, file = %node.id(), size = committed, "opened for write");
        Ok((fh, handle))
    }

    pub async fn get(&self, fh: HandleId) -> VfsResult<SharedHandle> {
        self.inner
            .lock()
            .await
            .handles
            .get(&fh)
            .cloned()
            .ok_or(VfsError::BadHandle(fh))
    }

    /// Detach a handle so no new operation can reach it. The file stays
    /// open (and the write token held) until [`FileTable::close`].
    pub async fn take(&self, fh: HandleId) -> VfsResult<SharedHandle> {
        self.inner
            .lock()
            .await
            .handles
            .remove(&fh)
            .ok_or(VfsError::BadHandle(fh))
    }

    /// Drop one handle of `id`, giving back the write token if it held it.
    /// Returns true when that was the last handle on the file.
    pub async fn close(&self, id: &FileId, fh: HandleId) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(open) = inner.files.get_mut(id) else {
            return true;
        };
        if open.writer == Some(fh) {
            open.writer = None;
        }
        open.handles = open.handles.saturating_sub(1);
        if open.handles == 0 {
            inner.files.remove(id);
            return true;
        }
        false
    }

    pub async fn is_open(&self, id: &FileId) -> bool {
        self.inner.lock().await.files.contains_key(id)
    }

    pub async fn writer_of(&self, id: &FileId) -> Option<HandleId> {
        self.inner.lock().await.files.get(id).and_then(|f| f.writer)
    }

    pub async fn open_files(&self) -> HashSet<FileId> {
        self.inner.lock().await.files.keys().cloned().collect()
    }

    /// Files whose write token is currently held.
    pub async fn written_files(&self) -> HashSet<FileId> {
        self.inner
            .lock()
            .await
            .files
            .iter()
            .filter(|(_, open)| open.writer.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }
}
