//! The filesystem driver: name-based operations over the directory index,
//! the file table and a chunk store. Everything the FUSE adapter does goes
//! through here.
//!
//! Lock order is namespace changes, then the index map, then the file table,
//! then a single handle. Creates, unlinks and renames hold the changes lock
//! across their store calls; the index map lock is never held across one, so
//! lookups and data operations on other files do not wait for the store.

use super::config::VfsConfig;
use super::error::{VfsError, VfsResult};
use super::handles::HandleId;
use super::index::{DirEntry, DirectoryIndex, FILE_MODE, FileAttr, FileNode, FileType, ROOT_INO};
use super::store_call;
use super::table::FileTable;
use crate::chuck::ChunkStore;
use bytes::Bytes;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, instrument, warn};

/// Listings tried before a refresh gives up on a busy namespace.
const REFRESH_ATTEMPTS: usize = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Ask for the write token. A missing file is created.
    pub write: bool,
    /// Start from an empty file; takes effect on the next flush.
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn write() -> Self {
        Self {
            write: true,
            truncate: false,
        }
    }

    pub fn truncate(self) -> Self {
        Self {
            truncate: true,
            ..self
        }
    }

    /// Decode open(2) flags.
    pub fn from_posix(flags: u32) -> Self {
        let flags = flags as i32;
        let access = flags & libc::O_ACCMODE;
        Self {
            write: access == libc::O_WRONLY || access == libc::O_RDWR,
            truncate: flags & libc::O_TRUNC != 0,
        }
    }
}

#[allow(clippy::upper_case_acronyms)]
pub struct VFS<S: ChunkStore> {
    config: VfsConfig,
    store: Arc<S>,
    index: DirectoryIndex,
    table: FileTable,
    mounted_at: SystemTime,
}

impl<S: ChunkStore> VFS<S> {
    /// Build the driver and load the namespace from the store.
    pub async fn new(config: VfsConfig, store: S) -> VfsResult<Self> {
        Self::with_store(config, Arc::new(store)).await
    }

    pub async fn with_store(config: VfsConfig, store: Arc<S>) -> VfsResult<Self> {
        let vfs = Self {
            table: FileTable::new(config.io_timeout),
            config,
            store,
            index: DirectoryIndex::new(),
            mounted_at: SystemTime::now(),
        };
        vfs.refresh().await?;
        info!(files = vfs.file_count().await, "namespace loaded");
        Ok(vfs)
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn file_count(&self) -> usize {
        self.index.lock().await.len()
    }

    /// Pick up files created, renamed, resized or removed by other clients.
    pub async fn refresh(&self) -> VfsResult<()> {
        for _ in 0..REFRESH_ATTEMPTS {
            let generation = self.index.lock().await.generation();
            let records = store_call(self.config.io_timeout, self.store.list_files()).await?;

            let mut ns = self.index.lock().await;
            // A listing older than a local change could undo it.
            if ns.generation() != generation {
                debug!("namespace changed while listing, listing again");
                continue;
            }
            let open = self.table.open_files().await;
            let written = self.table.written_files().await;
            self.index.reconcile(&mut ns, records, &open, &written).await;
            return Ok(());
        }
        debug!("namespace kept changing, keeping cached entries");
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn open(&self, name: &str, flags: OpenFlags) -> VfsResult<HandleId> {
        validate_name(name)?;
        if let Some(fh) = self.open_existing(name, flags).await? {
            return Ok(fh);
        }
        if !flags.write {
            return Err(VfsError::not_found(name));
        }

        let _changes = self.index.changes().await;
        // Another writer may have created it while we waited.
        if let Some(fh) = self.open_existing(name, flags).await? {
            return Ok(fh);
        }
        let record = store_call(
            self.config.io_timeout,
            self.store.create_file(name, self.config.layout.chunk_size),
        )
        .await?;
        info!(name, id = %record.id, "created file");

        let mut ns = self.index.lock().await;
        let node = self.index.insert(&mut ns, &record);
        let (fh, _) = self.table.open_for_write(node, name).await?;
        Ok(fh)
    }

    /// Open `name` if it is listed. The index lock is held until the handle
    /// is registered, so a concurrent unlink either sees the handle or hides
    /// the file first.
    async fn open_existing(&self, name: &str, flags: OpenFlags) -> VfsResult<Option<HandleId>> {
        let ns = self.index.lock().await;
        let Some(node) = ns.lookup(name) else {
            return Ok(None);
        };
        if !flags.write {
            let (fh, _) = self.table.open_for_read(node).await;
            return Ok(Some(fh));
        }
        let (fh, handle) = self.table.open_for_write(node, name).await?;
        drop(ns);
        if flags.truncate {
            handle.lock().await.truncate(0)?;
        }
        Ok(Some(fh))
    }

    /// Read up to `count` bytes at `offset`; the handle cursor is untouched.
    pub async fn read(&self, fh: HandleId, offset: u64, count: usize) -> VfsResult<Bytes> {
        let handle = self.table.get(fh).await?;
        let h = handle.lock().await;
        h.read_at(&*self.store, offset, count).await
    }

    /// Write at `offset`. Buffered until flush unless the driver runs
    /// write-through.
    pub async fn write(&self, fh: HandleId, offset: u64, data: &[u8]) -> VfsResult<usize> {
        let handle = self.table.get(fh).await?;
        let mut h = handle.lock().await;
        let written = h.write_at(&*self.store, offset, data).await?;
        if self.config.write_through {
            h.flush(&*self.store).await?;
        }
        Ok(written)
    }

    /// Read at the handle cursor and advance it.
    pub async fn read_next(&self, fh: HandleId, count: usize) -> VfsResult<Bytes> {
        let handle = self.table.get(fh).await?;
        let mut h = handle.lock().await;
        h.read(&*self.store, count).await
    }

    /// Write at the handle cursor and advance it.
    pub async fn write_next(&self, fh: HandleId, data: &[u8]) -> VfsResult<usize> {
        let handle = self.table.get(fh).await?;
        let mut h = handle.lock().await;
        let written = h.write(&*self.store, data).await?;
        if self.config.write_through {
            h.flush(&*self.store).await?;
        }
        Ok(written)
    }

    pub async fn seek(&self, fh: HandleId, pos: SeekFrom) -> VfsResult<u64> {
        let handle = self.table.get(fh).await?;
        let mut h = handle.lock().await;
        h.seek(pos).await
    }

    pub async fn flush(&self, fh: HandleId) -> VfsResult<()> {
        let handle = self.table.get(fh).await?;
        let mut h = handle.lock().await;
        h.flush(&*self.store).await
    }

    /// Flush and close. The handle is gone and its write token returned
    /// even when the flush fails; the flush error is still reported.
    #[instrument(level = "debug", skip(self))]
    pub async fn release(&self, fh: HandleId) -> VfsResult<()> {
        let handle = self.table.take(fh).await?;
        let mut h = handle.lock().await;
        let flushed = h.flush(&*self.store).await;
        if let Err(e) = &flushed {
            warn!(fh, error = %e, "flush on close failed, unflushed data dropped");
        }
        let node = Arc::clone(h.node());
        drop(h);

        if self.table.close(node.id(), fh).await && node.is_unlinked().await {
            self.reclaim(&node).await;
        }
        flushed
    }

    pub async fn getattr(&self, name: &str) -> VfsResult<FileAttr> {
        let node = self
            .index
            .lookup(name)
            .await
            .ok_or_else(|| VfsError::not_found(name))?;
        Ok(file_attr(&node).await)
    }

    pub async fn getattr_ino(&self, ino: u64) -> VfsResult<FileAttr> {
        if ino == ROOT_INO {
            return Ok(FileAttr::root(self.mounted_at));
        }
        let (_, node) = self
            .index
            .lock()
            .await
            .by_ino(ino)
            .ok_or_else(|| VfsError::not_found(format!("inode {ino}")))?;
        Ok(file_attr(&node).await)
    }

    /// Attributes through an open handle; works for unlinked files too.
    pub async fn getattr_handle(&self, fh: HandleId) -> VfsResult<FileAttr> {
        let handle = self.table.get(fh).await?;
        let node = Arc::clone(handle.lock().await.node());
        Ok(file_attr(&node).await)
    }

    pub async fn name_of(&self, ino: u64) -> Option<String> {
        self.index.lock().await.by_ino(ino).map(|(name, _)| name)
    }

    pub async fn readdir(&self) -> VfsResult<Vec<DirEntry>> {
        if self.config.refresh_on_readdir {
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "refresh failed, listing cached namespace");
            }
        }
        Ok(self.index.list().await)
    }

    /// Remove `name`. Open handles keep working; the chunks are reclaimed
    /// once the last of them is closed.
    #[instrument(level = "debug", skip(self))]
    pub async fn unlink(&self, name: &str) -> VfsResult<()> {
        let _changes = self.index.changes().await;
        let node = self
            .index
            .lookup(name)
            .await
            .ok_or_else(|| VfsError::not_found(name))?;
        store_call(self.config.io_timeout, self.store.remove_file(node.id())).await?;

        let open = {
            let mut ns = self.index.lock().await;
            ns.remove_node(&node);
            node.mark_unlinked().await;
            self.table.is_open(node.id()).await
        };
        info!(name, id = %node.id(), deferred = open, "unlinked file");
        if !open {
            self.reclaim(&node).await;
        }
        Ok(())
    }

    /// Rename `old` to `new`, replacing whatever `new` named. Either both
    /// names end up as requested or, on error, neither changed.
    #[instrument(level = "debug", skip(self))]
    pub async fn rename(&self, old: &str, new: &str) -> VfsResult<()> {
        validate_name(new)?;
        let _changes = self.index.changes().await;
        let (node, victim) = {
            let ns = self.index.lock().await;
            let node = ns.lookup(old).ok_or_else(|| VfsError::not_found(old))?;
            (node, ns.lookup(new))
        };
        if old == new {
            return Ok(());
        }

        store_call(self.config.io_timeout, self.store.rename_file(node.id(), new)).await?;
        if let Some(victim) = &victim {
            if let Err(e) = store_call(self.config.io_timeout, self.store.remove_file(victim.id())).await {
                if let Err(undo) =
                    store_call(self.config.io_timeout, self.store.rename_file(node.id(), old)).await
                {
                    warn!(old, new, error = %undo, "failed to undo rename, both files carry the new name in the store");
                }
                return Err(e);
            }
        }

        let reclaim = {
            let mut ns = self.index.lock().await;
            ns.place(new, Arc::clone(&node));
            match &victim {
                Some(victim) => {
                    ns.remove_node(victim);
                    victim.mark_unlinked().await;
                    !self.table.is_open(victim.id()).await
                }
                None => false,
            }
        };
        if let Some(victim) = victim.filter(|_| reclaim) {
            self.reclaim(&victim).await;
        }
        info!(old, new, id = %node.id(), "renamed file");
        Ok(())
    }

    /// Set the size of `name`. Through `fh` the change is buffered in that
    /// handle like a write; without one it is applied immediately and fails
    /// with `Busy` while another handle owns the file.
    #[instrument(level = "debug", skip(self))]
    pub async fn truncate(&self, name: &str, size: u64, fh: Option<HandleId>) -> VfsResult<()> {
        if let Some(fh) = fh {
            let handle = self.table.get(fh).await?;
            let mut h = handle.lock().await;
            h.truncate(size)?;
            if self.config.write_through {
                h.flush(&*self.store).await?;
            }
            return Ok(());
        }

        let (fh, handle) = {
            let ns = self.index.lock().await;
            let node = ns.lookup(name).ok_or_else(|| VfsError::not_found(name))?;
            self.table.open_for_write(node, name).await?
        };
        let truncated = handle.lock().await.truncate(size);
        let released = self.release(fh).await;
        truncated.and(released)
    }

    async fn reclaim(&self, node: &FileNode) {
        match store_call(self.config.io_timeout, self.store.delete_chunks(node.id(), 0)).await {
            Ok(()) => debug!(id = %node.id(), "reclaimed chunks"),
            // Unreachable garbage; the namespace change already happened.
            Err(e) => warn!(id = %node.id(), error = %e, "failed to reclaim chunks"),
        }
    }
}

async fn file_attr(node: &FileNode) -> FileAttr {
    let state = node.state().await;
    FileAttr {
        ino: node.ino(),
        size: state.size,
        mode: FILE_MODE,
        mtime: state.mtime,
        kind: FileType::File,
    }
}

fn validate_name(name: &str) -> VfsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(VfsError::InvalidInput(format!("invalid file name {name:?}")));
    }
    Ok(())
}
