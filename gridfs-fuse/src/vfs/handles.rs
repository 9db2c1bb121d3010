//! Per-open file handles.
//!
//! Readers always look at the committed size of the file, re-read on every
//! call, so appends flushed by the write owner show up without reopening.
//! The write owner additionally keeps a chunk buffer: its writes and
//! truncates stay private to the handle until `flush`.

use super::error::{VfsError, VfsResult};
use super::index::FileNode;
use super::store_call;
use crate::chuck::{ChunkLayout, ChunkStore};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, instrument, trace};

pub type HandleId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Unflushed state of the write owner.
#[derive(Debug)]
struct WriteBuffer {
    layout: ChunkLayout,
    /// Length including unflushed writes and truncates.
    len: u64,
    /// Size last committed through this handle, or found at open.
    committed: u64,
    /// Prefix of the file still backed by stored chunks. Bytes past it that
    /// are not buffered read as zero.
    durable: u64,
    /// Upper bound on the number of chunks present in the store.
    stored_chunks: u64,
    /// Buffered chunks, each holding bytes from the chunk start. A chunk
    /// shorter than its final length is zero-padded when flushed.
    dirty: BTreeMap<u64, Vec<u8>>,
}

impl WriteBuffer {
    fn new(layout: ChunkLayout, committed: u64) -> Self {
        Self {
            layout,
            len: committed,
            committed,
            durable: committed,
            stored_chunks: layout.chunk_count(committed),
            dirty: BTreeMap::new(),
        }
    }

    fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
            || self.len != self.committed
            || self.durable < self.len
            || self.stored_chunks > self.layout.chunk_count(self.len)
    }

    /// Make sure chunk `index` is buffered, seeded with its durable prefix.
    async fn load<S: ChunkStore + ?Sized>(
        &mut self,
        store: &S,
        node: &FileNode,
        index: u64,
        io_timeout: Duration,
    ) -> VfsResult<()> {
        if self.dirty.contains_key(&index) {
            return Ok(());
        }
        let valid = self.layout.chunk_len(index, self.durable) as usize;
        let mut data = Vec::with_capacity(valid);
        if valid > 0 {
            let chunk = fetch_chunk(store, node, index, io_timeout)
                .await?
                .ok_or_else(|| corrupt(node, index, "missing"))?;
            if chunk.len() < valid {
                return Err(corrupt(node, index, "shorter than the file size implies"));
            }
            data.extend_from_slice(&chunk[..valid]);
        }
        self.dirty.insert(index, data);
        Ok(())
    }
}

pub struct FileHandle {
    fh: HandleId,
    node: Arc<FileNode>,
    mode: OpenMode,
    cursor: u64,
    io_timeout: Duration,
    /// Present iff this handle holds the write token.
    buffer: Option<WriteBuffer>,
}

impl FileHandle {
    /// `committed` is the size of the file at the moment the handle was
    /// granted; only meaningful for write handles.
    pub(crate) fn new(
        fh: HandleId,
        node: Arc<FileNode>,
        mode: OpenMode,
        committed: u64,
        io_timeout: Duration,
    ) -> Self {
        let buffer = (mode == OpenMode::Write).then(|| WriteBuffer::new(node.layout(), committed));
        Self {
            fh,
            node,
            mode,
            cursor: 0,
            io_timeout,
            buffer,
        }
    }

    pub fn fh(&self) -> HandleId {
        self.fh
    }

    pub fn node(&self) -> &Arc<FileNode> {
        &self.node
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_write_owner(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Length as this handle sees it: the buffered length for the write
    /// owner, the committed size for everyone else.
    pub async fn len(&self) -> u64 {
        match &self.buffer {
            Some(buf) => buf.len,
            None => self.node.size().await,
        }
    }

    /// Positions past the end are allowed; a later write there zero-fills
    /// the gap.
    pub async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(delta) => self.cursor.checked_add_signed(delta),
            SeekFrom::End(delta) => self.len().await.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            VfsError::InvalidInput(format!("seek {pos:?} lands before the start of the file"))
        })?;
        self.cursor = target;
        Ok(target)
    }

    pub async fn read<S: ChunkStore + ?Sized>(&mut self, store: &S, count: usize) -> VfsResult<Bytes> {
        let data = self.read_at(store, self.cursor, count).await?;
        self.cursor += data.len() as u64;
        Ok(data)
    }

    /// Read up to `count` bytes at `offset`. Short only at end of file.
    #[instrument(level = "trace", skip(self, store), fields(fh = self.fh))]
    pub async fn read_at<S: ChunkStore + ?Sized>(
        &self,
        store: &S,
        offset: u64,
        count: usize,
    ) -> VfsResult<Bytes> {
        let size = self.len().await;
        if count == 0 || offset >= size {
            return Ok(Bytes::new());
        }
        let end = size.min(offset.saturating_add(count as u64));
        let layout = self.node.layout();
        let mut out = Vec::with_capacity((end - offset) as usize);

        for span in layout.spans(offset, (end - offset) as usize) {
            let start = span.offset_in_chunk as usize;
            let stop = start + span.len;
            let (chunk_start, _) = layout.chunk_byte_range(span.chunk_index);

            if let Some(buf) = &self.buffer {
                if let Some(chunk) = buf.dirty.get(&span.chunk_index) {
                    copy_padded(&mut out, chunk, start, stop);
                    continue;
                }
                let valid = (layout.chunk_len(span.chunk_index, buf.durable) as usize).min(stop);
                if valid <= start {
                    out.resize(out.len() + span.len, 0);
                    continue;
                }
                let chunk = fetch_chunk(store, &self.node, span.chunk_index, self.io_timeout)
                    .await?
                    .ok_or_else(|| corrupt(&self.node, span.chunk_index, "missing"))?;
                if chunk.len() < valid {
                    return Err(corrupt(&self.node, span.chunk_index, "shorter than the file size implies"));
                }
                copy_padded(&mut out, &chunk[..valid], start, stop);
                continue;
            }

            let chunk = fetch_chunk(store, &self.node, span.chunk_index, self.io_timeout).await?;
            let have = chunk.as_ref().map_or(0, |c| c.len());
            if have >= stop {
                if let Some(c) = &chunk {
                    out.extend_from_slice(&c[start..stop]);
                }
                continue;
            }
            // The owner may have shrunk the file since the size was sampled;
            // only that excuses a short chunk.
            let now = self.node.size().await;
            if now >= chunk_start + stop as u64 {
                return Err(corrupt(&self.node, span.chunk_index, "shorter than the file size implies"));
            }
            debug!(fh = self.fh, size = now, "file shrank during read");
            let limit = (now.saturating_sub(chunk_start) as usize).min(have);
            if let Some(c) = chunk.as_ref().filter(|_| limit > start) {
                out.extend_from_slice(&c[start..limit]);
            }
            out.truncate(now.saturating_sub(offset) as usize);
            break;
        }
        Ok(Bytes::from(out))
    }

    pub async fn write<S: ChunkStore + ?Sized>(&mut self, store: &S, data: &[u8]) -> VfsResult<usize> {
        let n = self.write_at(store, self.cursor, data).await?;
        self.cursor += n as u64;
        Ok(n)
    }

    /// Buffer `data` at `offset`. Nothing reaches the store before `flush`.
    #[instrument(level = "trace", skip(self, store, data), fields(fh = self.fh, len = data.len()))]
    pub async fn write_at<S: ChunkStore + ?Sized>(
        &mut self,
        store: &S,
        offset: u64,
        data: &[u8],
    ) -> VfsResult<usize> {
        let io_timeout = self.io_timeout;
        let node = Arc::clone(&self.node);
        let buf = self.buffer.as_mut().ok_or(VfsError::NotWriteOwner)?;
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| VfsError::InvalidInput(format!("write at {offset} overflows the file size")))?;

        let spans: Vec<_> = buf.layout.spans(offset, data.len()).collect();
        // Load everything first so a failed load leaves the buffer untouched.
        for span in &spans {
            buf.load(store, &node, span.chunk_index, io_timeout).await?;
        }
        let mut consumed = 0usize;
        for span in &spans {
            let start = span.offset_in_chunk as usize;
            let stop = start + span.len;
            if let Some(chunk) = buf.dirty.get_mut(&span.chunk_index) {
                if chunk.len() < stop {
                    chunk.resize(stop, 0);
                }
                chunk[start..stop].copy_from_slice(&data[consumed..consumed + span.len]);
            }
            consumed += span.len;
        }
        buf.len = buf.len.max(end);
        Ok(data.len())
    }

    /// Set the buffered length. Shrinking drops buffered bytes past the new
    /// end; growing exposes zeros.
    pub fn truncate(&mut self, new_len: u64) -> VfsResult<()> {
        let buf = self.buffer.as_mut().ok_or(VfsError::NotWriteOwner)?;
        if new_len < buf.len {
            let keep = buf.layout.chunk_count(new_len);
            buf.dirty.retain(|index, _| *index < keep);
            if let Some(last) = keep.checked_sub(1) {
                let last_len = buf.layout.chunk_len(last, new_len) as usize;
                if let Some(chunk) = buf.dirty.get_mut(&last) {
                    chunk.truncate(last_len);
                }
            }
            buf.durable = buf.durable.min(new_len);
        }
        buf.len = new_len;
        Ok(())
    }

    /// Push buffered state to the store, then publish the new size.
    ///
    /// Chunks are written before the size is committed so readers never see
    /// a size whose chunks are not there yet. When the file shrinks, the last
    /// chunk is first written at its old length (new bytes, then the stored
    /// remainder); it is cut short and surplus chunks deleted only after the
    /// smaller size is committed. Until the commit succeeds the committed
    /// size keeps covering only stored bytes. On failure the buffer is kept
    /// and a later flush retries. Non-owners have nothing to flush.
    #[instrument(level = "debug", skip(self, store), fields(fh = self.fh, file = %self.node.id()))]
    pub async fn flush<S: ChunkStore + ?Sized>(&mut self, store: &S) -> VfsResult<()> {
        let io_timeout = self.io_timeout;
        let node = Arc::clone(&self.node);
        let Some(buf) = self.buffer.as_mut() else {
            return Ok(());
        };
        if !buf.is_dirty() {
            return Ok(());
        }

        let layout = buf.layout;
        let new_len = buf.len;
        let count = layout.chunk_count(new_len);
        let tail = (new_len < buf.committed && layout.within_chunk_offset(new_len) != 0)
            .then(|| count - 1);

        let mut pending: BTreeSet<u64> = buf.dirty.keys().copied().filter(|i| *i < count).collect();
        if buf.durable < new_len {
            pending.extend(layout.chunk_index_of(buf.durable)..count);
        }
        if let Some(index) = tail {
            pending.remove(&index);
            buf.load(store, &node, index, io_timeout).await?;
            pad_chunk(buf, index);
            // Readers still use the old size until the commit, so new bytes
            // in the tail go out with the stored bytes past the new end kept.
            let long = match buf.dirty.get(&index) {
                Some(short) => {
                    let stored = fetch_chunk(store, &node, index, io_timeout)
                        .await?
                        .unwrap_or_default();
                    (!stored.starts_with(short)).then(|| {
                        let mut long = short.clone();
                        if stored.len() > long.len() {
                            long.extend_from_slice(&stored[long.len()..]);
                        }
                        long
                    })
                }
                None => None,
            };
            if let Some(long) = long {
                trace!(index, len = long.len(), "writing tail chunk ahead of shrink");
                store_call(io_timeout, store.write_chunk(node.id(), index, &long)).await?;
                buf.stored_chunks = buf.stored_chunks.max(index + 1);
            }
        }

        for index in pending {
            let buffered = buf.dirty.contains_key(&index);
            buf.load(store, &node, index, io_timeout).await?;
            pad_chunk(buf, index);
            if let Some(data) = buf.dirty.get(&index) {
                trace!(index, len = data.len(), "writing chunk");
                store_call(io_timeout, store.write_chunk(node.id(), index, data)).await?;
            }
            buf.stored_chunks = buf.stored_chunks.max(index + 1);
            if !buffered {
                // Pure zero or reloaded chunk; a retry can rebuild it.
                buf.dirty.remove(&index);
            }
        }

        let mtime = SystemTime::now();
        match store_call(io_timeout, store.commit_length(node.id(), new_len, mtime)).await {
            Ok(()) => {}
            Err(e) if node.is_unlinked().await => {
                debug!(error = %e, "file unlinked, length kept in memory only");
            }
            Err(e) => return Err(e),
        }
        node.commit(new_len, mtime).await;
        buf.committed = new_len;

        if let Some(index) = tail {
            if let Some(data) = buf.dirty.get(&index) {
                store_call(io_timeout, store.write_chunk(node.id(), index, data)).await?;
            }
        }
        buf.dirty.clear();
        buf.durable = new_len;

        if buf.stored_chunks > count {
            store_call(io_timeout, store.delete_chunks(node.id(), count)).await?;
            buf.stored_chunks = count;
        }
        debug!(len = new_len, "flushed");
        Ok(())
    }
}

fn pad_chunk(buf: &mut WriteBuffer, index: u64) {
    let want = buf.layout.chunk_len(index, buf.len) as usize;
    if let Some(chunk) = buf.dirty.get_mut(&index) {
        chunk.resize(want, 0);
    }
}

/// Append `chunk[start..stop]` to `out`, reading bytes past the end of
/// `chunk` as zeros.
fn copy_padded(out: &mut Vec<u8>, chunk: &[u8], start: usize, stop: usize) {
    let have = chunk.len().min(stop);
    if have > start {
        out.extend_from_slice(&chunk[start..have]);
        out.resize(out.len() + (stop - have), 0);
    } else {
        out.resize(out.len() + (stop - start), 0);
    }
}

async fn fetch_chunk<S: ChunkStore + ?Sized>(
    store: &S,
    node: &FileNode,
    index: u64,
    io_timeout: Duration,
) -> VfsResult<Option<Bytes>> {
    let chunk = store_call(io_timeout, store.read_chunk(node.id(), index)).await?;
    if let Some(c) = &chunk {
        if c.len() as u64 > node.layout().chunk_size {
            return Err(corrupt(node, index, "longer than the chunk size"));
        }
    }
    Ok(chunk)
}

fn corrupt(node: &FileNode, index: u64, what: &str) -> VfsError {
    VfsError::Corruption(format!("chunk {index} of file {}: {what}", node.id()))
}
