//! ChunkStore adapter: the interface the filesystem core needs from the
//! backing chunk store, plus an in-memory and an object-backend implementation.

use super::document::{ChunkDocument, FileDocument, FileId, FileRecord, time_to_millis};
use crate::cadapter::client::{ObjectBackend, ObjectClient};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("file {0} not found in store")]
    FileNotFound(FileId),

    #[error("chunk {index} of file {id} does not match its checksum")]
    ChecksumMismatch { id: FileId, index: u64 },

    #[error("backend: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Chunk-level access to the backing store, keyed by file id and chunk index.
///
/// A successful `write_chunk`/`commit_length` is durable. Implementations must
/// tolerate concurrent calls for different file ids.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn create_file(&self, name: &str, chunk_size: u64) -> StoreResult<FileRecord>;

    /// `Ok(None)` when the chunk was never written (or was deleted).
    async fn read_chunk(&self, id: &FileId, index: u64) -> StoreResult<Option<Bytes>>;

    async fn write_chunk(&self, id: &FileId, index: u64, data: &[u8]) -> StoreResult<()>;

    /// Delete every chunk with index `>= from_index`.
    async fn delete_chunks(&self, id: &FileId, from_index: u64) -> StoreResult<()>;

    /// Record the committed length and modification time in the file document.
    async fn commit_length(&self, id: &FileId, length: u64, mtime: SystemTime) -> StoreResult<()>;

    async fn list_files(&self) -> StoreResult<Vec<FileRecord>>;

    async fn rename_file(&self, id: &FileId, new_name: &str) -> StoreResult<()>;

    /// Remove the file document only; chunks are released with `delete_chunks`.
    async fn remove_file(&self, id: &FileId) -> StoreResult<()>;
}

/// Simple in-memory implementation for local development/testing.
pub struct InMemoryChunkStore {
    files: RwLock<HashMap<FileId, FileRecord>>,
    chunks: RwLock<HashMap<(FileId, u64), Bytes>>,
    /// Mutating calls still allowed to succeed; `u64::MAX` means no limit.
    writes_left: AtomicU64,
}

impl Default for InMemoryChunkStore {
    fn default() -> Self {
        Self {
            files: RwLock::default(),
            chunks: RwLock::default(),
            writes_left: AtomicU64::new(u64::MAX),
        }
    }
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent mutating call fail until switched off again.
    pub fn fail_writes(&self, fail: bool) {
        let left = if fail { 0 } else { u64::MAX };
        self.writes_left.store(left, Ordering::SeqCst);
    }

    /// Let `n` more mutating calls through, then fail the rest.
    pub fn fail_writes_after(&self, n: u64) {
        self.writes_left.store(n, Ordering::SeqCst);
    }

    /// Number of chunks currently stored for `id`.
    pub async fn stored_chunks(&self, id: &FileId) -> usize {
        self.chunks.read().await.keys().filter(|(f, _)| f == id).count()
    }

    fn check_writable(&self) -> StoreResult<()> {
        let allowed = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                u64::MAX => Some(u64::MAX),
                n => Some(n - 1),
            });
        match allowed {
            Ok(_) => Ok(()),
            Err(_) => Err(anyhow::anyhow!("injected store failure").into()),
        }
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn create_file(&self, name: &str, chunk_size: u64) -> StoreResult<FileRecord> {
        self.check_writable()?;
        let rec = FileRecord {
            name: name.to_string(),
            id: FileId::generate(),
            length: 0,
            chunk_size,
            mtime: SystemTime::now(),
        };
        self.files.write().await.insert(rec.id.clone(), rec.clone());
        Ok(rec)
    }

    async fn read_chunk(&self, id: &FileId, index: u64) -> StoreResult<Option<Bytes>> {
        Ok(self.chunks.read().await.get(&(id.clone(), index)).cloned())
    }

    async fn write_chunk(&self, id: &FileId, index: u64, data: &[u8]) -> StoreResult<()> {
        self.check_writable()?;
        self.chunks
            .write()
            .await
            .insert((id.clone(), index), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn delete_chunks(&self, id: &FileId, from_index: u64) -> StoreResult<()> {
        self.check_writable()?;
        self.chunks
            .write()
            .await
            .retain(|(f, n), _| f != id || *n < from_index);
        Ok(())
    }

    async fn commit_length(&self, id: &FileId, length: u64, mtime: SystemTime) -> StoreResult<()> {
        self.check_writable()?;
        let mut files = self.files.write().await;
        let rec = files
            .get_mut(id)
            .ok_or_else(|| StoreError::FileNotFound(id.clone()))?;
        rec.length = length;
        rec.mtime = mtime;
        Ok(())
    }

    async fn list_files(&self) -> StoreResult<Vec<FileRecord>> {
        Ok(self.files.read().await.values().cloned().collect())
    }

    async fn rename_file(&self, id: &FileId, new_name: &str) -> StoreResult<()> {
        self.check_writable()?;
        let mut files = self.files.write().await;
        let rec = files
            .get_mut(id)
            .ok_or_else(|| StoreError::FileNotFound(id.clone()))?;
        rec.name = new_name.to_string();
        Ok(())
    }

    async fn remove_file(&self, id: &FileId) -> StoreResult<()> {
        self.check_writable()?;
        self.files.write().await.remove(id);
        Ok(())
    }
}

/// Upper bound (bytes) of chunk payloads kept in the chunk cache.
const CHUNK_CACHE_BYTES: u64 = 64 * 1024 * 1024;

/// ChunkStore over an `ObjectBackend`, laid out like a GridFS database:
///
/// - `{db}/fs.files/{id}.json`: `FileDocument`
/// - `{db}/fs.chunks/{id}/{n}`: `ChunkDocument` header line followed by the
///   chunk payload
///
/// Every object is replaced by a single `put_object`, so a reader sees either
/// the old or the new chunk, never a header from one and bytes from the other.
/// File documents are read-modify-written under a per-file lock.
pub struct ObjectChunkStore<B: ObjectBackend> {
    client: ObjectClient<B>,
    db: String,
    /// Filled by `write_chunk` only. A fill from the read path could land
    /// after a newer write and pin the older bytes.
    chunk_cache: moka::future::Cache<(FileId, u64), Bytes>,
    doc_locks: moka::future::Cache<FileId, Arc<Mutex<()>>>,
}

impl<B: ObjectBackend> ObjectChunkStore<B> {
    pub fn new(client: ObjectClient<B>, db: impl Into<String>) -> Self {
        let chunk_cache = moka::future::Cache::builder()
            .max_capacity(CHUNK_CACHE_BYTES)
            .weigher(|_key: &(FileId, u64), value: &Bytes| {
                value.len().try_into().unwrap_or(u32::MAX)
            })
            .build();
        Self {
            client,
            db: db.into(),
            chunk_cache,
            // Unbounded: an evicted lock could be handed out twice.
            doc_locks: moka::future::Cache::builder().build(),
        }
    }

    fn files_prefix(&self) -> String {
        format!("{}/fs.files", self.db)
    }

    fn file_key(&self, id: &FileId) -> String {
        format!("{}/fs.files/{id}.json", self.db)
    }

    fn chunks_prefix(&self, id: &FileId) -> String {
        format!("{}/fs.chunks/{id}", self.db)
    }

    fn chunk_key(&self, id: &FileId, index: u64) -> String {
        format!("{}/fs.chunks/{id}/{index}", self.db)
    }

    async fn doc_lock(&self, id: &FileId) -> Arc<Mutex<()>> {
        self.doc_locks
            .get_with(id.clone(), async { Arc::new(Mutex::new(())) })
            .await
    }

    async fn load_file_doc(&self, id: &FileId) -> StoreResult<FileDocument> {
        let raw = self
            .client
            .get_object(&self.file_key(id))
            .await?
            .ok_or_else(|| StoreError::FileNotFound(id.clone()))?;
        Ok(serde_json::from_slice(&raw).map_err(anyhow::Error::from)?)
    }

    async fn save_file_doc(&self, doc: &FileDocument) -> StoreResult<()> {
        let raw = serde_json::to_vec(doc).map_err(anyhow::Error::from)?;
        self.client.put_object(&self.file_key(&doc.id), &raw).await?;
        Ok(())
    }

    /// Load, change and save the file document while holding its lock. A
    /// removed document stays removed: `update` never runs for it.
    async fn update_file_doc(
        &self,
        id: &FileId,
        update: impl FnOnce(&mut FileDocument) + Send,
    ) -> StoreResult<()> {
        let lock = self.doc_lock(id).await;
        let _guard = lock.lock().await;
        let mut doc = self.load_file_doc(id).await?;
        update(&mut doc);
        self.save_file_doc(&doc).await
    }
}

#[async_trait]
impl<B: ObjectBackend> ChunkStore for ObjectChunkStore<B> {
    async fn create_file(&self, name: &str, chunk_size: u64) -> StoreResult<FileRecord> {
        let rec = FileRecord {
            name: name.to_string(),
            id: FileId::generate(),
            length: 0,
            chunk_size,
            mtime: SystemTime::now(),
        };
        self.save_file_doc(&FileDocument::from(&rec)).await?;
        Ok(rec)
    }

    async fn read_chunk(&self, id: &FileId, index: u64) -> StoreResult<Option<Bytes>> {
        if let Some(hit) = self.chunk_cache.get(&(id.clone(), index)).await {
            return Ok(Some(hit));
        }
        let Some(raw) = self.client.get_object(&self.chunk_key(id, index)).await? else {
            return Ok(None);
        };
        let mismatch = || StoreError::ChecksumMismatch {
            id: id.clone(),
            index,
        };
        let (doc, payload) = ChunkDocument::decode(&raw).ok_or_else(mismatch)?;
        if doc.files_id != *id || doc.n != index || !doc.matches(payload) {
            return Err(mismatch());
        }
        Ok(Some(Bytes::copy_from_slice(payload)))
    }

    async fn write_chunk(&self, id: &FileId, index: u64, data: &[u8]) -> StoreResult<()> {
        let cache_key = (id.clone(), index);
        self.chunk_cache.invalidate(&cache_key).await;
        let raw = ChunkDocument::for_payload(id.clone(), index, data)
            .encode(data)
            .map_err(anyhow::Error::from)?;
        self.client.put_object(&self.chunk_key(id, index), &raw).await?;
        self.chunk_cache
            .insert(cache_key, Bytes::copy_from_slice(data))
            .await;
        Ok(())
    }

    async fn delete_chunks(&self, id: &FileId, from_index: u64) -> StoreResult<()> {
        let names = self.client.list_objects(&self.chunks_prefix(id)).await?;
        let mut doomed = Vec::new();
        for name in names {
            match name.parse::<u64>() {
                Ok(n) if n >= from_index => {
                    self.chunk_cache.invalidate(&(id.clone(), n)).await;
                    doomed.push(format!("{}/{name}", self.chunks_prefix(id)));
                }
                Ok(_) => {}
                Err(_) => warn!(file = %id, object = %name, "unexpected object in chunk prefix"),
            }
        }
        futures::future::try_join_all(doomed.iter().map(|key| self.client.delete_object(key)))
            .await?;
        Ok(())
    }

    async fn commit_length(&self, id: &FileId, length: u64, mtime: SystemTime) -> StoreResult<()> {
        self.update_file_doc(id, |doc| {
            doc.length = length;
            doc.upload_date = time_to_millis(mtime);
        })
        .await
    }

    async fn list_files(&self) -> StoreResult<Vec<FileRecord>> {
        let names = self.client.list_objects(&self.files_prefix()).await?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            match self.load_file_doc(&FileId::from(id)).await {
                Ok(doc) => out.push(FileRecord::from(doc)),
                // removed between listing and loading
                Err(StoreError::FileNotFound(_)) => {}
                Err(e) => warn!(file = id, error = %e, "skipping unreadable file document"),
            }
        }
        Ok(out)
    }

    async fn rename_file(&self, id: &FileId, new_name: &str) -> StoreResult<()> {
        self.update_file_doc(id, |doc| doc.filename = new_name.to_string())
            .await
    }

    async fn remove_file(&self, id: &FileId) -> StoreResult<()> {
        let lock = self.doc_lock(id).await;
        let _guard = lock.lock().await;
        self.client.delete_object(&self.file_key(id)).await?;
        // Waiters on the old lock find the document gone; later callers get
        // a fresh lock and find the same.
        self.doc_locks.invalidate(id).await;
        Ok(())
    }
}
