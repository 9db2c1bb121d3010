use async_trait::async_trait;
use bytes::Bytes;
use gridfs_fuse::cadapter::client::{ObjectBackend, ObjectClient};
use gridfs_fuse::cadapter::localfs::LocalFsBackend;
use gridfs_fuse::chuck::{
    ChunkLayout, ChunkStore, DEFAULT_CHUNK_SIZE, FileId, FileRecord, InMemoryChunkStore,
    ObjectChunkStore, StoreError, StoreResult,
};
use gridfs_fuse::vfs::{FileAttr, OpenFlags, VFS, VfsConfig, VfsError, VfsResult};
use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

fn config() -> VfsConfig {
    VfsConfig::new(ChunkLayout::new(4)).refresh_on_readdir(false)
}

async fn mem_vfs() -> VFS<InMemoryChunkStore> {
    VFS::new(config(), InMemoryChunkStore::new()).await.unwrap()
}

async fn put(fs: &VFS<impl ChunkStore>, name: &str, data: &[u8]) {
    let fh = fs.open(name, OpenFlags::write().truncate()).await.unwrap();
    fs.write(fh, 0, data).await.unwrap();
    fs.release(fh).await.unwrap();
}

async fn slurp(fs: &VFS<impl ChunkStore>, name: &str) -> Vec<u8> {
    let fh = fs.open(name, OpenFlags::read_only()).await.unwrap();
    let data = fs.read(fh, 0, usize::MAX / 2).await.unwrap();
    fs.release(fh).await.unwrap();
    data.to_vec()
}

#[tokio::test]
async fn test_write_flush_then_stat_and_read() {
    let fs = mem_vfs().await;
    let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
    put(&fs, "data.bin", &payload).await;

    assert_eq!(fs.getattr("data.bin").await.unwrap().size, 1000);
    assert_eq!(slurp(&fs, "data.bin").await, payload);
    let names: Vec<String> = fs.readdir().await.unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["data.bin"]);
}

#[tokio::test]
async fn test_listing_starts_empty_and_tracks_creates() {
    let fs = mem_vfs().await;
    assert!(fs.readdir().await.unwrap().is_empty());
    for name in ["c", "a", "b"] {
        put(&fs, name, name.as_bytes()).await;
    }
    let mut names: Vec<String> = fs.readdir().await.unwrap().into_iter().map(|e| e.name).collect();
    names.sort();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_multi_chunk_file_at_default_chunk_size() {
    let fs = VFS::new(VfsConfig::default(), InMemoryChunkStore::new()).await.unwrap();
    let len = 3 * DEFAULT_CHUNK_SIZE as usize + 100;
    let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    put(&fs, "big", &payload).await;

    assert_eq!(fs.getattr("big").await.unwrap().size, len as u64);
    assert_eq!(slurp(&fs, "big").await, payload);

    // A read straddling a chunk boundary.
    let r = fs.open("big", OpenFlags::read_only()).await.unwrap();
    let at = DEFAULT_CHUNK_SIZE - 10;
    let got = fs.read(r, at, 20).await.unwrap();
    assert_eq!(&got[..], &payload[at as usize..at as usize + 20]);
    fs.release(r).await.unwrap();
}

#[tokio::test]
async fn test_new_file_is_visible_with_size_zero() {
    let fs = mem_vfs().await;
    let w = fs.open("fresh", OpenFlags::write()).await.unwrap();
    assert_eq!(fs.getattr("fresh").await.unwrap().size, 0);
    let r = fs.open("fresh", OpenFlags::read_only()).await.unwrap();
    assert!(fs.read(r, 0, 16).await.unwrap().is_empty());
    fs.release(r).await.unwrap();
    fs.release(w).await.unwrap();
}

#[tokio::test]
async fn test_single_writer_per_file() {
    let fs = mem_vfs().await;
    let w1 = fs.open("f", OpenFlags::write()).await.unwrap();
    assert!(matches!(
        fs.open("f", OpenFlags::write()).await,
        Err(VfsError::Busy { name }) if name == "f"
    ));
    // Readers are never refused.
    let r = fs.open("f", OpenFlags::read_only()).await.unwrap();
    fs.release(w1).await.unwrap();

    let w2 = fs.open("f", OpenFlags::write()).await.unwrap();
    fs.release(w2).await.unwrap();
    fs.release(r).await.unwrap();
}

#[tokio::test]
async fn test_open_reader_sees_flushed_appends() {
    let fs = mem_vfs().await;
    let w = fs.open("log", OpenFlags::write()).await.unwrap();
    let r = fs.open("log", OpenFlags::read_only()).await.unwrap();

    fs.write_next(w, b"first ").await.unwrap();
    // Not flushed: invisible.
    assert!(fs.read_next(r, 64).await.unwrap().is_empty());

    fs.flush(w).await.unwrap();
    assert_eq!(&fs.read_next(r, 64).await.unwrap()[..], b"first ");

    fs.write_next(w, b"second").await.unwrap();
    fs.flush(w).await.unwrap();
    assert_eq!(&fs.read_next(r, 64).await.unwrap()[..], b"second");
    assert!(fs.read_next(r, 64).await.unwrap().is_empty());

    fs.release(w).await.unwrap();
    fs.release(r).await.unwrap();
}

#[tokio::test]
async fn test_reads_at_and_past_end() {
    let fs = mem_vfs().await;
    put(&fs, "f", b"0123456789").await;
    let r = fs.open("f", OpenFlags::read_only()).await.unwrap();

    assert_eq!(&fs.read(r, 7, 100).await.unwrap()[..], b"789");
    assert!(fs.read(r, 10, 100).await.unwrap().is_empty());
    assert!(fs.read(r, 1_000, 100).await.unwrap().is_empty());
    assert!(fs.read(r, 0, 0).await.unwrap().is_empty());

    assert_eq!(fs.seek(r, SeekFrom::End(-2)).await.unwrap(), 8);
    assert_eq!(&fs.read_next(r, 100).await.unwrap()[..], b"89");
    assert!(matches!(fs.seek(r, SeekFrom::End(-11)).await, Err(VfsError::InvalidInput(_))));
    fs.release(r).await.unwrap();
}

#[tokio::test]
async fn test_sparse_write_zero_fills() {
    let fs = mem_vfs().await;
    let w = fs.open("sparse", OpenFlags::write()).await.unwrap();
    fs.write(w, 0, b"ab").await.unwrap();
    fs.seek(w, SeekFrom::Start(10)).await.unwrap();
    fs.write_next(w, b"z").await.unwrap();
    fs.release(w).await.unwrap();

    assert_eq!(slurp(&fs, "sparse").await, b"ab\0\0\0\0\0\0\0\0z");
}

#[tokio::test]
async fn test_overwrite_in_the_middle_keeps_neighbours() {
    let fs = mem_vfs().await;
    put(&fs, "f", b"aaaabbbbcccc").await;
    let w = fs.open("f", OpenFlags::write()).await.unwrap();
    fs.write(w, 3, b"XYZ").await.unwrap();
    fs.release(w).await.unwrap();
    assert_eq!(slurp(&fs, "f").await, b"aaaXYZbbcccc");
    assert_eq!(fs.getattr("f").await.unwrap().size, 12);
}

#[tokio::test]
async fn test_write_on_read_handle_is_refused() {
    let fs = mem_vfs().await;
    put(&fs, "f", b"abc").await;
    let r = fs.open("f", OpenFlags::read_only()).await.unwrap();
    assert!(matches!(fs.write(r, 0, b"x").await, Err(VfsError::NotWriteOwner)));
    fs.release(r).await.unwrap();
    assert!(matches!(fs.read(r, 0, 1).await, Err(VfsError::BadHandle(_))));
    assert!(matches!(fs.release(r).await, Err(VfsError::BadHandle(_))));
}

#[tokio::test]
async fn test_missing_file_for_read_is_not_found() {
    let fs = mem_vfs().await;
    assert!(matches!(
        fs.open("nope", OpenFlags::read_only()).await,
        Err(VfsError::NotFound { .. })
    ));
    assert!(matches!(fs.getattr("nope").await, Err(VfsError::NotFound { .. })));
    assert!(matches!(fs.unlink("nope").await, Err(VfsError::NotFound { .. })));
    assert!(matches!(fs.rename("nope", "x").await, Err(VfsError::NotFound { .. })));
}

#[tokio::test]
async fn test_unlink_while_open_defers_chunk_removal() {
    let store = Arc::new(InMemoryChunkStore::new());
    let fs = VFS::with_store(config(), Arc::clone(&store)).await.unwrap();
    put(&fs, "victim", b"0123456789").await;
    let attr = fs.getattr("victim").await.unwrap();
    let r = fs.open("victim", OpenFlags::read_only()).await.unwrap();
    let id = first_id(&*store).await;

    fs.unlink("victim").await.unwrap();
    assert!(matches!(fs.getattr("victim").await, Err(VfsError::NotFound { .. })));
    assert!(fs.readdir().await.unwrap().is_empty());
    assert!(fs.name_of(attr.ino).await.is_none());
    assert!(matches!(
        fs.open("victim", OpenFlags::read_only()).await,
        Err(VfsError::NotFound { .. })
    ));

    // The open handle still reads the whole file.
    assert_eq!(&fs.read(r, 0, 64).await.unwrap()[..], b"0123456789");
    assert_eq!(store.stored_chunks(&id).await, 3);

    fs.release(r).await.unwrap();
    assert_eq!(store.stored_chunks(&id).await, 0);

    // The name is free again.
    put(&fs, "victim", b"new").await;
    assert_eq!(slurp(&fs, "victim").await, b"new");
}

#[tokio::test]
async fn test_unlink_closed_file_drops_chunks_at_once() {
    let store = Arc::new(InMemoryChunkStore::new());
    let fs = VFS::with_store(config(), Arc::clone(&store)).await.unwrap();
    put(&fs, "f", b"0123456789").await;
    let id = first_id(&*store).await;

    fs.unlink("f").await.unwrap();
    assert_eq!(store.stored_chunks(&id).await, 0);
    assert!(store.list_files().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rename_replaces_destination() {
    let store = Arc::new(InMemoryChunkStore::new());
    let fs = VFS::with_store(config(), Arc::clone(&store)).await.unwrap();
    put(&fs, "old", b"source").await;
    put(&fs, "new", b"destination").await;
    let dst_id = id_of(&*store, "new").await;

    fs.rename("old", "new").await.unwrap();
    assert!(matches!(fs.getattr("old").await, Err(VfsError::NotFound { .. })));
    assert_eq!(slurp(&fs, "new").await, b"source");
    assert_eq!(store.stored_chunks(&dst_id).await, 0);

    let files = store.list_files().await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "new");
}

#[tokio::test]
async fn test_rename_keeps_open_writer() {
    let fs = mem_vfs().await;
    let w = fs.open("draft", OpenFlags::write()).await.unwrap();
    fs.write(w, 0, b"text").await.unwrap();
    fs.rename("draft", "final").await.unwrap();
    fs.release(w).await.unwrap();

    assert_eq!(slurp(&fs, "final").await, b"text");
    // The token followed the file, so the new name is free to write.
    let w2 = fs.open("final", OpenFlags::write()).await.unwrap();
    fs.release(w2).await.unwrap();
}

#[tokio::test]
async fn test_truncate_by_name() {
    let fs = mem_vfs().await;
    put(&fs, "f", b"0123456789").await;
    let r = fs.open("f", OpenFlags::read_only()).await.unwrap();

    fs.truncate("f", 5, None).await.unwrap();
    assert_eq!(fs.getattr("f").await.unwrap().size, 5);
    assert_eq!(&fs.read(r, 0, 64).await.unwrap()[..], b"01234");

    fs.truncate("f", 8, None).await.unwrap();
    assert_eq!(&fs.read(r, 0, 64).await.unwrap()[..], b"01234\0\0\0");
    fs.release(r).await.unwrap();

    let w = fs.open("f", OpenFlags::write()).await.unwrap();
    assert!(matches!(fs.truncate("f", 0, None).await, Err(VfsError::Busy { .. })));
    // Through the owner's handle it is buffered until close.
    fs.truncate("f", 0, Some(w)).await.unwrap();
    assert_eq!(fs.getattr("f").await.unwrap().size, 8);
    fs.release(w).await.unwrap();
    assert_eq!(fs.getattr("f").await.unwrap().size, 0);
}

#[tokio::test]
async fn test_open_with_truncate_starts_empty() {
    let fs = mem_vfs().await;
    put(&fs, "f", b"0123456789").await;
    put(&fs, "f", b"ab").await;
    assert_eq!(slurp(&fs, "f").await, b"ab");
}

#[tokio::test]
async fn test_store_failure_surfaces_and_frees_token() {
    let store = Arc::new(InMemoryChunkStore::new());
    let fs = VFS::with_store(config(), Arc::clone(&store)).await.unwrap();
    put(&fs, "f", b"keep").await;

    let w = fs.open("f", OpenFlags::write()).await.unwrap();
    fs.write(w, 4, b"lost").await.unwrap();
    store.fail_writes(true);
    assert!(matches!(fs.flush(w).await, Err(VfsError::IoFailure(_))));
    assert!(matches!(fs.release(w).await, Err(VfsError::IoFailure(_))));
    store.fail_writes(false);

    assert_eq!(fs.getattr("f").await.unwrap().size, 4);
    assert_eq!(slurp(&fs, "f").await, b"keep");
    let w2 = fs.open("f", OpenFlags::write()).await.unwrap();
    fs.release(w2).await.unwrap();

    // Creation is refused too and leaves no entry behind.
    store.fail_writes(true);
    assert!(matches!(
        fs.open("other", OpenFlags::write()).await,
        Err(VfsError::IoFailure(_))
    ));
    store.fail_writes(false);
    assert!(matches!(fs.getattr("other").await, Err(VfsError::NotFound { .. })));
}

#[tokio::test]
async fn test_short_chunk_is_corruption() {
    let store = Arc::new(InMemoryChunkStore::new());
    let fs = VFS::with_store(config(), Arc::clone(&store)).await.unwrap();
    put(&fs, "f", b"0123456789").await;
    let id = first_id(&*store).await;
    store.write_chunk(&id, 1, b"45").await.unwrap();

    let r = fs.open("f", OpenFlags::read_only()).await.unwrap();
    assert_eq!(&fs.read(r, 0, 4).await.unwrap()[..], b"0123");
    assert!(matches!(fs.read(r, 0, 10).await, Err(VfsError::Corruption(_))));
    fs.release(r).await.unwrap();
}

#[tokio::test]
async fn test_oversized_chunk_is_corruption() {
    let store = Arc::new(InMemoryChunkStore::new());
    let fs = VFS::with_store(config(), Arc::clone(&store)).await.unwrap();
    put(&fs, "f", b"01234567").await;
    let id = first_id(&*store).await;
    store.write_chunk(&id, 0, b"0123456789").await.unwrap();

    let r = fs.open("f", OpenFlags::read_only()).await.unwrap();
    assert!(matches!(fs.read(r, 0, 2).await, Err(VfsError::Corruption(_))));
    fs.release(r).await.unwrap();
}

/// In-memory store with switchable delays and failures.
#[derive(Default)]
struct ScriptedStore {
    inner: InMemoryChunkStore,
    write_delay: Duration,
    /// Extra latency of `list_files` and `create_file`, in milliseconds.
    namespace_delay_ms: AtomicU64,
    fail_rename: AtomicBool,
    fail_remove: AtomicBool,
}

impl ScriptedStore {
    async fn namespace_lag(&self) {
        let ms = self.namespace_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

fn injected(what: &str) -> StoreError {
    StoreError::Backend(anyhow::anyhow!("injected {what} failure"))
}

#[async_trait]
impl ChunkStore for ScriptedStore {
    async fn create_file(&self, name: &str, chunk_size: u64) -> StoreResult<FileRecord> {
        self.namespace_lag().await;
        self.inner.create_file(name, chunk_size).await
    }

    async fn read_chunk(&self, id: &FileId, index: u64) -> StoreResult<Option<Bytes>> {
        self.inner.read_chunk(id, index).await
    }

    async fn write_chunk(&self, id: &FileId, index: u64, data: &[u8]) -> StoreResult<()> {
        tokio::time::sleep(self.write_delay).await;
        self.inner.write_chunk(id, index, data).await
    }

    async fn delete_chunks(&self, id: &FileId, from_index: u64) -> StoreResult<()> {
        self.inner.delete_chunks(id, from_index).await
    }

    async fn commit_length(&self, id: &FileId, length: u64, mtime: SystemTime) -> StoreResult<()> {
        self.inner.commit_length(id, length, mtime).await
    }

    async fn list_files(&self) -> StoreResult<Vec<FileRecord>> {
        self.namespace_lag().await;
        self.inner.list_files().await
    }

    async fn rename_file(&self, id: &FileId, new_name: &str) -> StoreResult<()> {
        if self.fail_rename.load(Ordering::SeqCst) {
            return Err(injected("rename"));
        }
        self.inner.rename_file(id, new_name).await
    }

    async fn remove_file(&self, id: &FileId) -> StoreResult<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(injected("remove"));
        }
        self.inner.remove_file(id).await
    }
}

#[tokio::test]
async fn test_store_deadline_is_an_io_failure() {
    let store = ScriptedStore {
        write_delay: Duration::from_secs(5),
        ..Default::default()
    };
    let fs = VFS::new(config().io_timeout(Duration::from_millis(50)), store)
        .await
        .unwrap();
    let w = fs.open("slow", OpenFlags::write()).await.unwrap();
    fs.write(w, 0, b"abc").await.unwrap();
    assert!(matches!(fs.flush(w).await, Err(VfsError::IoFailure(_))));
    assert_eq!(fs.getattr("slow").await.unwrap().size, 0);
}

async fn stored_names(store: &InMemoryChunkStore) -> Vec<String> {
    let mut names: Vec<String> = store
        .list_files()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.name)
        .collect();
    names.sort();
    names
}

async fn listed(fs: &VFS<impl ChunkStore>) -> Vec<String> {
    let mut names: Vec<String> = fs.readdir().await.unwrap().into_iter().map(|e| e.name).collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_failed_rename_keeps_both_files() {
    let store = Arc::new(ScriptedStore::default());
    let fs = VFS::with_store(config(), Arc::clone(&store)).await.unwrap();
    put(&fs, "a", b"AAAA").await;
    put(&fs, "b", b"BBBB").await;

    store.fail_rename.store(true, Ordering::SeqCst);
    assert!(matches!(fs.rename("a", "b").await, Err(VfsError::IoFailure(_))));
    store.fail_rename.store(false, Ordering::SeqCst);

    assert_eq!(listed(&fs).await, vec!["a", "b"]);
    assert_eq!(stored_names(&store.inner).await, vec!["a", "b"]);
    assert_eq!(slurp(&fs, "a").await, b"AAAA");
    assert_eq!(slurp(&fs, "b").await, b"BBBB");
}

#[tokio::test]
async fn test_rename_is_undone_when_the_destination_cannot_be_removed() {
    let store = Arc::new(ScriptedStore::default());
    let fs = VFS::with_store(config(), Arc::clone(&store)).await.unwrap();
    put(&fs, "a", b"AAAA").await;
    put(&fs, "b", b"BBBB").await;
    let a_id = id_of(&store.inner, "a").await;

    store.fail_remove.store(true, Ordering::SeqCst);
    assert!(matches!(fs.rename("a", "b").await, Err(VfsError::IoFailure(_))));
    store.fail_remove.store(false, Ordering::SeqCst);

    assert_eq!(stored_names(&store.inner).await, vec!["a", "b"]);
    assert_eq!(id_of(&store.inner, "a").await, a_id);
    assert_eq!(listed(&fs).await, vec!["a", "b"]);
    assert_eq!(slurp(&fs, "a").await, b"AAAA");
    assert_eq!(slurp(&fs, "b").await, b"BBBB");

    // Nothing is left half done: the retry goes through.
    fs.rename("a", "b").await.unwrap();
    assert_eq!(listed(&fs).await, vec!["b"]);
    assert_eq!(slurp(&fs, "b").await, b"AAAA");
}

async fn getattr_within(
    fs: &VFS<impl ChunkStore>,
    name: &str,
) -> Result<VfsResult<FileAttr>, tokio::time::error::Elapsed> {
    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::time::timeout(Duration::from_millis(300), fs.getattr(name)).await
}

#[tokio::test]
async fn test_slow_listing_or_create_does_not_stall_lookups() {
    let store = Arc::new(ScriptedStore::default());
    let fs = VFS::with_store(config(), Arc::clone(&store)).await.unwrap();
    put(&fs, "other", b"data").await;
    store.namespace_delay_ms.store(1000, Ordering::SeqCst);

    let (refreshed, attr) = tokio::join!(fs.refresh(), getattr_within(&fs, "other"));
    refreshed.unwrap();
    assert_eq!(attr.expect("lookup waited for the listing").unwrap().size, 4);

    let (created, attr) = tokio::join!(
        fs.open("new", OpenFlags::write()),
        getattr_within(&fs, "other")
    );
    fs.release(created.unwrap()).await.unwrap();
    assert_eq!(attr.expect("lookup waited for the create").unwrap().size, 4);
    assert_eq!(listed(&fs).await, vec!["new", "other"]);
}

/// One writer appends and flushes in small pieces while four readers keep
/// reading from the start; every read must be a prefix of the final file.
async fn readers_see_a_prefix<S: ChunkStore + 'static>(fs: Arc<VFS<S>>) {
    let w = fs.open("stream", OpenFlags::write()).await.unwrap();
    let expected: Vec<u8> = (0..200u8).collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let fs = Arc::clone(&fs);
            let expected = expected.clone();
            tokio::spawn(async move {
                let r = fs.open("stream", OpenFlags::read_only()).await.unwrap();
                for _ in 0..50 {
                    let seen = fs.read(r, 0, 1024).await.unwrap();
                    assert_eq!(&seen[..], &expected[..seen.len()]);
                    tokio::task::yield_now().await;
                }
                fs.release(r).await.unwrap();
            })
        })
        .collect();

    for piece in expected.chunks(7) {
        fs.write_next(w, piece).await.unwrap();
        fs.flush(w).await.unwrap();
        tokio::task::yield_now().await;
    }
    fs.release(w).await.unwrap();
    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(slurp(fs.as_ref(), "stream").await, expected);
}

#[tokio::test]
async fn test_concurrent_readers_see_a_prefix() {
    readers_see_a_prefix(Arc::new(mem_vfs().await)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_see_a_prefix_on_local_dir() {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectChunkStore::new(ObjectClient::new(LocalFsBackend::new(dir.path())), "stream");
    let config = VfsConfig::new(ChunkLayout::new(64)).refresh_on_readdir(false);
    readers_see_a_prefix(Arc::new(VFS::new(config, store).await.unwrap())).await;
}

#[tokio::test]
async fn test_files_persist_across_mounts() {
    let dir = tempfile::tempdir().unwrap();
    let open_store = || ObjectChunkStore::new(ObjectClient::new(LocalFsBackend::new(dir.path())), "test");

    let payload: Vec<u8> = (0..50u8).collect();
    {
        let fs = VFS::new(config(), open_store()).await.unwrap();
        put(&fs, "kept.bin", &payload).await;
        put(&fs, "dropped.bin", b"x").await;
        fs.unlink("dropped.bin").await.unwrap();
    }

    let fs = VFS::new(config(), open_store()).await.unwrap();
    let names: Vec<String> = fs.readdir().await.unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["kept.bin"]);
    assert_eq!(fs.getattr("kept.bin").await.unwrap().size, 50);
    assert_eq!(slurp(&fs, "kept.bin").await, payload);
}

#[tokio::test]
async fn test_readdir_refresh_sees_other_clients() {
    let dir = tempfile::tempdir().unwrap();
    let open_store = || ObjectChunkStore::new(ObjectClient::new(LocalFsBackend::new(dir.path())), "shared");
    let a = VFS::new(config().refresh_on_readdir(true), open_store()).await.unwrap();
    let b = VFS::new(config(), open_store()).await.unwrap();

    put(&b, "from-b", b"hello").await;
    let names: Vec<String> = a.readdir().await.unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["from-b"]);
    assert_eq!(slurp(&a, "from-b").await, b"hello");

    // Upload dates have millisecond resolution.
    tokio::time::sleep(Duration::from_millis(5)).await;
    other_client_resizes(&a, &b, "from-b").await;
}

#[tokio::test]
async fn test_refresh_adopts_sizes_committed_elsewhere() {
    let store = Arc::new(InMemoryChunkStore::new());
    let a = VFS::with_store(config().refresh_on_readdir(true), Arc::clone(&store))
        .await
        .unwrap();
    let b = VFS::with_store(config(), Arc::clone(&store)).await.unwrap();
    put(&b, "f", b"abc").await;
    assert_eq!(listed(&a).await, vec!["f"]);
    assert_eq!(a.getattr("f").await.unwrap().size, 3);
    other_client_resizes(&a, &b, "f").await;
}

/// `b` grows and then shrinks `name`; `a` must follow after each readdir.
async fn other_client_resizes<S: ChunkStore>(a: &VFS<S>, b: &VFS<S>, name: &str) {
    put(b, name, b"0123456789").await;
    a.readdir().await.unwrap();
    assert_eq!(a.getattr(name).await.unwrap().size, 10);
    assert_eq!(slurp(a, name).await, b"0123456789");

    tokio::time::sleep(Duration::from_millis(5)).await;
    put(b, name, b"xy").await;
    a.readdir().await.unwrap();
    assert_eq!(a.getattr(name).await.unwrap().size, 2);
    assert_eq!(slurp(a, name).await, b"xy");
}

/// Local-dir backend that stalls the next read of a file document once armed,
/// after the document has been fetched.
struct LaggingBackend {
    inner: LocalFsBackend,
    armed: Arc<AtomicBool>,
}

#[async_trait]
impl ObjectBackend for LaggingBackend {
    async fn put_object(&self, key: &str, data: &[u8]) -> anyhow::Result<()> {
        self.inner.put_object(key, data).await
    }

    async fn get_object(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let got = self.inner.get_object(key).await;
        if key.contains("fs.files") && self.armed.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        got
    }

    async fn delete_object(&self, key: &str) -> anyhow::Result<()> {
        self.inner.delete_object(key).await
    }

    async fn list_objects(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        self.inner.list_objects(prefix).await
    }
}

async fn lagging_vfs(
    dir: &std::path::Path,
    armed: &Arc<AtomicBool>,
) -> VFS<ObjectChunkStore<LaggingBackend>> {
    let backend = LaggingBackend {
        inner: LocalFsBackend::new(dir),
        armed: Arc::clone(armed),
    };
    VFS::new(config(), ObjectChunkStore::new(ObjectClient::new(backend), "race"))
        .await
        .unwrap()
}

async fn remount(dir: &std::path::Path) -> VFS<ObjectChunkStore<LocalFsBackend>> {
    let store = ObjectChunkStore::new(ObjectClient::new(LocalFsBackend::new(dir)), "race");
    VFS::new(config(), store).await.unwrap()
}

#[tokio::test]
async fn test_flush_racing_rename_keeps_the_new_name() {
    let dir = tempfile::tempdir().unwrap();
    let armed = Arc::new(AtomicBool::new(false));
    let fs = lagging_vfs(dir.path(), &armed).await;
    put(&fs, "old", b"1234").await;

    let w = fs.open("old", OpenFlags::write()).await.unwrap();
    fs.write(w, 4, b"5678").await.unwrap();
    armed.store(true, Ordering::SeqCst);
    let rename = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        fs.rename("old", "new").await
    };
    let (flushed, renamed) = tokio::join!(fs.flush(w), rename);
    flushed.unwrap();
    renamed.unwrap();
    fs.release(w).await.unwrap();
    drop(fs);

    let fs = remount(dir.path()).await;
    assert_eq!(listed(&fs).await, vec!["new"]);
    assert_eq!(fs.getattr("new").await.unwrap().size, 8);
    assert_eq!(slurp(&fs, "new").await, b"12345678");
}

#[tokio::test]
async fn test_flush_racing_unlink_stays_unlinked() {
    let dir = tempfile::tempdir().unwrap();
    let armed = Arc::new(AtomicBool::new(false));
    let fs = lagging_vfs(dir.path(), &armed).await;
    put(&fs, "gone", b"1234").await;
    put(&fs, "kept", b"k").await;

    let w = fs.open("gone", OpenFlags::write()).await.unwrap();
    fs.write(w, 4, b"5678").await.unwrap();
    armed.store(true, Ordering::SeqCst);
    let unlink = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        fs.unlink("gone").await
    };
    let (flushed, unlinked) = tokio::join!(fs.flush(w), unlink);
    flushed.unwrap();
    unlinked.unwrap();
    fs.release(w).await.unwrap();
    drop(fs);

    let fs = remount(dir.path()).await;
    assert_eq!(listed(&fs).await, vec!["kept"]);
    assert!(matches!(
        fs.open("gone", OpenFlags::read_only()).await,
        Err(VfsError::NotFound { .. })
    ));
}

async fn first_id(store: &InMemoryChunkStore) -> FileId {
    store.list_files().await.unwrap().remove(0).id
}

async fn id_of(store: &InMemoryChunkStore, name: &str) -> FileId {
    store
        .list_files()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.name == name)
        .map(|r| r.id)
        .unwrap()
}
