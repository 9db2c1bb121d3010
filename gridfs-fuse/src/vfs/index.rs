//! In-memory namespace: the flat `name -> FileNode` map, plus inode numbers
//! handed to the kernel.
//!
//! The map lock ([`DirectoryIndex::lock`]) is only held for in-memory work,
//! never across a store call. Creates, unlinks and renames are serialized by
//! [`DirectoryIndex::changes`], which they hold across their store calls.
//! A refresh lists the store with no lock held and only applies the listing
//! if the namespace did not change meanwhile.

use crate::chuck::{ChunkLayout, FileId, FileRecord};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, warn};

/// Inode of the single root directory.
pub const ROOT_INO: u64 = 1;

/// Every file is presented read-only in its permission bits; writability is
/// governed by the single-writer token, not by mode.
pub const FILE_MODE: u32 = 0o555;
pub const DIR_MODE: u32 = 0o755;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub mode: u32,
    pub mtime: SystemTime,
    pub kind: FileType,
}

impl FileAttr {
    pub fn root(mtime: SystemTime) -> Self {
        Self {
            ino: ROOT_INO,
            size: 0,
            mode: DIR_MODE,
            mtime,
            kind: FileType::Dir,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileType,
}

#[derive(Clone, Debug)]
pub struct NodeState {
    pub size: u64,
    pub mtime: SystemTime,
    pub unlinked: bool,
}

/// A stored file as seen by this process. The size here is the committed
/// size: it only moves when a write owner flushes.
#[derive(Debug)]
pub struct FileNode {
    id: FileId,
    ino: u64,
    layout: ChunkLayout,
    state: RwLock<NodeState>,
}

impl FileNode {
    pub(crate) fn from_record(ino: u64, record: &FileRecord) -> Self {
        Self {
            id: record.id.clone(),
            ino,
            layout: ChunkLayout::new(record.chunk_size),
            state: RwLock::new(NodeState {
                size: record.length,
                mtime: record.mtime,
                unlinked: false,
            }),
        }
    }

    pub fn id(&self) -> &FileId {
        &self.id
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    pub async fn size(&self) -> u64 {
        self.state.read().await.size
    }

    pub async fn state(&self) -> NodeState {
        self.state.read().await.clone()
    }

    pub async fn is_unlinked(&self) -> bool {
        self.state.read().await.unlinked
    }

    pub(crate) async fn commit(&self, size: u64, mtime: SystemTime) {
        let mut st = self.state.write().await;
        st.size = size;
        st.mtime = mtime;
    }

    pub(crate) async fn mark_unlinked(&self) {
        self.state.write().await.unlinked = true;
    }

    /// Adopt a size another client committed, if it is newer than what this
    /// process knows. Returns whether anything changed.
    pub(crate) async fn observe(&self, size: u64, mtime: SystemTime) -> bool {
        let mut st = self.state.write().await;
        if st.unlinked || mtime <= st.mtime {
            return false;
        }
        st.size = size;
        st.mtime = mtime;
        true
    }
}

/// Name and inode maps. Only reachable through the index lock.
#[derive(Default)]
pub struct Namespace {
    by_name: HashMap<String, Arc<FileNode>>,
    by_ino: HashMap<u64, (String, Arc<FileNode>)>,
    /// Bumped by every change to the maps.
    generation: u64,
}

impl Namespace {
    pub fn lookup(&self, name: &str) -> Option<Arc<FileNode>> {
        self.by_name.get(name).cloned()
    }

    pub fn by_ino(&self, ino: u64) -> Option<(String, Arc<FileNode>)> {
        self.by_ino.get(&ino).cloned()
    }

    pub fn find(&self, id: &FileId) -> Option<Arc<FileNode>> {
        self.by_ino
            .values()
            .find(|(_, node)| node.id == *id)
            .map(|(_, node)| Arc::clone(node))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Entries sorted by name so readdir offsets stay stable between calls.
    pub fn list(&self) -> Vec<DirEntry> {
        let mut out: Vec<DirEntry> = self
            .by_name
            .iter()
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                ino: node.ino,
                kind: FileType::File,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn insert_node(&mut self, name: &str, node: Arc<FileNode>) {
        self.generation += 1;
        self.by_ino
            .insert(node.ino, (name.to_string(), Arc::clone(&node)));
        self.by_name.insert(name.to_string(), node);
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<FileNode>> {
        let node = self.by_name.remove(name)?;
        self.by_ino.remove(&node.ino);
        self.generation += 1;
        Some(node)
    }

    /// Drop `node` under whatever name it has now. False if it is not listed.
    pub fn remove_node(&mut self, node: &FileNode) -> bool {
        match self.by_ino.get(&node.ino).map(|(name, _)| name.clone()) {
            Some(name) => self.remove(&name).is_some(),
            None => false,
        }
    }

    /// List `node` under `name`, moving it if it had another name. Whatever
    /// other node held `name` is dropped from the namespace and returned so
    /// the caller can release its chunks.
    pub fn place(&mut self, name: &str, node: Arc<FileNode>) -> Option<Arc<FileNode>> {
        self.remove_node(&node);
        let replaced = self.remove(name);
        self.insert_node(name, node);
        replaced
    }
}

pub struct DirectoryIndex {
    ns: Mutex<Namespace>,
    changes: Mutex<()>,
    next_ino: AtomicU64,
}

impl Default for DirectoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryIndex {
    pub fn new() -> Self {
        Self {
            ns: Mutex::new(Namespace::default()),
            changes: Mutex::new(()),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Namespace> {
        self.ns.lock().await
    }

    /// Serializes namespace changes that involve the store. Taken before
    /// [`DirectoryIndex::lock`].
    pub async fn changes(&self) -> MutexGuard<'_, ()> {
        self.changes.lock().await
    }

    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a freshly created (or freshly discovered) file. A file a
    /// refresh already picked up keeps its node.
    pub fn insert(&self, ns: &mut Namespace, record: &FileRecord) -> Arc<FileNode> {
        if let Some(node) = ns.find(&record.id) {
            ns.place(&record.name, Arc::clone(&node));
            return node;
        }
        let node = Arc::new(FileNode::from_record(self.alloc_ino(), record));
        ns.insert_node(&record.name, Arc::clone(&node));
        node
    }

    pub async fn lookup(&self, name: &str) -> Option<Arc<FileNode>> {
        self.ns.lock().await.lookup(name)
    }

    pub async fn list(&self) -> Vec<DirEntry> {
        self.ns.lock().await.list()
    }

    /// Reconcile the namespace with a fresh listing of the store.
    ///
    /// Known files keep their node (and inode) and follow renames made in
    /// the store. Unless this process holds their write token, they also
    /// adopt a newer committed length. Files that vanished from the store are
    /// dropped unless they are still open here.
    pub async fn reconcile(
        &self,
        ns: &mut Namespace,
        records: Vec<FileRecord>,
        open: &HashSet<FileId>,
        written: &HashSet<FileId>,
    ) {
        let mut seen = HashSet::with_capacity(records.len());
        let known: HashMap<FileId, u64> = ns
            .by_ino
            .iter()
            .map(|(ino, (_, node))| (node.id.clone(), *ino))
            .collect();

        for record in records {
            seen.insert(record.id.clone());
            if let Some(ino) = known.get(&record.id) {
                let Some((current, node)) = ns.by_ino(*ino) else {
                    continue;
                };
                if !written.contains(&record.id) && node.observe(record.length, record.mtime).await {
                    debug!(name = %current, size = record.length, "file changed in store");
                }
                if current != record.name && !ns.by_name.contains_key(&record.name) {
                    debug!(from = %current, to = %record.name, "file renamed in store");
                    ns.place(&record.name, node);
                }
                continue;
            }
            if let Some(existing) = ns.by_name.get(&record.name) {
                warn!(
                    name = %record.name,
                    kept = %existing.id,
                    ignored = %record.id,
                    "duplicate file name in store"
                );
                continue;
            }
            self.insert(ns, &record);
        }

        let stale: Vec<String> = ns
            .by_name
            .iter()
            .filter(|(_, node)| !seen.contains(&node.id) && !open.contains(&node.id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            debug!(%name, "file no longer in store");
            ns.remove(&name);
        }
    }
}
