//! Chunk management (chuck)
//!
//! Files are cut into fixed-size chunks (256 KiB by default, fixed per file at
//! creation). Chunk `n` of a file covers bytes `[n * chunk_size, (n + 1) * chunk_size)`;
//! every chunk but the last is full and chunk indices have no holes.
//!
//! Submodules:
//! - `chunk`: layout constants, offset <-> chunk index math and range spans
//! - `document`: persisted file/chunk document shapes
//! - `store`: the `ChunkStore` adapter trait and its implementations
pub mod chunk;
pub mod document;
pub mod store;

pub use chunk::{ChunkLayout, ChunkSpan, ChunkSpans, DEFAULT_CHUNK_SIZE};
pub use document::{ChunkDocument, FileDocument, FileId, FileRecord};
pub use store::{ChunkStore, InMemoryChunkStore, ObjectChunkStore, StoreError, StoreResult};
