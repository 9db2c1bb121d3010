//! Chunk layout and indexing utilities.
//!
//! - GridFS-style fixed-size chunk partitioning.
//! - Helpers to compute (chunk_index, offset_in_chunk) from file offsets.
//! - Expected chunk lengths for a given file length, used to validate chunks
//!   coming back from the store.
//! - Walking a file byte range chunk by chunk.

/// Default chunk size (256 KiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024;

/// Layout parameters for chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub chunk_size: u64,
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkLayout {
    pub fn new(chunk_size: u64) -> Self {
        Self { chunk_size }
    }

    #[inline]
    pub fn chunk_index_of(&self, file_offset: u64) -> u64 {
        file_offset / self.chunk_size
    }

    #[inline]
    pub fn within_chunk_offset(&self, file_offset: u64) -> u64 {
        file_offset % self.chunk_size
    }

    /// Number of chunks a file of `file_len` bytes is stored in.
    #[inline]
    pub fn chunk_count(&self, file_len: u64) -> u64 {
        file_len.div_ceil(self.chunk_size)
    }

    /// Length chunk `chunk_index` must have in a file of `file_len` bytes
    /// (0 for chunks past the end).
    #[inline]
    pub fn chunk_len(&self, chunk_index: u64, file_len: u64) -> u64 {
        let (start, end) = self.chunk_byte_range(chunk_index);
        if file_len <= start {
            0
        } else {
            file_len.min(end) - start
        }
    }

    /// Return the file byte range [start, end) covered by a chunk index (end exclusive).
    #[inline]
    pub fn chunk_byte_range(&self, chunk_index: u64) -> (u64, u64) {
        let start = chunk_index * self.chunk_size;
        let end = start + self.chunk_size;
        (start, end)
    }

    /// The pieces of `[offset, offset + len)`, one per chunk touched, in
    /// file order.
    pub fn spans(&self, offset: u64, len: usize) -> ChunkSpans {
        ChunkSpans {
            chunk_size: self.chunk_size,
            offset,
            remaining: len as u64,
        }
    }
}

/// One piece of a file range that lies inside a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub chunk_index: u64,
    pub offset_in_chunk: u64,
    pub len: usize,
}

/// Iterator returned by [`ChunkLayout::spans`].
#[derive(Debug, Clone)]
pub struct ChunkSpans {
    chunk_size: u64,
    offset: u64,
    remaining: u64,
}

impl Iterator for ChunkSpans {
    type Item = ChunkSpan;

    fn next(&mut self) -> Option<ChunkSpan> {
        if self.remaining == 0 {
            return None;
        }
        let offset_in_chunk = self.offset % self.chunk_size;
        let len = (self.chunk_size - offset_in_chunk).min(self.remaining);
        let span = ChunkSpan {
            chunk_index: self.offset / self.chunk_size,
            offset_in_chunk,
            len: len as usize,
        };
        self.offset += len;
        self.remaining -= len;
        Some(span)
    }
}
