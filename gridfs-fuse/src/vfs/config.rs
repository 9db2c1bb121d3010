use crate::chuck::ChunkLayout;
use std::time::Duration;

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct VfsConfig {
    /// Chunk size given to newly created files. Existing files keep the
    /// chunk size recorded in their document.
    pub layout: ChunkLayout,

    /// Upper bound for a single backing-store call. An expired call fails
    /// the operation with an I/O error; nothing is retried.
    pub io_timeout: Duration,

    /// Flush after every FUSE write so a completed `write(2)` is visible to
    /// other open handles. Without it data becomes visible on flush/close.
    pub write_through: bool,

    /// Re-list the store on every readdir to pick up files created by other
    /// clients of the same database.
    pub refresh_on_readdir: bool,

    /// TTL the kernel may cache entries and attributes for.
    pub attr_ttl: Duration,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            layout: ChunkLayout::default(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            write_through: false,
            refresh_on_readdir: true,
            attr_ttl: DEFAULT_ATTR_TTL,
        }
    }
}

impl VfsConfig {
    pub fn new(layout: ChunkLayout) -> Self {
        Self {
            layout,
            ..Default::default()
        }
    }

    pub fn io_timeout(self, io_timeout: Duration) -> Self {
        Self { io_timeout, ..self }
    }

    pub fn write_through(self, write_through: bool) -> Self {
        Self {
            write_through,
            ..self
        }
    }

    pub fn refresh_on_readdir(self, refresh_on_readdir: bool) -> Self {
        Self {
            refresh_on_readdir,
            ..self
        }
    }

    pub fn attr_ttl(self, attr_ttl: Duration) -> Self {
        Self { attr_ttl, ..self }
    }
}
