//! Mount a GridFS-style chunk store as a flat POSIX filesystem over FUSE.
//!
//! - `cadapter`: object backends the chunk store is laid out on
//! - `chuck`: chunk layout, stored documents and the `ChunkStore` seam
//! - `vfs`: namespace, write arbitration, handles and the driver
//! - `fuse`: rfuse3 adapter and mount helpers

pub mod cadapter;
pub mod chuck;
pub mod fuse;
pub mod vfs;
