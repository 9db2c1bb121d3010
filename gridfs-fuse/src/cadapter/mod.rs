//! Object backend adapter (cAdapter)
//!
//! The chunk store persists file documents and chunk payloads as opaque
//! objects addressed by string keys. This module holds the raw object layer:
//!
//! - `client`: the `ObjectBackend` trait and the `ObjectClient` wrapper used
//!   by `chuck::store::ObjectChunkStore`.
//! - `localfs`: a backend that keeps every object as a file below a root
//!   directory, used by the mount binary and by tests.
pub mod client;
pub mod localfs;
