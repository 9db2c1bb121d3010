//! Persisted document shapes.
//!
//! Mirrors the GridFS `fs.files` / `fs.chunks` collections: one file document
//! per namespace entry and one chunk document per stored chunk. Field names
//! follow the GridFS wire names so a dump of the store reads like a GridFS
//! collection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Opaque, immutable identifier of a file in the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `fs.files` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDocument {
    #[serde(rename = "_id")]
    pub id: FileId,
    pub filename: String,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u64,
    pub length: u64,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "uploadDate")]
    pub upload_date: u64,
}

/// `fs.chunks` document header. A stored chunk object is the header as one
/// line of JSON, a `\n`, then the payload, so header and payload are always
/// replaced together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDocument {
    pub files_id: FileId,
    pub n: u64,
    pub len: u64,
    /// Hex md5 of the payload.
    pub md5: String,
}

impl ChunkDocument {
    pub fn for_payload(files_id: FileId, n: u64, data: &[u8]) -> Self {
        Self {
            files_id,
            n,
            len: data.len() as u64,
            md5: hex::encode(md5::compute(data).0),
        }
    }

    /// True when `data` is the payload this document was written for.
    pub fn matches(&self, data: &[u8]) -> bool {
        self.len == data.len() as u64 && self.md5 == hex::encode(md5::compute(data).0)
    }

    /// Serialize the header followed by `data` into one object body.
    pub fn encode(&self, data: &[u8]) -> serde_json::Result<Vec<u8>> {
        let mut raw = serde_json::to_vec(self)?;
        raw.reserve(data.len() + 1);
        raw.push(b'\n');
        raw.extend_from_slice(data);
        Ok(raw)
    }

    /// Split an object body back into header and payload. `None` when the
    /// body has no parseable header.
    pub fn decode(raw: &[u8]) -> Option<(Self, &[u8])> {
        let split = raw.iter().position(|b| *b == b'\n')?;
        let doc = serde_json::from_slice(&raw[..split]).ok()?;
        Some((doc, &raw[split + 1..]))
    }
}

/// What the store reports about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub id: FileId,
    pub length: u64,
    pub chunk_size: u64,
    pub mtime: SystemTime,
}

impl From<FileDocument> for FileRecord {
    fn from(doc: FileDocument) -> Self {
        Self {
            name: doc.filename,
            id: doc.id,
            length: doc.length,
            chunk_size: doc.chunk_size,
            mtime: millis_to_time(doc.upload_date),
        }
    }
}

impl From<&FileRecord> for FileDocument {
    fn from(rec: &FileRecord) -> Self {
        Self {
            id: rec.id.clone(),
            filename: rec.name.clone(),
            chunk_size: rec.chunk_size,
            length: rec.length,
            upload_date: time_to_millis(rec.mtime),
        }
    }
}

pub fn time_to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn millis_to_time(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}
