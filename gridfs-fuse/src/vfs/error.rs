//! Error vocabulary of the filesystem core. The FUSE layer maps each variant
//! onto an errno (see `fuse::errno_of`).

use crate::chuck::StoreError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("no such file: {name}")]
    NotFound { name: String },

    #[error("file is already open for writing: {name}")]
    Busy { name: String },

    #[error("handle is not the write owner of its file")]
    NotWriteOwner,

    #[error("unknown file handle {0}")]
    BadHandle(u64),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("backing store i/o failure: {0}")]
    IoFailure(String),

    #[error("corrupted file data: {0}")]
    Corruption(String),
}

impl VfsError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn busy(name: impl Into<String>) -> Self {
        Self::Busy { name: name.into() }
    }

    pub fn timed_out(limit: Duration) -> Self {
        Self::IoFailure(format!("backing store call timed out after {limit:?}"))
    }
}

impl From<StoreError> for VfsError {
    fn from(value: StoreError) -> Self {
        match value {
            e @ StoreError::ChecksumMismatch { .. } => VfsError::Corruption(e.to_string()),
            e => VfsError::IoFailure(e.to_string()),
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;
