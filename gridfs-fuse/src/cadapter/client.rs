//! High-level object client wrapping backend put/get/delete/list operations.

use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Returns `None` when no object is stored under `key`.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Deleting a missing key is not an error.
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// Keys directly below `prefix` (one level, no recursion), without the prefix.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;
}

#[derive(Clone)]
pub struct ObjectClient<B: ObjectBackend> {
    backend: B,
}

impl<B: ObjectBackend> ObjectClient<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        self.backend.put_object(key, data).await
    }

    pub async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.backend.get_object(key).await
    }

    pub async fn delete_object(&self, key: &str) -> Result<()> {
        self.backend.delete_object(key).await
    }

    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        self.backend.list_objects(prefix).await
    }
}
