//! An in-memory [`Backend`](super::Backend), useful for tests and as a
//! reference implementation of the backend contract.

use super::{Backend, BackendError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    repository: Option<Vec<u8>>,
    snapshots: HashMap<String, Vec<u8>>,
    chunks: HashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn location(&self) -> String {
        "memory://".to_string()
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["memory"]
    }

    async fn init_repository(&self) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory backend mutex poisoned");
        if inner.repository.is_some() {
            return Err(BackendError::RepositoryExists);
        }
        inner.repository = Some(Vec::new());
        Ok(())
    }

    async fn load_repository(&self) -> Result<Vec<u8>> {
        let inner = self.inner.lock().expect("memory backend mutex poisoned");
        inner
            .repository
            .clone()
            .ok_or_else(|| BackendError::NotFound(super::REPOSITORY_INDEX_KEY.to_string()))
    }

    async fn save_repository(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory backend mutex poisoned");
        inner.repository = Some(data.to_vec());
        Ok(())
    }

    async fn load_snapshot(&self, id: &str) -> Result<Vec<u8>> {
        let inner = self.inner.lock().expect("memory backend mutex poisoned");
        inner
            .snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(id.to_string()))
    }

    async fn save_snapshot(&self, id: &str, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory backend mutex poisoned");
        inner.snapshots.insert(id.to_string(), data.to_vec());
        Ok(())
    }

    async fn load_chunk(&self, storage_filename: &str) -> Result<Vec<u8>> {
        let inner = self.inner.lock().expect("memory backend mutex poisoned");
        inner
            .chunks
            .get(storage_filename)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(storage_filename.to_string()))
    }

    async fn store_chunk(&self, storage_filename: &str, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock().expect("memory backend mutex poisoned");
        if inner.chunks.contains_key(storage_filename) {
            return Ok(0);
        }
        inner.chunks.insert(storage_filename.to_string(), data.to_vec());
        Ok(data.len() as u64)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_twice_fails() {
        let backend = MemoryBackend::new();
        backend.init_repository().await.unwrap();
        assert!(matches!(
            backend.init_repository().await,
            Err(BackendError::RepositoryExists)
        ));
    }

    #[tokio::test]
    async fn load_missing_snapshot_errors() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.load_snapshot("nope").await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn store_chunk_is_idempotent() {
        let backend = MemoryBackend::new();
        let first = backend.store_chunk("abc.0_1", b"hello").await.unwrap();
        let second = backend.store_chunk("abc.0_1", b"hello").await.unwrap();
        assert_eq!(first, 5);
        assert_eq!(second, 0);
        assert_eq!(backend.load_chunk("abc.0_1").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn repository_roundtrip() {
        let backend = MemoryBackend::new();
        backend.init_repository().await.unwrap();
        backend.save_repository(b"index-bytes").await.unwrap();
        assert_eq!(backend.load_repository().await.unwrap(), b"index-bytes");
    }
}
