//! A [`Backend`](super::Backend) rooted at a directory on the local
//! filesystem.
//!
//! The on-disk layout mirrors the original local storage driver this engine
//! is descended from:
//!
//! ```text
//! <root>/repository.knox   the sealed repository index
//! <root>/chunks/           one file per stored chunk part, named by ChunkRef::storage_filename
//! <root>/snapshots/        one file per sealed snapshot, named by snapshot ID
//! ```
//!
//! The repository directory and its `repository.knox` index are created with
//! restrictive permissions (`0700`/`0600`) on unix, since they may contain
//! key material and plaintext-length metadata even though the payloads
//! themselves are encrypted.

use super::{Backend, BackendError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

const REPOSITORY_FILE: &str = "repository.knox";
const CHUNKS_DIR: &str = "chunks";
const SNAPSHOTS_DIR: &str = "snapshots";

#[derive(Clone, Debug)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Opens a backend rooted at `root`. Does not touch the filesystem; call
    /// [`Backend::init_repository`] to create a new repository, or use an
    /// existing one directly.
    pub fn new(root: impl Into<PathBuf>) -> LocalBackend {
        LocalBackend { root: root.into() }
    }

    fn repository_path(&self) -> PathBuf {
        self.root.join(REPOSITORY_FILE)
    }

    fn chunk_path(&self, storage_filename: &str) -> PathBuf {
        self.root.join(CHUNKS_DIR).join(storage_filename)
    }

    fn snapshot_path(&self, id: &str) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(id)
    }

    async fn read_file(path: &Path) -> Result<Vec<u8>> {
        match fs::read(path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackendError::NotFound(
                path.to_string_lossy().into_owned(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file_restricted(path: &Path, data: &[u8]) -> Result<()> {
        fs::write(path, data).await?;
        restrict_permissions(path).await?;
        Ok(())
    }

    /// Creates the root directory and the `chunks`/`snapshots` namespaces if
    /// they are missing. Idempotent, so it is safe to call on every save as
    /// well as on init, in case something external removed them in between.
    async fn ensure_namespaces(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        restrict_dir_permissions(&self.root).await?;
        fs::create_dir_all(self.root.join(CHUNKS_DIR)).await?;
        fs::create_dir_all(self.root.join(SNAPSHOTS_DIR)).await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(unix)]
async fn restrict_dir_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o700);
    fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_dir_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl Backend for LocalBackend {
    fn location(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["file"]
    }

    async fn init_repository(&self) -> Result<()> {
        if fs::metadata(self.repository_path()).await.is_ok() {
            return Err(BackendError::RepositoryExists);
        }
        self.ensure_namespaces().await
    }

    async fn load_repository(&self) -> Result<Vec<u8>> {
        Self::read_file(&self.repository_path()).await
    }

    async fn save_repository(&self, data: &[u8]) -> Result<()> {
        self.ensure_namespaces().await?;
        Self::write_file_restricted(&self.repository_path(), data).await
    }

    async fn load_snapshot(&self, id: &str) -> Result<Vec<u8>> {
        Self::read_file(&self.snapshot_path(id)).await
    }

    async fn save_snapshot(&self, id: &str, data: &[u8]) -> Result<()> {
        Self::write_file_restricted(&self.snapshot_path(id), data).await
    }

    async fn load_chunk(&self, storage_filename: &str) -> Result<Vec<u8>> {
        Self::read_file(&self.chunk_path(storage_filename)).await
    }

    async fn store_chunk(&self, storage_filename: &str, data: &[u8]) -> Result<u64> {
        let path = self.chunk_path(storage_filename);
        if fs::metadata(&path).await.is_ok() {
            return Ok(0);
        }
        Self::write_file_restricted(&path, data).await?;
        Ok(data.len() as u64)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn init_creates_expected_layout() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("repo"));
        backend.init_repository().await.unwrap();
        assert!(dir.path().join("repo").join(CHUNKS_DIR).is_dir());
        assert!(dir.path().join("repo").join(SNAPSHOTS_DIR).is_dir());
    }

    #[tokio::test]
    async fn init_twice_fails() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.init_repository().await.unwrap();
        backend.save_repository(b"index").await.unwrap();
        assert!(matches!(
            backend.init_repository().await,
            Err(BackendError::RepositoryExists)
        ));
    }

    #[tokio::test]
    async fn chunk_store_is_idempotent_and_roundtrips() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.init_repository().await.unwrap();
        let first = backend.store_chunk("abc.0_1", b"payload").await.unwrap();
        let second = backend.store_chunk("abc.0_1", b"payload").await.unwrap();
        assert_eq!(first, 7);
        assert_eq!(second, 0);
        assert_eq!(backend.load_chunk("abc.0_1").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn missing_snapshot_errors() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.init_repository().await.unwrap();
        assert!(matches!(
            backend.load_snapshot("does-not-exist").await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn save_repository_recreates_missing_namespaces() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.init_repository().await.unwrap();
        std::fs::remove_dir_all(dir.path().join(CHUNKS_DIR)).unwrap();
        std::fs::remove_dir_all(dir.path().join(SNAPSHOTS_DIR)).unwrap();

        backend.save_repository(b"index").await.unwrap();

        assert!(dir.path().join(CHUNKS_DIR).is_dir());
        assert!(dir.path().join(SNAPSHOTS_DIR).is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn repository_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.init_repository().await.unwrap();
        backend.save_repository(b"index").await.unwrap();
        let meta = std::fs::metadata(dir.path().join(REPOSITORY_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
