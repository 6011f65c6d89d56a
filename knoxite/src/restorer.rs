//! The inverse of the snapshot builder: streams chunks back out of a
//! [`ChunkStore`] and reconstructs a filesystem tree from a [`Snapshot`].
//!
//! Directories and parent paths are created with `spawn_blocking`-wrapped
//! `create_dir_all`, then files are written with their recorded
//! permissions and mtime. Progress is exposed the same way as the
//! builder's: a `Receiver` fed by a background task.

use std::path::{Path, PathBuf};

use knoxite_core::model::{Item, ItemType, Snapshot, Stats};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::Backend;
use crate::chunk_store::{ChunkStore, ChunkStoreError};

#[derive(Error, Debug)]
pub enum RestorerError {
    #[error("I/O error at {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error(transparent)]
    ChunkStore(#[from] ChunkStoreError),
    #[error("restore cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RestorerError>;

/// One progress event emitted per `Item` processed.
///
/// `item_error` is set when a single item's restore failed without
/// aborting the stream (currently, a chunk fingerprint mismatch mid-file,
/// which leaves a `.partial` file alongside the rest of the restore).
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub path: String,
    pub size: u64,
    pub storage_size: u64,
    pub stats: Stats,
    pub item_error: Option<String>,
}

#[derive(Clone)]
pub struct RestorerConfig {
    pub cancellation: CancellationToken,
}

impl Default for RestorerConfig {
    fn default() -> Self {
        RestorerConfig {
            cancellation: CancellationToken::new(),
        }
    }
}

/// Restores a [`Snapshot`] to `target_dir`, streaming progress as it goes.
pub struct SnapshotRestorer<B> {
    chunk_store: ChunkStore<B>,
}

impl<B: Backend + 'static> SnapshotRestorer<B> {
    pub fn new(chunk_store: ChunkStore<B>) -> SnapshotRestorer<B> {
        SnapshotRestorer { chunk_store }
    }

    /// Starts restoring `snapshot` to `target_dir`. Items are processed
    /// strictly in the snapshot's recorded order; the caller
    /// drains the returned receiver while the background task runs, and
    /// can join the handle afterwards to observe whether the restore
    /// completed, was cancelled, or aborted on a backend/crypto error.
    #[instrument(skip(self, snapshot, config))]
    pub fn decode_snapshot(
        &self,
        snapshot: Snapshot,
        target_dir: PathBuf,
        config: RestorerConfig,
    ) -> (mpsc::Receiver<ProgressEvent>, tokio::task::JoinHandle<Result<Stats>>) {
        let (tx, rx) = mpsc::channel(64);
        let chunk_store = self.chunk_store.clone();
        let handle = tokio::spawn(async move { run_restore(chunk_store, snapshot, target_dir, config, tx).await });
        (rx, handle)
    }
}

async fn run_restore<B: Backend + 'static>(
    chunk_store: ChunkStore<B>,
    snapshot: Snapshot,
    target_dir: PathBuf,
    config: RestorerConfig,
    progress: mpsc::Sender<ProgressEvent>,
) -> Result<Stats> {
    let mut stats = Stats::default();

    for item in &snapshot.items {
        if config.cancellation.is_cancelled() {
            info!("restore cancelled, closing progress stream");
            return Err(RestorerError::Cancelled);
        }

        let outcome = restore_item(&chunk_store, &target_dir, item).await;
        match outcome {
            Ok(()) => {
                stats.add_item(item);
                let _ = progress
                    .send(ProgressEvent {
                        path: item.path.clone(),
                        size: item.size,
                        storage_size: item.storage_size,
                        stats,
                        item_error: None,
                    })
                    .await;
            }
            Err(RestorerError::ChunkStore(ChunkStoreError::ChunkCorrupt { expected, actual })) => {
                stats.errors += 1;
                warn!(path = %item.path, expected, actual, "chunk fingerprint mismatch, leaving .partial file");
                let _ = progress
                    .send(ProgressEvent {
                        path: item.path.clone(),
                        size: item.size,
                        storage_size: item.storage_size,
                        stats,
                        item_error: Some(format!("chunk corrupt: expected {expected}, got {actual}")),
                    })
                    .await;
            }
            Err(RestorerError::Io { path, source }) => {
                stats.errors += 1;
                debug!(path = %path, error = %source, "restore io error, continuing");
                let _ = progress
                    .send(ProgressEvent {
                        path,
                        size: item.size,
                        storage_size: item.storage_size,
                        stats,
                        item_error: Some(source.to_string()),
                    })
                    .await;
            }
            // An AEAD integrity failure (bad key or tampered ciphertext,
            // `ChunkStoreError::Envelope`), a backend I/O failure after
            // retries, or any other error lands here and aborts the whole
            // restore rather than recovering per-item the way `ChunkCorrupt`
            // does above.
            Err(other) => return Err(other),
        }
    }

    Ok(stats)
}

async fn restore_item<B: Backend + 'static>(chunk_store: &ChunkStore<B>, target_dir: &Path, item: &Item) -> Result<()> {
    let path = target_dir.join(&item.path);
    match item.item_type {
        ItemType::Directory => restore_directory(&path, item).await,
        ItemType::SymLink => restore_symlink(&path, item).await,
        ItemType::File => restore_file(chunk_store, &path, item).await,
    }
}

async fn restore_directory(path: &Path, item: &Item) -> Result<()> {
    let path = path.to_path_buf();
    let mode = item.mode;
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "existing non-directory entry at this path",
            )),
            Err(_) => {
                std::fs::create_dir_all(&path)?;
                set_unix_mode(&path, mode);
                Ok(())
            }
        }
    })
    .await
    .map_err(|_| io_panic(&item.path))?
    .map_err(|e| io_err(&item.path, e))
}

async fn restore_symlink(path: &Path, item: &Item) -> Result<()> {
    let path = path.to_path_buf();
    let target = item
        .symlink_target
        .clone()
        .expect("SymLink items always carry a target");
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.symlink_metadata().is_ok() {
            std::fs::remove_file(&path)?;
        }
        create_symlink(&target, &path)
    })
    .await
    .map_err(|_| io_panic(&item.path))?
    .map_err(|e| io_err(&item.path, e))
}

async fn restore_file<B: Backend + 'static>(chunk_store: &ChunkStore<B>, path: &Path, item: &Item) -> Result<()> {
    let parent = path.parent().map(Path::to_path_buf);
    if let Some(parent) = parent {
        tokio::task::spawn_blocking(move || std::fs::create_dir_all(parent))
            .await
            .map_err(|_| io_panic(&item.path))?
            .map_err(|e| io_err(&item.path, e))?;
    }

    let mut buffer = Vec::with_capacity(item.size as usize);
    for chunk_ref in &item.chunks {
        match chunk_store.get(chunk_ref).await {
            Ok(plaintext) => buffer.extend(plaintext),
            Err(e @ ChunkStoreError::ChunkCorrupt { .. }) => {
                let path = path.to_path_buf();
                let partial_path = partial_path(&path);
                tokio::task::spawn_blocking(move || std::fs::write(&partial_path, &buffer))
                    .await
                    .map_err(|_| io_panic(&item.path))?
                    .map_err(|err| io_err(&item.path, err))?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }
    }

    let path = path.to_path_buf();
    let mode = item.mode;
    let mtime = item.modification_time;
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::write(&path, &buffer)?;
        set_unix_mode(&path, mode);
        set_mtime(&path, mtime);
        Ok(())
    })
    .await
    .map_err(|_| io_panic(&item.path))?
    .map_err(|e| io_err(&item.path, e))
}

fn partial_path(path: &Path) -> PathBuf {
    let mut os_string = path.as_os_str().to_owned();
    os_string.push(".partial");
    PathBuf::from(os_string)
}

fn io_err(rel_key: &str, source: std::io::Error) -> RestorerError {
    RestorerError::Io {
        path: rel_key.to_string(),
        source,
    }
}

fn io_panic(rel_key: &str) -> RestorerError {
    RestorerError::Io {
        path: rel_key.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "restore task panicked"),
    }
}

#[cfg(unix)]
fn create_symlink(target: &str, path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(not(unix))]
fn create_symlink(target: &str, path: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, path)
}

#[cfg(unix)]
fn set_unix_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_unix_mode(_path: &Path, _mode: u32) {}

fn set_mtime(path: &Path, mtime: chrono::DateTime<chrono::Utc>) {
    let seconds = mtime.timestamp();
    let nanos = mtime.timestamp_subsec_nanos();
    let system_time = std::time::UNIX_EPOCH + std::time::Duration::new(seconds.max(0) as u64, nanos);
    let file_time = filetime::FileTime::from_system_time(system_time);
    let _ = filetime::set_file_times(path, file_time, file_time);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::builder::{BuilderConfig, SnapshotBuilder};
    use crate::chunk_store::ChunkStoreConfig;
    use knoxite_core::envelope::{Envelope, Key};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trips_a_single_file() {
        let source = tempdir().unwrap();
        fs::write(source.path().join("snapshot_test.go"), b"package knoxite\n").unwrap();

        let key = Key::random();
        let store = ChunkStore::new(
            MemoryBackend::new(),
            key,
            Envelope::default(),
            ChunkStoreConfig::default(),
        );

        let builder = SnapshotBuilder::new(store.clone());
        let (mut rx, handle) = builder.add(
            source.path().to_path_buf(),
            vec![PathBuf::from("snapshot_test.go")],
            "test".into(),
            BuilderConfig::default(),
        );
        while rx.recv().await.is_some() {}
        let snapshot = handle.await.unwrap().unwrap();

        let target = tempdir().unwrap();
        let restorer = SnapshotRestorer::new(store);
        let (mut rx, handle) = restorer.decode_snapshot(snapshot, target.path().to_path_buf(), RestorerConfig::default());
        while rx.recv().await.is_some() {}
        handle.await.unwrap().unwrap();

        let restored = fs::read(target.path().join("snapshot_test.go")).unwrap();
        assert_eq!(restored, b"package knoxite\n");
    }

    #[tokio::test]
    async fn directories_and_symlinks_round_trip() {
        let source = tempdir().unwrap();
        fs::create_dir(source.path().join("sub")).unwrap();
        fs::write(source.path().join("sub").join("f.txt"), b"x").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("f.txt", source.path().join("sub").join("link")).unwrap();

        let store = ChunkStore::new(
            MemoryBackend::new(),
            Key::random(),
            Envelope::default(),
            ChunkStoreConfig::default(),
        );
        let builder = SnapshotBuilder::new(store.clone());
        let (mut rx, handle) = builder.add(
            source.path().to_path_buf(),
            vec![PathBuf::from("sub")],
            "test".into(),
            BuilderConfig::default(),
        );
        while rx.recv().await.is_some() {}
        let snapshot = handle.await.unwrap().unwrap();

        let target = tempdir().unwrap();
        let restorer = SnapshotRestorer::new(store);
        let (mut rx, handle) = restorer.decode_snapshot(snapshot, target.path().to_path_buf(), RestorerConfig::default());
        while rx.recv().await.is_some() {}
        handle.await.unwrap().unwrap();

        assert!(target.path().join("sub").is_dir());
        assert!(target.path().join("sub").join("f.txt").exists());
        #[cfg(unix)]
        {
            let link = target.path().join("sub").join("link");
            assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
        }
    }
}
