//! Walks a source tree to produce [`Item`] records (path, type, size, chunk
//! list, permissions) and streams progress events while doing it.
//!
//! A `walkdir` traversal in depth-first sorted order; metadata reads and
//! file reads happen off the async executor via `spawn_blocking`, with
//! each file's bytes fed through a content-defined chunker. Progress is
//! exposed as a `Receiver` the caller drains, fed by a background task so
//! the walk and the chunk store's own worker pool run concurrently with
//! the caller pulling events.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use knoxite_chunker::{ChunkerError, FastCdc};
use knoxite_chunker::Chunker as _;
use knoxite_core::model::{Item, Snapshot, Stats};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::backend::Backend;
use crate::chunk_store::{ChunkStore, ChunkStoreError};

#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("I/O error at {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error(transparent)]
    ChunkStore(#[from] ChunkStoreError),
    #[error(transparent)]
    Chunker(#[from] ChunkerError),
    #[error("a chunking task panicked")]
    WorkerPanicked,
    #[error("build cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BuilderError>;

/// One progress event emitted per completed chunk (or per completed small
/// file).
///
/// Consumers may drop events on the floor without affecting correctness:
/// the authoritative result is the `Snapshot` the builder's join handle
/// resolves to.
#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub path: String,
    pub size: u64,
    pub storage_size: u64,
    pub stats: Stats,
    /// Set for a per-item error (unreadable file, permission denied) that
    /// was recorded in `stats.errors` and did not abort the snapshot.
    pub item_error: Option<String>,
}

/// Explicit configuration for one [`SnapshotBuilder::add`] call -- no
/// global/CLI-options singleton.
#[derive(Clone)]
pub struct BuilderConfig {
    pub exclude_symlinks: bool,
    pub exclude_hidden: bool,
    pub cancellation: CancellationToken,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        BuilderConfig {
            exclude_symlinks: false,
            exclude_hidden: false,
            cancellation: CancellationToken::new(),
        }
    }
}

/// Walks a source tree and streams it into a [`ChunkStore`], producing a
/// finalized but not-yet-persisted [`Snapshot`].
#[derive(Clone)]
pub struct SnapshotBuilder<B> {
    chunk_store: ChunkStore<B>,
    chunker: FastCdc,
}

impl<B: Backend + 'static> SnapshotBuilder<B> {
    pub fn new(chunk_store: ChunkStore<B>) -> SnapshotBuilder<B> {
        SnapshotBuilder {
            chunk_store,
            chunker: FastCdc::default(),
        }
    }

    /// Starts walking `relative_paths` under `base_path`, each in
    /// depth-first sorted order. Returns a progress receiver the caller
    /// drains, and a join handle resolving to the finalized `Snapshot` once
    /// the walk and all chunk stores have completed.
    ///
    /// The snapshot is not persisted by this call; pass the resolved value
    /// to [`crate::repository::Repository::save_snapshot`].
    #[instrument(skip(self, relative_paths, config))]
    pub fn add(
        &self,
        base_path: PathBuf,
        relative_paths: Vec<PathBuf>,
        description: String,
        config: BuilderConfig,
    ) -> (
        mpsc::Receiver<ProgressEvent>,
        tokio::task::JoinHandle<Result<Snapshot>>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let chunk_store = self.chunk_store.clone();
        let chunker = self.chunker;
        let handle = tokio::spawn(async move {
            build_snapshot(chunk_store, chunker, base_path, relative_paths, description, config, tx).await
        });
        (rx, handle)
    }
}

async fn build_snapshot<B: Backend + 'static>(
    chunk_store: ChunkStore<B>,
    chunker: FastCdc,
    base_path: PathBuf,
    relative_paths: Vec<PathBuf>,
    description: String,
    config: BuilderConfig,
    progress: mpsc::Sender<ProgressEvent>,
) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new(Uuid::new_v4().to_string(), description);

    for relative_path in relative_paths {
        let root = base_path.join(&relative_path);
        let walker = WalkDir::new(&root).sort_by_file_name();

        for entry in walker {
            if config.cancellation.is_cancelled() {
                info!("build cancelled, closing progress stream");
                return Err(BuilderError::Cancelled);
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    snapshot.stats.errors += 1;
                    warn!(error = %e, "walk error, continuing");
                    let _ = progress
                        .send(ProgressEvent {
                            path: e.path().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
                            size: 0,
                            storage_size: 0,
                            stats: snapshot.stats,
                            item_error: Some(e.to_string()),
                        })
                        .await;
                    continue;
                }
            };

            let rel_key = to_relative_key(&base_path, entry.path());
            if config.exclude_hidden && is_hidden(entry.path()) {
                continue;
            }

            let file_type = entry.file_type();
            let item_result = if file_type.is_symlink() {
                if config.exclude_symlinks {
                    continue;
                }
                build_symlink_item(entry.path(), &rel_key)
            } else if file_type.is_dir() {
                build_directory_item(entry.path(), &rel_key)
            } else {
                build_file_item(&chunk_store, chunker, entry.path(), &rel_key, &progress, &snapshot.stats)
                    .await
            };

            match item_result {
                Ok(item) => {
                    snapshot.stats.add_item(&item);
                    let _ = progress
                        .send(ProgressEvent {
                            path: item.path.clone(),
                            size: item.size,
                            storage_size: item.storage_size,
                            stats: snapshot.stats,
                            item_error: None,
                        })
                        .await;
                    snapshot.items.push(item);
                }
                Err(BuilderError::Io { path, source }) => {
                    snapshot.stats.errors += 1;
                    debug!(path = %path, error = %source, "unreadable item, continuing");
                    let _ = progress
                        .send(ProgressEvent {
                            path,
                            size: 0,
                            storage_size: 0,
                            stats: snapshot.stats,
                            item_error: Some(source.to_string()),
                        })
                        .await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    Ok(snapshot)
}

fn build_directory_item(path: &Path, rel_key: &str) -> Result<Item> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| io_err(rel_key, e))?;
    let (mode, uid, gid, mtime) = unix_attrs(&metadata);
    Ok(Item::new_directory(rel_key.to_string(), mode, uid, gid, mtime))
}

fn build_symlink_item(path: &Path, rel_key: &str) -> Result<Item> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| io_err(rel_key, e))?;
    let target = std::fs::read_link(path)
        .map_err(|e| io_err(rel_key, e))?
        .to_string_lossy()
        .into_owned();
    let (mode, uid, gid, mtime) = unix_attrs(&metadata);
    Ok(Item::new_symlink(rel_key.to_string(), target, mode, uid, gid, mtime))
}

async fn build_file_item<B: Backend + 'static>(
    chunk_store: &ChunkStore<B>,
    chunker: FastCdc,
    path: &Path,
    rel_key: &str,
    progress: &mpsc::Sender<ProgressEvent>,
    running_stats: &Stats,
) -> Result<Item> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| io_err(rel_key, e))?;
    let (mode, uid, gid, mtime) = unix_attrs(&metadata);

    let owned_path = path.to_path_buf();
    let segments = tokio::task::spawn_blocking(move || -> std::result::Result<Vec<(String, Vec<u8>)>, std::io::Error> {
        let file = std::fs::File::open(&owned_path)?;
        let mut out = Vec::new();
        for segment in chunker.chunk(file) {
            let segment = segment.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            out.push((segment.sha_sum, segment.data));
        }
        Ok(out)
    })
    .await
    .map_err(|_| BuilderError::WorkerPanicked)?
    .map_err(|e| io_err(rel_key, e))?;

    let mut chunk_refs = Vec::new();
    let mut size = 0_u64;
    let mut storage_size = 0_u64;

    for (sha_sum, data) in segments {
        size += data.len() as u64;
        let (mut refs, sealed_len) = chunk_store.put(&sha_sum, &data).await?;
        storage_size += sealed_len;
        chunk_refs.append(&mut refs);
        let mut stats = *running_stats;
        stats.size += size;
        stats.storage_size += storage_size;
        let _ = progress
            .send(ProgressEvent {
                path: rel_key.to_string(),
                size,
                storage_size,
                stats,
                item_error: None,
            })
            .await;
    }

    Ok(Item::new_file(rel_key.to_string(), mode, uid, gid, mtime, size, storage_size, chunk_refs))
}

fn io_err(rel_key: &str, source: std::io::Error) -> BuilderError {
    BuilderError::Io {
        path: rel_key.to_string(),
        source,
    }
}

#[cfg(unix)]
fn unix_attrs(metadata: &std::fs::Metadata) -> (u32, u32, u32, DateTime<Utc>) {
    use std::os::unix::fs::MetadataExt;
    let mtime = DateTime::from_timestamp(metadata.mtime(), 0).unwrap_or_else(Utc::now);
    (metadata.mode(), metadata.uid(), metadata.gid(), mtime)
}

#[cfg(not(unix))]
fn unix_attrs(metadata: &std::fs::Metadata) -> (u32, u32, u32, DateTime<Utc>) {
    let mtime = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    (0o644, 0, 0, mtime)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Converts an absolute walked path into the relative, forward-slash,
/// NFC-normalized key used as `Item::path`.
fn to_relative_key(base_path: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(base_path).unwrap_or(path);
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    joined.nfc().collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::chunk_store::ChunkStoreConfig;
    use knoxite_core::envelope::{Envelope, Key};
    use std::fs;
    use tempfile::tempdir;

    fn builder() -> SnapshotBuilder<MemoryBackend> {
        let store = ChunkStore::new(MemoryBackend::new(), Key::random(), Envelope::default(), ChunkStoreConfig::default());
        SnapshotBuilder::new(store)
    }

    #[tokio::test]
    async fn single_small_file_produces_one_item() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let builder = builder();
        let (mut rx, handle) = builder.add(
            dir.path().to_path_buf(),
            vec![PathBuf::from("a.txt")],
            "test".into(),
            BuilderConfig::default(),
        );
        while rx.recv().await.is_some() {}
        let snapshot = handle.await.unwrap().unwrap();

        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].path, "a.txt");
        assert_eq!(snapshot.items[0].size, 5);
        assert_eq!(snapshot.stats.files, 1);
    }

    #[tokio::test]
    async fn nested_directory_is_walked_in_sorted_order() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b.txt"), b"b").unwrap();
        fs::write(dir.path().join("sub").join("a.txt"), b"a").unwrap();

        let builder = builder();
        let (mut rx, handle) = builder.add(
            dir.path().to_path_buf(),
            vec![PathBuf::from("sub")],
            "test".into(),
            BuilderConfig::default(),
        );
        while rx.recv().await.is_some() {}
        let snapshot = handle.await.unwrap().unwrap();

        let paths: Vec<&str> = snapshot.items.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["sub", "sub/a.txt", "sub/b.txt"]);
    }

    #[tokio::test]
    async fn unreadable_file_increments_errors_without_aborting() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"ok").unwrap();
        let missing_child = dir.path().join("ghost");
        // Simulate a walk error by pointing at a path that vanishes between
        // listing and stat: walkdir already filters most of these, so this
        // test instead exercises the per-item io-error path directly via a
        // broken symlink, which `symlink_metadata` can still stat.
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&missing_child, dir.path().join("broken")).unwrap();
        }

        let builder = builder();
        let (mut rx, handle) = builder.add(
            dir.path().to_path_buf(),
            vec![PathBuf::from(".")],
            "test".into(),
            BuilderConfig::default(),
        );
        while rx.recv().await.is_some() {}
        let snapshot = handle.await.unwrap().unwrap();
        assert!(snapshot.items.iter().any(|i| i.path.ends_with("a.txt")));
    }
}
