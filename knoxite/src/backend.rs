//! The storage backend abstraction.
//!
//! A [`Backend`] provides the handful of named operations a repository needs
//! from durable storage, independent of whatever medium actually holds the
//! bytes. Every operation is keyed by a plain string (a chunk's hex sha sum,
//! a snapshot ID, or the well-known repository index key); the backend
//! itself has no notion of encryption, chunking, or deduplication.
//!
//! Cloning a backend handle yields a new view over the same storage, and
//! clones are expected to be used concurrently from multiple tasks.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

/// The well-known key the repository index is stored under.
pub const REPOSITORY_INDEX_KEY: &str = "repository.knox";

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no data found for key {0:?}")]
    NotFound(String),
    #[error("a repository already exists at this location")]
    RepositoryExists,
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Abstract, protocol-agnostic access to the durable storage a repository is
/// kept in.
///
/// Every write must be durable before the call returns successfully: a
/// `Backend` is not permitted to buffer data past the end of the async call
/// that wrote it.
#[async_trait]
pub trait Backend: Send + Sync + Clone + std::fmt::Debug {
    /// A short, human-readable description of where this backend is rooted
    /// (a path, a URL, ...), used in diagnostics.
    fn location(&self) -> String;

    /// The storage protocols/schemes this backend implementation accepts,
    /// e.g. `["file"]`. Used by callers that construct a backend from a URL.
    fn protocols(&self) -> &'static [&'static str];

    /// Prepares the location to hold a new repository.
    ///
    /// # Errors
    ///
    /// Returns `Err(RepositoryExists)` if a repository index is already
    /// present at this location.
    async fn init_repository(&self) -> Result<()>;

    /// Loads the raw bytes of the repository index.
    async fn load_repository(&self) -> Result<Vec<u8>>;

    /// Persists the raw bytes of the repository index, overwriting any
    /// previous value.
    async fn save_repository(&self, data: &[u8]) -> Result<()>;

    /// Loads the raw bytes of the snapshot stored under `id`.
    async fn load_snapshot(&self, id: &str) -> Result<Vec<u8>>;

    /// Persists the raw bytes of a snapshot under `id`. Snapshots are
    /// write-once; callers never overwrite an existing ID.
    async fn save_snapshot(&self, id: &str, data: &[u8]) -> Result<()>;

    /// Loads the raw bytes of a stored chunk part.
    async fn load_chunk(&self, storage_filename: &str) -> Result<Vec<u8>>;

    /// Persists the raw bytes of a chunk part under `storage_filename`,
    /// returning the number of bytes actually written.
    ///
    /// Idempotent: if `storage_filename` is already present this returns
    /// `Ok(0)` without reuploading, since deduplication means the same
    /// chunk can be produced by more than one concurrent snapshot.
    async fn store_chunk(&self, storage_filename: &str, data: &[u8]) -> Result<u64>;

    /// Releases any resources held by this backend handle (open file
    /// descriptors, connections, ...). Calling any other method after
    /// `close` has returned is not guaranteed to succeed.
    async fn close(&self);
}

/// Picks a [`LocalBackend`] rooted at `url`'s path for an empty or `file`
/// scheme, following a `scheme://[user[:pass]@]host[:port]/path`
/// convention where an empty scheme means the local filesystem.
///
/// Only the local backend ships in this crate; this is a lookup keyed on [`Backend::protocols`], not a
/// class hierarchy, so adding a backend means adding an arm here.
///
/// # Errors
///
/// Returns `Err(BackendError::NotFound)` if the scheme is not `""` or
/// `"file"`.
pub fn select_local_backend(location: &str) -> Result<LocalBackend> {
    let (scheme, path) = match location.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("", location),
    };
    if scheme.is_empty() || scheme == "file" {
        Ok(LocalBackend::new(path))
    } else {
        Err(BackendError::NotFound(format!(
            "no backend registered for scheme {:?}",
            scheme
        )))
    }
}
