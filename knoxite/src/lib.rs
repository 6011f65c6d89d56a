//! The knoxite backup engine: an encrypted, deduplicating, content-addressed
//! archive format, and the storage/chunking/build/restore machinery that
//! reads and writes it.
//!
//! A [`repository::Repository`] owns a [`backend::Backend`] handle and a
//! symmetric [`knoxite_core::envelope::Key`] recovered from a passphrase. A
//! [`chunk_store::ChunkStore`] mediates every chunk read/write against that
//! backend, deduplicating by content fingerprint. [`builder::SnapshotBuilder`]
//! walks a source tree through a chunk store to produce a
//! [`knoxite_core::model::Snapshot`]; [`restorer::SnapshotRestorer`] walks one
//! back out onto a filesystem.

pub mod backend;
pub mod builder;
pub mod chunk_store;
pub mod repository;
pub mod restorer;

pub use backend::{select_local_backend, Backend, BackendError, LocalBackend, MemoryBackend};
pub use builder::{BuilderConfig, BuilderError, SnapshotBuilder};
pub use chunk_store::{ChunkStore, ChunkStoreConfig, ChunkStoreError};
pub use repository::{Repository, RepositoryError};
pub use restorer::{RestorerConfig, RestorerError, SnapshotRestorer};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
