//! The top-level encrypted aggregate: holds the ordered list of [`Volume`]
//! descriptors, persists the signed/encrypted index, and owns the backend
//! handle.
//!
//! Opening a repository succeeds iff decrypting the repository verifier
//! with the password-derived key yields the known plaintext -- this is the
//! sole authentication signal.
//!
//! The persisted index (`{version, repo_id, key, verifier, volumes[]}`) is
//! *not* itself wrapped in a further AEAD envelope: `EncryptedKey` already
//! seals the repository's symmetric key under a passphrase-derived KEK
//! (with its own Argon2 salt carried alongside, as salts need not be
//! secret), and the verifier ciphertext is already sealed under that
//! symmetric key. Nothing else in the index needs confidentiality beyond
//! what those two fields already provide, so it round-trips as plain JSON
//! through the backend. This choice is recorded in `DESIGN.md`.

use std::collections::HashSet;

use knoxite_core::envelope::{EncryptedKey, Envelope, EnvelopeError, Key};
use knoxite_core::model::{
    DuplicateSnapshotError, RepositoryIndex, Snapshot, Volume, REPOSITORY_VERSION,
    VERIFIER_PLAINTEXT,
};
use knoxite_core::wire::{open_record, seal_record, WireError};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::backend::{Backend, BackendError, REPOSITORY_INDEX_KEY};

/// Minimum number of hex characters a snapshot ID prefix must supply to
/// [`Repository::find_snapshot`].
pub const MIN_SNAPSHOT_PREFIX_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("a repository already exists at this location")]
    RepositoryExists,
    #[error("wrong password")]
    WrongPassword,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("no volume found for id {0:?}")]
    VolumeNotFound(String),
    #[error("no snapshot found for prefix {0:?}")]
    SnapshotNotFound(String),
    #[error("snapshot id prefix {0:?} matches more than one snapshot")]
    AmbiguousSnapshotID(String),
    #[error("snapshot id prefix must be at least {MIN_SNAPSHOT_PREFIX_LEN} hex characters")]
    PrefixTooShort,
    #[error(transparent)]
    Duplicate(#[from] DuplicateSnapshotError),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// The top-level aggregate: volumes, their snapshots, and the backend handle.
///
/// Exclusively owns the backend handle for its lifetime;
/// workers spawned by the builder/restorer only ever see a cloned,
/// non-owning handle to the same backend.
pub struct Repository<B> {
    backend: B,
    key: Key,
    envelope: Envelope,
    index: RepositoryIndex,
}

impl<B: Backend + 'static> Repository<B> {
    /// Creates a new repository at `backend`'s location, sealed under
    /// `password`.
    ///
    /// # Errors
    ///
    /// Returns `Err(RepositoryExists)` if a repository index is already
    /// present at this location.
    #[instrument(skip(backend, password))]
    pub async fn new(backend: B, password: &[u8]) -> Result<Repository<B>> {
        match backend.init_repository().await {
            Ok(()) => {}
            Err(BackendError::RepositoryExists) => return Err(RepositoryError::RepositoryExists),
            Err(e) => return Err(e.into()),
        }

        let key = Key::random();
        let encrypted_key = EncryptedKey::encrypt_defaults(&key, password);
        let envelope = Envelope::default();
        let (verifier_nonce, verifier_ciphertext) = envelope.seal(&key, VERIFIER_PLAINTEXT);

        let index = RepositoryIndex {
            version: REPOSITORY_VERSION,
            repo_id: Uuid::new_v4(),
            creation_time: Utc::now(),
            key: encrypted_key,
            verifier_nonce,
            verifier_ciphertext,
            volumes: Vec::new(),
        };

        let repo = Repository {
            backend,
            key,
            envelope,
            index,
        };
        repo.save().await?;
        info!(repo_id = %repo.index.repo_id, "created repository");
        Ok(repo)
    }

    /// Opens an existing repository, authenticating `password` against the
    /// stored verifier.
    ///
    /// # Errors
    ///
    /// Returns `Err(WrongPassword)` if the password does not recover the
    /// repository key, or if the verifier fails to decrypt under it. No
    /// other data is decrypted before this check passes.
    #[instrument(skip(backend, password))]
    pub async fn open(backend: B, password: &[u8]) -> Result<Repository<B>> {
        let bytes = backend.load_repository().await?;
        let index: RepositoryIndex = serde_json::from_slice(&bytes).map_err(WireError::from)?;

        let key = index
            .key
            .decrypt(password)
            .map_err(|_| RepositoryError::WrongPassword)?;

        let envelope = Envelope::default();
        envelope
            .open(&key, &index.verifier_nonce, &index.verifier_ciphertext)
            .map_err(|_: EnvelopeError| RepositoryError::WrongPassword)?;

        info!(repo_id = %index.repo_id, "opened repository");
        Ok(Repository {
            backend,
            key,
            envelope,
            index,
        })
    }

    /// Persists the current index to the backend, overwriting any previous
    /// value.
    #[instrument(skip(self))]
    pub async fn save(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.index).expect("RepositoryIndex always serializes");
        self.backend.save_repository(&bytes).await?;
        Ok(())
    }

    /// The repository's stable opaque identifier.
    pub fn id(&self) -> Uuid {
        self.index.repo_id
    }

    /// The repository's derived symmetric key, used by the chunk store and
    /// the snapshot builder/restorer to seal chunks and snapshot records.
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn envelope(&self) -> Envelope {
        self.envelope
    }

    /// A non-owning handle to the backend this repository is rooted at, for
    /// use by the chunk store / builder / restorer.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Appends `volume` to the repository's index. Does not persist; call
    /// [`Repository::save`] afterwards.
    #[instrument(skip(self, volume), fields(volume_id = %volume.id))]
    pub fn add_volume(&mut self, volume: Volume) {
        self.index.volumes.push(volume);
    }

    /// Looks up a volume by its exact ID.
    pub fn find_volume(&self, id: &str) -> Result<&Volume> {
        self.index
            .volumes
            .iter()
            .find(|v| v.id == id)
            .ok_or_else(|| RepositoryError::VolumeNotFound(id.to_string()))
    }

    /// Looks up a volume by its exact ID, for mutation (e.g. appending a
    /// newly-saved snapshot).
    pub fn find_volume_mut(&mut self, id: &str) -> Result<&mut Volume> {
        self.index
            .volumes
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| RepositoryError::VolumeNotFound(id.to_string()))
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.index.volumes
    }

    /// Resolves an unambiguous snapshot ID prefix across all volumes to
    /// its full snapshot ID.
    ///
    /// # Errors
    ///
    /// Returns `Err(PrefixTooShort)` if `prefix` is shorter than
    /// [`MIN_SNAPSHOT_PREFIX_LEN`], `Err(SnapshotNotFound)` if no snapshot
    /// ID starts with `prefix`, or `Err(AmbiguousSnapshotID)` if more than
    /// one does.
    pub fn resolve_snapshot_prefix(&self, prefix: &str) -> Result<String> {
        if prefix.len() < MIN_SNAPSHOT_PREFIX_LEN {
            return Err(RepositoryError::PrefixTooShort);
        }
        let matches: HashSet<&str> = self
            .index
            .volumes
            .iter()
            .flat_map(|v| v.snapshots.iter())
            .map(String::as_str)
            .filter(|id| id.starts_with(prefix))
            .collect();
        match matches.len() {
            0 => Err(RepositoryError::SnapshotNotFound(prefix.to_string())),
            1 => Ok((*matches.iter().next().unwrap()).to_string()),
            _ => Err(RepositoryError::AmbiguousSnapshotID(prefix.to_string())),
        }
    }

    /// Resolves `prefix` to a snapshot ID, then loads and opens the
    /// corresponding sealed snapshot record from the backend.
    #[instrument(skip(self))]
    pub async fn find_snapshot(&self, prefix: &str) -> Result<Snapshot> {
        let id = self.resolve_snapshot_prefix(prefix)?;
        let bytes = self
            .backend
            .load_snapshot(&id)
            .await
            .map_err(|_| RepositoryError::SnapshotNotFound(id.clone()))?;
        let snapshot = open_record(&self.key, &bytes)?;
        Ok(snapshot)
    }

    /// Seals `snapshot` under the repository key and persists it via the
    /// backend. Does not append it to any volume; callers do that
    /// separately with [`Repository::find_volume_mut`] and
    /// `Volume::add_snapshot`, then call [`Repository::save`].
    #[instrument(skip(self, snapshot), fields(snapshot_id = %snapshot.id))]
    pub async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = seal_record(&self.key, self.envelope, snapshot);
        self.backend.save_snapshot(&snapshot.id, &bytes).await?;
        Ok(())
    }

    /// Releases the backend handle. Callers must ensure any
    /// builder/restorer workers borrowing this repository's backend have
    /// quiesced first.
    pub async fn close(self) {
        self.backend.close().await;
    }
}
