/*!
The data model: the `Repository` index, `Volume`, `Snapshot`, `Item`, and
`ChunkRef` records described in the repository/snapshot/chunk engine's data
model, plus the `Stats` counters accumulated while building or restoring a
snapshot.

These are plain, serializable records with no knowledge of any backend or
encryption key; sealing and persisting them is the job of [`crate::wire`]
and the `knoxite` crate's `Repository`/`Backend` types.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::envelope::EncryptedKey;

/// The current on-disk version of the repository index record.
pub const REPOSITORY_VERSION: u16 = 1;

/// A reference to one (possibly partial) stored chunk.
///
/// `sha_sum` is the hex-encoded SHA-256 of the pre-encryption plaintext.
/// For chunks split into parts by the chunk store, all `ChunkRef`s sharing a
/// `sha_sum` agree on `total_parts`, and `part` ranges `0..total_parts`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub sha_sum: String,
    pub part: u32,
    pub total_parts: u32,
}

impl ChunkRef {
    pub fn new(sha_sum: String, part: u32, total_parts: u32) -> ChunkRef {
        ChunkRef {
            sha_sum,
            part,
            total_parts,
        }
    }

    /// The literal filename a filesystem-like backend stores this chunk
    /// part under: `<sha>.<part>_<total_parts>`.
    pub fn storage_filename(&self) -> String {
        format!("{}.{}_{}", self.sha_sum, self.part, self.total_parts)
    }
}

/// What kind of filesystem entry an [`Item`] describes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemType {
    File,
    Directory,
    SymLink,
}

/// One filesystem entry inside a [`Snapshot`].
///
/// `path` is a relative, forward-slash, NFC-normalized path with no leading
/// slash. `chunks` is empty for directories and symlinks. `size` is the
/// logical (pre-encryption, pre-compression) size in bytes; `storage_size`
/// is the sum of the stored (post-compression, post-encryption) chunk part
/// sizes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Item {
    pub path: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub modification_time: DateTime<Utc>,
    pub size: u64,
    pub storage_size: u64,
    pub chunks: Vec<ChunkRef>,
    /// Present only for `ItemType::SymLink`.
    pub symlink_target: Option<String>,
}

impl Item {
    pub fn new_directory(path: String, mode: u32, uid: u32, gid: u32, mtime: DateTime<Utc>) -> Item {
        Item {
            path,
            item_type: ItemType::Directory,
            mode,
            uid,
            gid,
            modification_time: mtime,
            size: 0,
            storage_size: 0,
            chunks: Vec::new(),
            symlink_target: None,
        }
    }

    pub fn new_symlink(
        path: String,
        target: String,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: DateTime<Utc>,
    ) -> Item {
        Item {
            path,
            item_type: ItemType::SymLink,
            mode,
            uid,
            gid,
            modification_time: mtime,
            size: 0,
            storage_size: 0,
            chunks: Vec::new(),
            symlink_target: Some(target),
        }
    }

    pub fn new_file(
        path: String,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: DateTime<Utc>,
        size: u64,
        storage_size: u64,
        chunks: Vec<ChunkRef>,
    ) -> Item {
        Item {
            path,
            item_type: ItemType::File,
            mode,
            uid,
            gid,
            modification_time: mtime,
            size,
            storage_size,
            chunks,
            symlink_target: None,
        }
    }
}

/// Counters accumulated while building or restoring a snapshot.
///
/// Monotonically increasing; zero at construction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub size: u64,
    pub storage_size: u64,
    pub errors: u64,
}

impl Stats {
    pub fn add(&mut self, other: Stats) {
        self.files += other.files;
        self.dirs += other.dirs;
        self.symlinks += other.symlinks;
        self.size += other.size;
        self.storage_size += other.storage_size;
        self.errors += other.errors;
    }

    pub fn add_item(&mut self, item: &Item) {
        self.size += item.size;
        self.storage_size += item.storage_size;
        match item.item_type {
            ItemType::File => self.files += 1,
            ItemType::Directory => self.dirs += 1,
            ItemType::SymLink => self.symlinks += 1,
        }
    }
}

/// Prettifies a byte count into the largest unit it cleanly fits, mirroring
/// the original `SizeToString` helper.
pub fn size_to_string(size: u64) -> String {
    let b = size as f64;
    match size {
        s if s >= 1 << 60 => format!("{:.3} EiB", b / (1u64 << 60) as f64),
        s if s >= 1 << 50 => format!("{:.3} PiB", b / (1u64 << 50) as f64),
        s if s >= 1 << 40 => format!("{:.3} TiB", b / (1u64 << 40) as f64),
        s if s >= 1 << 30 => format!("{:.3} GiB", b / (1u64 << 30) as f64),
        s if s >= 1 << 20 => format!("{:.3} MiB", b / (1u64 << 20) as f64),
        s if s >= 1 << 10 => format!("{:.3} KiB", b / (1u64 << 10) as f64),
        _ => format!("{}B", size),
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files, {} dirs, {} symlinks, {} errors, {} original size, {} storage size",
            self.files,
            self.dirs,
            self.symlinks,
            self.errors,
            size_to_string(self.size),
            size_to_string(self.storage_size)
        )
    }
}

/// An immutable record of a filesystem tree at one point in time.
///
/// Once [`crate::wire::seal_record`]ed and written via `SaveSnapshot`, a
/// `Snapshot`'s byte representation does not change; it is referenced from
/// exactly one [`Volume`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub creation_date: DateTime<Utc>,
    pub description: String,
    pub stats: Stats,
    pub items: Vec<Item>,
}

impl Snapshot {
    pub fn new(id: String, description: String) -> Snapshot {
        Snapshot {
            id,
            creation_date: Utc::now(),
            description,
            stats: Stats::default(),
            items: Vec::new(),
        }
    }
}

/// A named, ordered collection of snapshots within a repository.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub description: String,
    pub snapshots: Vec<String>,
}

impl Volume {
    pub fn new(id: String, name: String, description: String) -> Volume {
        Volume {
            id,
            name,
            description,
            snapshots: Vec::new(),
        }
    }

    /// Appends a snapshot ID to this volume.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the snapshot ID is already present in this volume.
    pub fn add_snapshot(&mut self, snapshot_id: String) -> Result<(), DuplicateSnapshotError> {
        if self.snapshots.contains(&snapshot_id) {
            return Err(DuplicateSnapshotError(snapshot_id));
        }
        self.snapshots.push(snapshot_id);
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("snapshot {0} is already present in this volume")]
pub struct DuplicateSnapshotError(pub String);

/// The repository's persisted index: everything needed to open the
/// repository and find its volumes, sealed as a single record under
/// `repository.knox` (or the backend's equivalent well-known key).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryIndex {
    pub version: u16,
    pub repo_id: Uuid,
    pub creation_time: DateTime<Utc>,
    /// The repository symmetric key, encrypted with a key derived from the
    /// user's passphrase. Carries its own Argon2 salt.
    pub key: EncryptedKey,
    /// A known plaintext sealed with the repository key. Successfully
    /// opening this on `Open` is the sole authentication signal.
    pub verifier_nonce: Vec<u8>,
    pub verifier_ciphertext: Vec<u8>,
    pub volumes: Vec<Volume>,
}

/// The known plaintext sealed into `verifier_ciphertext`.
pub const VERIFIER_PLAINTEXT: &[u8] = b"knoxite-repository-verifier";
