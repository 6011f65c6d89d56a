/*!
This crate contains the data structures and cryptographic primitives shared
by every layer of a knoxite repository: the `Repository`/`Volume`/
`Snapshot`/`Item` aggregate (see [`model`]), and the key derivation + AEAD
sealing envelope that every persisted record is wrapped in (see [`envelope`]
and [`wire`]).

Nothing in this crate performs I/O. Backends, the chunker, and the streaming
builder/restorer pipeline live in the `knoxite` crate, which depends on this
one.

When a data structure in this crate has a `Serialize`/`Deserialize` derive,
the JSON produced by `serde_json` with its canonical field names is the
authoritative on-disk representation of that struct, per the wire format
described in `wire`.
*/

#![warn(clippy::all)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]

pub mod envelope;
pub mod model;
pub mod wire;

pub use envelope::{EncryptedKey, Envelope, EnvelopeError, Key};
pub use model::{ChunkRef, Item, ItemType, Snapshot, Stats, Volume};
pub use model::{DuplicateSnapshotError, RepositoryIndex, REPOSITORY_VERSION, VERIFIER_PLAINTEXT};
pub use wire::{open_bytes, open_record, seal_bytes, seal_record, WireError};
