//! Mediates between the chunker and the [`Backend`]: deduplicates by
//! fingerprint (via the backend's idempotent `store_chunk` contract),
//! splits oversized segments into equal-sized parts, compresses and seals
//! each part, and serializes concurrent store requests across a bounded
//! worker pool.
//!
//! No separate index is needed to detect duplicates -- the backend
//! interface already guarantees `store_chunk` is idempotent -- so this
//! store only has to own a retry policy for transient backend failures
//! before surfacing a hard error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use knoxite_core::envelope::{Envelope, EnvelopeError, Key};
use knoxite_core::model::ChunkRef;
use knoxite_core::wire::{open_bytes, seal_bytes, WireError};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, trace, warn};

use crate::backend::{Backend, BackendError};

/// A segment above this size (pre-compression, pre-encryption) is split
/// into equal-sized parts before being sealed and stored. Matches the
/// spec's 1 MiB design target.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1 << 20;

const STORE_RETRY_ATTEMPTS: u32 = 3;
const STORE_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ChunkStoreError {
    #[error("backend error storing chunk: {0}")]
    StoreChunkFailed(BackendError),
    #[error("backend error loading chunk: {0}")]
    LoadChunkFailed(BackendError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("decrypted chunk sha256 {actual} does not match expected {expected}")]
    ChunkCorrupt { expected: String, actual: String },
    #[error("a background chunk task panicked")]
    WorkerPanicked,
}

pub type Result<T> = std::result::Result<T, ChunkStoreError>;

/// A one-byte tag prefixed to chunk plaintext before sealing, so `get`
/// knows whether to zstd-decompress the recovered bytes. The original Go
/// source plumbed a `compression-level` parameter through `Add` without
/// ever applying it; this restores that layer, between chunking and sealing.
#[repr(u8)]
enum CompressionTag {
    None = 0,
    Zstd = 1,
}

/// Configuration for a [`ChunkStore`]. Explicit and passed to the
/// constructor -- no global/CLI-options singleton.
#[derive(Clone, Copy, Debug)]
pub struct ChunkStoreConfig {
    /// Maximum number of concurrent `store_chunk`/`load_chunk` calls.
    pub concurrency: usize,
    /// Segments above this size are split into equal parts before storage.
    pub max_chunk_size: usize,
    /// `0` disables compression; any positive value is a zstd level.
    pub compression_level: i32,
}

impl Default for ChunkStoreConfig {
    fn default() -> Self {
        ChunkStoreConfig {
            concurrency: num_cpus::get().max(1),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            compression_level: 0,
        }
    }
}

/// Mediates between the chunker and a [`Backend`] handle.
///
/// Cheap to clone: the backend handle, key, and a shared concurrency
/// semaphore are all reference-counted or `Copy`.
#[derive(Clone)]
pub struct ChunkStore<B> {
    backend: B,
    key: Key,
    envelope: Envelope,
    config: ChunkStoreConfig,
    permits: Arc<Semaphore>,
    dedup_hits: Arc<AtomicU64>,
}

impl<B: Backend + 'static> ChunkStore<B> {
    pub fn new(backend: B, key: Key, envelope: Envelope, config: ChunkStoreConfig) -> ChunkStore<B> {
        ChunkStore {
            backend,
            key,
            envelope,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            dedup_hits: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of parts that turned out to already be present in the
    /// backend across this store's lifetime. Diagnostic only; not part of
    /// the data model's `Stats`.
    pub fn dedup_hits(&self) -> u64 {
        self.dedup_hits.load(Ordering::Relaxed)
    }

    /// Seals and stores one content-defined segment, splitting it into
    /// equal-sized parts first if it exceeds `max_chunk_size`.
    ///
    /// Parts are stored concurrently (bounded by `concurrency`), but the
    /// returned `ChunkRef` list always preserves original part order.
    ///
    /// Returns the ordered `ChunkRef`s and the total post-compression,
    /// post-encryption byte length actually stored on the wire for every
    /// part (the item's `storage_size` contribution), regardless of
    /// whether a given part turned out to already be present.
    #[instrument(skip(self, sha_sum, plaintext), fields(sha_sum = %sha_sum))]
    pub async fn put(&self, sha_sum: &str, plaintext: &[u8]) -> Result<(Vec<ChunkRef>, u64)> {
        let parts = split_parts(plaintext, self.config.max_chunk_size);
        let total_parts = parts.len() as u32;

        let mut handles = Vec::with_capacity(parts.len());
        for (part, chunk) in parts.into_iter().enumerate() {
            let store = self.clone();
            let sha_sum = sha_sum.to_string();
            handles.push(tokio::spawn(async move {
                store.put_part(sha_sum, part as u32, total_parts, chunk).await
            }));
        }

        let mut refs = Vec::with_capacity(handles.len());
        let mut storage_size = 0_u64;
        for handle in handles {
            let (chunk_ref, sealed_len) = handle.await.map_err(|_| ChunkStoreError::WorkerPanicked)??;
            storage_size += sealed_len;
            refs.push(chunk_ref);
        }
        Ok((refs, storage_size))
    }

    async fn put_part(
        &self,
        sha_sum: String,
        part: u32,
        total_parts: u32,
        plaintext: Vec<u8>,
    ) -> Result<(ChunkRef, u64)> {
        let _permit = self.permits.acquire().await.expect("semaphore not closed");
        let chunk_ref = ChunkRef::new(sha_sum, part, total_parts);
        let filename = chunk_ref.storage_filename();

        let sealed = self.seal_plaintext(&plaintext);
        let sealed_len = sealed.len() as u64;
        let written = retry_backend(
            || {
                let backend = self.backend.clone();
                let filename = filename.clone();
                let sealed = sealed.clone();
                async move { backend.store_chunk(&filename, &sealed).await }
            },
            ChunkStoreError::StoreChunkFailed,
        )
        .await?;

        if written == 0 {
            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
            trace!(filename = %filename, "chunk already present, deduplicated");
        } else {
            debug!(filename = %filename, bytes = written, "stored new chunk part");
        }
        Ok((chunk_ref, sealed_len))
    }

    /// Loads, decrypts, decompresses, and fingerprint-verifies one chunk
    /// part.
    ///
    /// # Errors
    ///
    /// Returns `Err(ChunkCorrupt)` if the recovered plaintext's SHA-256
    /// does not match `chunk_ref.sha_sum` -- defence in depth beyond the
    /// AEAD tag check already performed while opening the envelope.
    #[instrument(skip(self, chunk_ref), fields(sha_sum = %chunk_ref.sha_sum, part = chunk_ref.part))]
    pub async fn get(&self, chunk_ref: &ChunkRef) -> Result<Vec<u8>> {
        let _permit = self.permits.acquire().await.expect("semaphore not closed");
        let filename = chunk_ref.storage_filename();
        let sealed = retry_backend(
            || {
                let backend = self.backend.clone();
                let filename = filename.clone();
                async move { backend.load_chunk(&filename).await }
            },
            ChunkStoreError::LoadChunkFailed,
        )
        .await?;

        let plaintext = self.open_plaintext(&sealed)?;

        let mut hasher = Sha256::new();
        hasher.update(&plaintext);
        let actual = hex::encode(hasher.finalize());
        if actual != chunk_ref.sha_sum {
            warn!(expected = %chunk_ref.sha_sum, %actual, "chunk fingerprint mismatch");
            return Err(ChunkStoreError::ChunkCorrupt {
                expected: chunk_ref.sha_sum.clone(),
                actual,
            });
        }
        Ok(plaintext)
    }

    fn seal_plaintext(&self, plaintext: &[u8]) -> Vec<u8> {
        let (tag, body) = if self.config.compression_level > 0 {
            let compressed = zstd::encode_all(plaintext, self.config.compression_level)
                .expect("zstd compression of an in-memory buffer should not fail");
            (CompressionTag::Zstd, compressed)
        } else {
            (CompressionTag::None, plaintext.to_vec())
        };
        let mut framed = Vec::with_capacity(body.len() + 1);
        framed.push(tag as u8);
        framed.extend_from_slice(&body);
        seal_bytes(&self.key, self.envelope, &framed)
    }

    /// An AEAD tag failure is surfaced as the bare `Envelope` variant rather
    /// than wrapped in `Wire`, so it is distinguishable from a truncated or
    /// version-mismatched frame. The restorer treats it as an abort (see
    /// `restorer::run_restore`), unlike `ChunkCorrupt`, which recovers
    /// per-file: a flipped bit fails the tag check here, before the sha256
    /// fingerprint is ever computed, so a tampered chunk never reaches the
    /// `ChunkCorrupt` path at all.
    fn open_plaintext(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let framed = match open_bytes(&self.key, sealed) {
            Ok(framed) => framed,
            Err(WireError::Envelope(e)) => return Err(ChunkStoreError::Envelope(e)),
            Err(e) => return Err(e.into()),
        };
        let (tag, body) = framed.split_first().ok_or(ChunkStoreError::ChunkCorrupt {
            expected: String::new(),
            actual: String::new(),
        })?;
        match *tag {
            0 => Ok(body.to_vec()),
            1 => Ok(zstd::decode_all(body).expect("zstd decompression of a sealed chunk should not fail")),
            _ => Ok(body.to_vec()),
        }
    }
}

/// Splits `data` into `ceil(len / max_size)` equal-sized parts. A segment
/// at or under `max_size` yields a single part (`total_parts = 1`).
fn split_parts(data: &[u8], max_size: usize) -> Vec<Vec<u8>> {
    if data.len() <= max_size || max_size == 0 {
        return vec![data.to_vec()];
    }
    let total_parts = (data.len() + max_size - 1) / max_size;
    let part_size = (data.len() + total_parts - 1) / total_parts;
    data.chunks(part_size).map(|c| c.to_vec()).collect()
}

/// Retries a fallible backend call up to [`STORE_RETRY_ATTEMPTS`] times
/// with exponential backoff.
///
/// A `NotFound` is a permanent miss, not a transient failure, so it fails
/// fast on the first attempt instead of being retried.
async fn retry_backend<T, F, Fut, E>(mut call: F, wrap: E) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, BackendError>>,
    E: Fn(BackendError) -> ChunkStoreError,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err @ BackendError::NotFound(_)) => return Err(wrap(err)),
            Err(err) if attempt + 1 < STORE_RETRY_ATTEMPTS => {
                attempt += 1;
                let delay = STORE_RETRY_BASE_DELAY * 2_u32.pow(attempt - 1);
                warn!(attempt, error = %err, "retrying backend call after delay");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(wrap(err)),
        }
    }
}
