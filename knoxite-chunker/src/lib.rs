//! Splits a byte stream into an ordered sequence of content-defined
//! segments, each tagged with the SHA-256 fingerprint of its plaintext.
//!
//! Chunking is deterministic: the same input, chunked with the same
//! [`fastcdc::FastCdc`] settings, produces the same ordered list of
//! [`Segment`]s with the same fingerprints on any run or machine. Whether an
//! oversized segment is split into equal-sized parts for storage is a
//! concern of the chunk store, not of this crate.

pub mod fastcdc;

pub use self::fastcdc::*;

use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::io;
use std::io::{Cursor, Read};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("I/O error while reading the source stream")]
    IOError(#[from] io::Error),
    #[error("internal chunker error: {0}")]
    InternalError(String),
    #[error("chunker incorrectly applied to empty data")]
    Empty,
}

/// One content-defined segment of a chunked byte stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub data: Vec<u8>,
    /// Lower-case hex-encoded SHA-256 of `data`.
    pub sha_sum: String,
}

impl Segment {
    fn new(data: Vec<u8>) -> Segment {
        let mut hasher = Sha256::new();
        hasher.update(&data);
        let digest = hasher.finalize();
        let mut sha_sum = String::with_capacity(64);
        for b in digest {
            write!(sha_sum, "{:02x}", b).expect("writing to a String cannot fail");
        }
        Segment { data, sha_sum }
    }
}

/// Describes something that can split a byte stream into segments in a
/// repeatable manner.
///
/// Chunkers must meet three properties:
/// 1. data is split into one or more segments;
/// 2. concatenating the segments' data reproduces the original bytes
///    exactly;
/// 3. the same data and settings produce the same segments every time.
///
/// As in the chunking pipeline this was adapted from, implementations take a
/// boxed `Read` rather than an existential type, and are expected to be
/// `Clone` with minimal overhead (a handful of size settings).
pub trait Chunker: Clone {
    type Segments: Iterator<Item = Result<Segment, ChunkerError>>;

    /// Core method: chunks a boxed owned `Read` into an iterator of
    /// fingerprinted segments.
    fn chunk_boxed(&self, read: Box<dyn Read + 'static>) -> Self::Segments;

    /// Convenience wrapper that boxes a bare `Read` for you.
    fn chunk<R: Read + 'static>(&self, read: R) -> Self::Segments {
        let boxed: Box<dyn Read + 'static> = Box::new(read);
        self.chunk_boxed(boxed)
    }

    /// Convenience wrapper for in-memory data.
    fn chunk_slice<R: AsRef<[u8]> + 'static>(&self, slice: R) -> Self::Segments {
        let cursor = Cursor::new(slice);
        let boxed: Box<dyn Read + 'static> = Box::new(cursor);
        self.chunk_boxed(boxed)
    }
}
