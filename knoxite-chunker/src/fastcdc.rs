//! Content-defined chunking via the `fastcdc` crate, with each resulting
//! segment fingerprinted as it leaves the buffer.

use super::{Chunker, ChunkerError, Segment};
use std::io::Read;

/// Settings for a [`FastCdc`] chunker.
///
/// Limited to `usize` rather than `u64` because this implementation makes
/// extensive use of an in-memory buffer of size `max_size`.
#[derive(Clone, Copy)]
pub struct FastCdc {
    pub min_size: usize,
    pub max_size: usize,
    pub avg_size: usize,
}

impl Chunker for FastCdc {
    type Segments = FastCdcChunker;
    fn chunk_boxed(&self, read: Box<dyn Read + 'static>) -> Self::Segments {
        FastCdcChunker {
            settings: *self,
            buffer: vec![0_u8; self.max_size],
            length: 0,
            read,
            eof: false,
        }
    }
}

impl Default for FastCdc {
    fn default() -> Self {
        FastCdc {
            min_size: 32_768,
            avg_size: 65_536,
            max_size: 131_072,
        }
    }
}

pub struct FastCdcChunker {
    settings: FastCdc,
    /// Must always be kept at a size of `max_size`.
    buffer: Vec<u8>,
    /// The length of the data currently held in `buffer`.
    length: usize,
    read: Box<dyn Read + 'static>,
    eof: bool,
}

impl FastCdcChunker {
    /// Drains `count` bytes from the front of the buffer and refills it back
    /// up to `max_size` with zeros.
    ///
    /// # Panics
    ///
    /// Panics if the internal buffer's length is not `max_size`; this is an
    /// invariant the consumer of this type should never observe.
    fn drain_bytes(&mut self, count: usize) -> Result<Vec<u8>, ChunkerError> {
        assert!(self.buffer.len() == self.settings.max_size);
        if count > self.length {
            Err(ChunkerError::InternalError(format!(
                "drain_bytes count {} exceeds buffered length {}",
                count, self.length
            )))
        } else {
            let output = self.buffer.drain(..count).collect::<Vec<_>>();
            self.length -= count;
            self.buffer.resize(self.settings.max_size, 0_u8);
            Ok(output)
        }
    }

    fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Tops the buffer back up from the reader. Returns the number of bytes
    /// read; a no-op once EOF has been observed.
    fn read_bytes(&mut self) -> Result<usize, ChunkerError> {
        assert!(self.buffer.len() == self.settings.max_size);
        if self.eof {
            return Ok(0);
        }
        let mut total_bytes = 0;
        while !self.eof && self.length < self.settings.max_size {
            let bytes_read = self.read.read(&mut self.buffer[self.length..])?;
            self.length += bytes_read;
            if bytes_read == 0 {
                self.eof = true;
            }
            total_bytes += bytes_read;
        }
        Ok(total_bytes)
    }

    /// Produces the next segment's raw bytes using the fastcdc algorithm.
    ///
    /// # Errors
    ///
    /// Returns `ChunkerError::Empty` once EOF has been reached and the
    /// buffer has been fully drained.
    fn next_segment_bytes(&mut self) -> Result<Vec<u8>, ChunkerError> {
        assert_eq!(self.buffer.len(), self.settings.max_size);
        self.read_bytes()?;
        if self.is_empty() {
            return Err(ChunkerError::Empty);
        }
        let mut slicer = fastcdc::FastCDC::new(
            &self.buffer[..self.length],
            self.settings.min_size,
            self.settings.avg_size,
            self.settings.max_size,
        );
        match slicer.next() {
            Some(cut) => self.drain_bytes(cut.length),
            // Ruled out by the is_empty check above.
            None => Err(ChunkerError::Empty),
        }
    }
}

impl Iterator for FastCdcChunker {
    type Item = Result<Segment, ChunkerError>;

    fn next(&mut self) -> Option<Result<Segment, ChunkerError>> {
        match self.next_segment_bytes() {
            Ok(bytes) => Some(Ok(Segment::new(bytes))),
            Err(ChunkerError::Empty) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::io::Cursor;

    fn get_test_data() -> Vec<u8> {
        let size = 524_288;
        let mut vec = vec![0_u8; size];
        rand::thread_rng().fill_bytes(&mut vec);
        vec
    }

    #[test]
    fn one_or_more_segments() {
        let data = get_test_data();
        let cursor = Cursor::new(data);
        let chunker = FastCdc::default();
        let segments = chunker
            .chunk(cursor)
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        assert!(segments.len() > 1);
    }

    #[test]
    fn reassemble_data() {
        let data = get_test_data();
        let cursor = Cursor::new(data.clone());
        let segments = FastCdc::default()
            .chunk(cursor)
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let rebuilt: Vec<u8> = segments.into_iter().flat_map(|s| s.data).collect();
        assert_eq!(data, rebuilt);
    }

    #[test]
    fn identical_segments_and_fingerprints() {
        let data = get_test_data();
        let segments1 = FastCdc::default()
            .chunk(Cursor::new(data.clone()))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let segments2 = FastCdc::default()
            .chunk(Cursor::new(data))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(segments1, segments2);
    }

    #[test]
    fn fingerprint_matches_data() {
        let data = get_test_data();
        let segments = FastCdc::default()
            .chunk(Cursor::new(data))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        for seg in segments {
            assert_eq!(seg, Segment::new(seg.data.clone()));
        }
    }

    #[quickcheck_macros::quickcheck]
    fn chunking_is_deterministic(data: Vec<u8>) -> bool {
        if data.is_empty() {
            return true;
        }
        let first = FastCdc::default()
            .chunk(Cursor::new(data.clone()))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        let second = FastCdc::default()
            .chunk(Cursor::new(data))
            .map(|x| x.unwrap())
            .collect::<Vec<_>>();
        first == second
    }

    #[quickcheck_macros::quickcheck]
    fn segments_reassemble_to_the_original_bytes(data: Vec<u8>) -> bool {
        if data.is_empty() {
            return true;
        }
        let rebuilt = FastCdc::default()
            .chunk(Cursor::new(data.clone()))
            .map(|x| x.unwrap().data)
            .flatten()
            .collect::<Vec<u8>>();
        rebuilt == data
    }
}
