//! Streaming blob reassembly.
//!
//! Reconstructs a byte stream from an ordered chunk-hash list, always
//! from the explicit order persisted in the FileRecord and never from
//! storage enumeration, whose order is not guaranteed anywhere.

use std::io::{self, Read};

use bvault_store::{ChunkHash, ChunkStore, StoreError};

/// A finite, restartable-by-reopening byte stream over an ordered list
/// of chunk hashes.
///
/// Chunks are fetched from the store one at a time, only when the
/// consumer asks for their bytes: abandoning the stream early (say, a
/// client disconnecting mid-download) means trailing chunks are never
/// read. No file handles are held between reads.
///
/// With verification enabled, each chunk is re-hashed as it is read and
/// a mismatch surfaces as an [`io::ErrorKind::InvalidData`] error
/// (on-disk corruption), distinct from
/// [`io::ErrorKind::NotFound`] (missing chunk).
pub struct Assembler {
    store: ChunkStore,
    hashes: Vec<ChunkHash>,
    next: usize,
    buffer: Vec<u8>,
    pos: usize,
    verify: bool,
}

impl Assembler {
    /// Open a stream over `hashes`, in the given order.
    pub fn open(store: ChunkStore, hashes: Vec<ChunkHash>) -> Self {
        Self {
            store,
            hashes,
            next: 0,
            buffer: Vec::new(),
            pos: 0,
            verify: false,
        }
    }

    /// Enable per-chunk re-hashing on read.
    pub fn verified(mut self) -> Self {
        self.verify = true;
        self
    }

    /// Total number of chunks this stream will yield.
    pub fn chunk_count(&self) -> usize {
        self.hashes.len()
    }

    fn fetch_next(&mut self) -> io::Result<bool> {
        let Some(hash) = self.hashes.get(self.next) else {
            return Ok(false);
        };
        let result = if self.verify {
            self.store.get_verified(hash)
        } else {
            self.store.get(hash)
        };
        match result {
            Ok(bytes) => {
                self.buffer = bytes;
                self.pos = 0;
                self.next += 1;
                Ok(true)
            }
            Err(e @ StoreError::NotFound { .. }) => {
                Err(io::Error::new(io::ErrorKind::NotFound, e))
            }
            Err(e @ StoreError::HashMismatch { .. }) => {
                Err(io::Error::new(io::ErrorKind::InvalidData, e))
            }
            Err(StoreError::Io(e)) => Err(e),
        }
    }
}

impl Read for Assembler {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        // Skip zero-length chunks (none are produced by the chunker,
        // but the list is caller-supplied).
        while self.pos >= self.buffer.len() {
            if !self.fetch_next()? {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.buffer.len() - self.pos);
        buf[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
