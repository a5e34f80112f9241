//! # bvault-store
//!
//! Durable, content-addressed chunk storage for blobvault.
//!
//! Chunks are addressed by the BLAKE3 hash of their bytes and sharded
//! into prefix subdirectories to keep directory sizes bounded:
//!
//! ```text
//! <storage root>/
//! └── ab/
//!     └── abcd1234...ef.chunk
//! ```
//!
//! Writes are atomic: content goes to a uniquely named temp file first
//! and is then renamed into its final content-addressed path, so a
//! reader never observes a partially written chunk. Storing the same
//! content twice is a cheap no-op.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument};

/// BLAKE3 content hash (32 bytes). Identity for chunks and blobs.
pub type ChunkHash = [u8; 32];

/// Number of hex characters used for the shard directory name.
const SHARD_PREFIX_LEN: usize = 2;

/// Errors that can occur during chunk store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("chunk not found: {hash}")]
    NotFound { hash: String },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a [`ChunkStore::put`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The chunk was written for the first time.
    Stored,
    /// An identical chunk was already durably stored; nothing was written.
    AlreadyExists,
}

/// Compute the BLAKE3 hash of the given bytes.
#[inline]
pub fn compute_hash(data: &[u8]) -> ChunkHash {
    *blake3::hash(data).as_bytes()
}

/// Convert a hash to its lowercase hex representation.
#[inline]
pub fn hash_to_hex(hash: &ChunkHash) -> String {
    hex::encode(hash)
}

/// Parse a 64-char hex string back into a hash.
pub fn hex_to_hash(s: &str) -> Option<ChunkHash> {
    if s.len() != 64 {
        return None;
    }
    let bytes = hex::decode(s).ok()?;
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Some(hash)
}

/// Content-addressed chunk store backed by a local filesystem root.
///
/// Cheap to clone; all instances share the same on-disk namespace.
/// Writers of the same hash are made safe by atomic rename, writers of
/// different hashes never conflict. Readers take no locks.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Open a chunk store at the given root, creating it if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Path where the chunk with this hash lives (or would live).
    fn chunk_path(&self, hash: &ChunkHash) -> PathBuf {
        let hex = hash_to_hex(hash);
        self.root
            .join(&hex[..SHARD_PREFIX_LEN])
            .join(format!("{hex}.chunk"))
    }

    /// Store chunk bytes under the given hash.
    ///
    /// The hash is recomputed from `data` before anything touches disk;
    /// a caller-supplied hash that does not match the content is
    /// rejected with [`StoreError::HashMismatch`]. If the chunk already
    /// exists the call succeeds without writing.
    #[instrument(skip(self, data), level = "debug", fields(len = data.len()))]
    pub fn put(&self, hash: &ChunkHash, data: &[u8]) -> Result<PutOutcome> {
        let actual = compute_hash(data);
        if actual != *hash {
            return Err(StoreError::HashMismatch {
                expected: hash_to_hex(hash),
                actual: hash_to_hex(&actual),
            });
        }

        let path = self.chunk_path(hash);
        if path.exists() {
            return Ok(PutOutcome::AlreadyExists);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Unique temp name so concurrent writers of the same hash
        // never collide on the staging file.
        let temp_name = format!(
            "{}.tmp-{}-{:?}",
            path.file_name().unwrap_or_default().to_string_lossy(),
            std::process::id(),
            std::thread::current().id()
        );
        let temp_path = path.with_file_name(&temp_name);

        let write_result = (|| -> Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            // Another writer may have won the rename race; identical
            // content means the store is already in the desired state.
            if path.exists() {
                return Ok(PutOutcome::AlreadyExists);
            }
            return Err(StoreError::Io(e));
        }

        debug!(hash = %hash_to_hex(hash), "chunk stored");
        Ok(PutOutcome::Stored)
    }

    /// Read a chunk's bytes. Pure read, no verification.
    #[instrument(skip(self), level = "debug")]
    pub fn get(&self, hash: &ChunkHash) -> Result<Vec<u8>> {
        let path = self.chunk_path(hash);
        let mut file = File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound {
                    hash: hash_to_hex(hash),
                }
            } else {
                StoreError::Io(e)
            }
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Read a chunk and verify its bytes still hash to `hash`.
    ///
    /// Detects on-disk corruption; mismatches surface as
    /// [`StoreError::HashMismatch`], distinct from `NotFound`.
    pub fn get_verified(&self, hash: &ChunkHash) -> Result<Vec<u8>> {
        let data = self.get(hash)?;
        let actual = compute_hash(&data);
        if actual != *hash {
            return Err(StoreError::HashMismatch {
                expected: hash_to_hex(hash),
                actual: hash_to_hex(&actual),
            });
        }
        Ok(data)
    }

    /// Whether a chunk with this hash is durably stored.
    pub fn exists(&self, hash: &ChunkHash) -> bool {
        self.chunk_path(hash).exists()
    }

    /// Remove the physical chunk.
    pub fn delete(&self, hash: &ChunkHash) -> Result<()> {
        let path = self.chunk_path(hash);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                hash: hash_to_hex(hash),
            }),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the sharded layout and report chunk count and total bytes.
    ///
    /// Temp files from in-flight or aborted writes are not counted.
    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !name.ends_with(".chunk") {
                    continue;
                }
                stats.chunk_count += 1;
                stats.total_bytes += entry.metadata()?.len();
            }
        }
        Ok(stats)
    }
}

/// Aggregate statistics for a chunk store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of unique chunks stored.
    pub chunk_count: u64,
    /// Total bytes on disk (deduplicated).
    pub total_bytes: u64,
}
