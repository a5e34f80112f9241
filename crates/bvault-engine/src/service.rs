//! Blob-level orchestration: upload, download, delete.

use std::io::Read;
use std::sync::Arc;

use tracing::{debug, info, warn};

use bvault_store::{hash_to_hex, ChunkHash, ChunkStore, StoreError};

use crate::assemble::Assembler;
use crate::cancel::CancelToken;
use crate::chunker::{ChunkRef, Chunker, EngineConfig};
use crate::dedup::DedupIndex;
use crate::meta::{FileRecord, MetadataRepository};
use crate::{EngineError, Result};

/// Aggregate content hash of a blob: the hash of its ordered chunk
/// digests, concatenated raw. Deterministic for identical bytes and
/// identical chunk size; zero chunks hash the empty sequence.
pub fn aggregate_hash(chunks: &[ChunkRef]) -> ChunkHash {
    let mut hasher = blake3::Hasher::new();
    for chunk in chunks {
        hasher.update(&chunk.hash);
    }
    *hasher.finalize().as_bytes()
}

/// Result of a completed upload.
///
/// `already_existed` is a success flag, not an error: the content was
/// already present as a blob and the redundant acquisitions were handed
/// back.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub id: String,
    pub content_hash: String,
    pub total_size: u64,
    pub already_existed: bool,
}

/// Ties chunker, dedup index, chunk store and metadata repository
/// together behind the caller-facing upload / download / delete
/// operations.
pub struct BlobService {
    store: ChunkStore,
    dedup: Arc<DedupIndex>,
    meta: Arc<dyn MetadataRepository>,
    config: EngineConfig,
}

impl BlobService {
    pub fn new(store: ChunkStore, meta: Arc<dyn MetadataRepository>, config: EngineConfig) -> Self {
        let dedup = Arc::new(DedupIndex::new(store.clone()));
        Self {
            store,
            dedup,
            meta,
            config,
        }
    }

    /// Ingest a byte stream as a named blob.
    ///
    /// The stream is chunked and stored through the worker pool, the
    /// aggregate hash computed, and a FileRecord persisted. If an
    /// identical blob already exists, this call's chunk acquisitions
    /// are released instead and the existing record's id is returned
    /// with `already_existed = true`.
    pub fn upload<R: Read>(
        &self,
        display_name: &str,
        reader: R,
        cancel: &CancelToken,
    ) -> Result<UploadOutcome> {
        let chunker = Chunker::new(Arc::clone(&self.dedup), self.config.clone());
        let chunks = chunker.split(reader, cancel)?;

        let content_hash = aggregate_hash(&chunks);
        let content_hex = hash_to_hex(&content_hash);
        let total_size = chunks.iter().map(|c| c.size).sum();

        let existing = match self.meta.get_by_content_hash(&content_hex) {
            Ok(existing) => existing,
            Err(e) => {
                self.release_chunks(&chunks);
                return Err(e);
            }
        };
        if let Some(existing) = existing {
            // Identical blob already on record. The chunk level already
            // collapsed the bytes; hand back what this call took.
            self.release_chunks(&chunks);
            info!(content_hash = %content_hex, id = %existing.id, "upload deduplicated at blob level");
            return Ok(UploadOutcome {
                id: existing.id,
                content_hash: content_hex,
                total_size,
                already_existed: true,
            });
        }

        let record = FileRecord::new(display_name, &content_hash, &chunks);
        let outcome = UploadOutcome {
            id: record.id.clone(),
            content_hash: content_hex,
            total_size,
            already_existed: false,
        };
        if let Err(e) = self.meta.create(record) {
            self.release_chunks(&chunks);
            return Err(e);
        }
        debug!(id = %outcome.id, chunks = chunks.len(), size = total_size, "upload committed");
        Ok(outcome)
    }

    /// Open a byte stream over the blob behind `id`.
    pub fn download(&self, id: &str) -> Result<Assembler> {
        let record = self
            .meta
            .get_by_id(id)?
            .ok_or_else(|| EngineError::NotFound(format!("file record {id}")))?;
        let hashes = record.chunk_hashes()?;
        let assembler = Assembler::open(self.store.clone(), hashes);
        Ok(if self.config.verify_reads {
            assembler.verified()
        } else {
            assembler
        })
    }

    /// Delete the blob behind `id`: release every referenced chunk,
    /// then drop the record. Chunk storage is freed as refcounts reach
    /// zero.
    pub fn delete(&self, id: &str) -> Result<()> {
        let record = self
            .meta
            .get_by_id(id)?
            .ok_or_else(|| EngineError::NotFound(format!("file record {id}")))?;

        for hash in record.chunk_hashes()? {
            match self.dedup.release(&hash) {
                Ok(_) => {}
                Err(EngineError::NotFound(_)) => {
                    // Untracked reference, e.g. a record that was never
                    // restored into this index. The end state holds.
                    warn!(hash = %hash_to_hex(&hash), "release of untracked chunk reference");
                }
                Err(e) => return Err(e),
            }
        }
        self.meta.delete(&record.id)?;
        info!(id = %record.id, "blob deleted");
        Ok(())
    }

    /// Re-take the chunk references a persisted record owns, for use
    /// with durable metadata backends after a process restart. Chunks
    /// already on disk are verified, not rewritten; a chunk whose bytes
    /// no longer match its hash is reported as corrupt rather than
    /// adopted.
    pub fn restore(&self, record: &FileRecord) -> Result<()> {
        for hash in record.chunk_hashes()? {
            let store = self.store.clone();
            self.dedup.acquire(hash, move || {
                store.get_verified(&hash).map_err(|e| match e {
                    StoreError::HashMismatch { expected, .. } => {
                        EngineError::Corrupt { hash: expected }
                    }
                    other => other.into(),
                })
            })?;
        }
        Ok(())
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn dedup(&self) -> &DedupIndex {
        &self.dedup
    }

    fn release_chunks(&self, chunks: &[ChunkRef]) {
        for chunk in chunks {
            if let Err(e) = self.dedup.release(&chunk.hash) {
                warn!(hash = %hash_to_hex(&chunk.hash), error = %e, "release failed during rollback");
            }
        }
    }
}
