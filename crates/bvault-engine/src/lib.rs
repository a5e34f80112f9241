//! # bvault-engine
//!
//! The blobvault core: splits byte streams into fixed-size chunks,
//! hashes and persists them through a bounded worker pool, deduplicates
//! identical content by reference counting, and reassembles blobs on
//! retrieval.
//!
//! ## Data flow
//!
//! ```text
//! upload   → Chunker ─ tasks ─→ worker pool ─ (index, hash) ─→ collector
//!                                   │
//!                             DedupIndex.acquire
//!                                   │
//!                             ChunkStore.put (first acquirer only)
//!
//! download → MetadataRepository.get_by_id → Assembler → caller
//! delete   → MetadataRepository.get_by_id → DedupIndex.release per chunk
//! ```
//!
//! The [`BlobService`] ties these together behind upload / download /
//! delete. Metadata persistence sits behind the [`MetadataRepository`]
//! trait; the engine never assumes a particular backing store.

mod assemble;
mod cancel;
mod chunker;
mod dedup;
mod meta;
mod service;

pub use assemble::Assembler;
pub use cancel::CancelToken;
pub use chunker::{default_workers, ChunkRef, Chunker, EngineConfig, DEFAULT_CHUNK_SIZE, MAX_WORKERS};
pub use dedup::DedupIndex;
pub use meta::{FileRecord, MemoryMetadataRepository, MetadataRepository};
pub use service::{aggregate_hash, BlobService, UploadOutcome};

use std::io;

use thiserror::Error;

use bvault_store::StoreError;

/// Errors surfaced by the engine.
///
/// A duplicate upload is not represented here: it is a success outcome,
/// reported through [`UploadOutcome::already_existed`].
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("chunk data corrupt: {hash}")]
    Corrupt { hash: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("metadata error: {0}")]
    Metadata(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
