//! File metadata records and the persistence seam.
//!
//! The engine only requires create / lookup / delete semantics with
//! unique ids; what backs them (SQL, JSON file, memory) is the
//! implementor's business.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use bvault_store::{hash_to_hex, hex_to_hash, ChunkHash};

use crate::chunker::ChunkRef;
use crate::{EngineError, Result};

/// Metadata binding a user-facing file identity to a blob's ordered
/// chunk list. Hashes are stored hex-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    /// Unique id, assigned at creation.
    pub id: String,
    /// Caller-supplied name; carries no identity.
    pub display_name: String,
    /// Aggregate hash of the ordered chunk-hash sequence.
    pub content_hash: String,
    /// Ordered chunk hashes. Order is data: reassembly follows this
    /// list, never storage enumeration.
    pub chunks: Vec<String>,
    /// Sum of chunk sizes in bytes.
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(display_name: &str, content_hash: &ChunkHash, chunks: &[ChunkRef]) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            display_name: display_name.to_string(),
            content_hash: hash_to_hex(content_hash),
            chunks: chunks.iter().map(|c| hash_to_hex(&c.hash)).collect(),
            total_size: chunks.iter().map(|c| c.size).sum(),
            created_at: Utc::now(),
        }
    }

    /// Decode the ordered chunk-hash list.
    pub fn chunk_hashes(&self) -> Result<Vec<ChunkHash>> {
        self.chunks
            .iter()
            .map(|hex| {
                hex_to_hash(hex).ok_or_else(|| {
                    EngineError::Metadata(format!("malformed chunk hash in record: {hex}"))
                })
            })
            .collect()
    }
}

/// Synchronous metadata persistence consumed by the engine.
///
/// Implementations must guarantee uniqueness of `id`. `NotFound` is a
/// normal outcome for lookups, hence `Option` rather than an error.
pub trait MetadataRepository: Send + Sync {
    fn create(&self, record: FileRecord) -> Result<()>;
    fn get_by_id(&self, id: &str) -> Result<Option<FileRecord>>;
    fn get_by_content_hash(&self, content_hash: &str) -> Result<Option<FileRecord>>;
    fn delete(&self, id: &str) -> Result<()>;
}

/// In-memory repository. The reference implementation for tests and
/// embedded use.
#[derive(Debug, Default)]
pub struct MemoryMetadataRepository {
    records: dashmap::DashMap<String, FileRecord>,
}

impl MemoryMetadataRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl MetadataRepository for MemoryMetadataRepository {
    fn create(&self, record: FileRecord) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(EngineError::Metadata(format!(
                "duplicate record id: {}",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    fn get_by_id(&self, id: &str) -> Result<Option<FileRecord>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    fn get_by_content_hash(&self, content_hash: &str) -> Result<Option<FileRecord>> {
        Ok(self
            .records
            .iter()
            .find(|r| r.content_hash == content_hash)
            .map(|r| r.clone()))
    }

    fn delete(&self, id: &str) -> Result<()> {
        match self.records.remove(id) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(format!("file record {id}"))),
        }
    }
}
