//! JSON-file-backed metadata repository.
//!
//! Keeps the id → FileRecord map in a single JSON file so blob
//! metadata survives across CLI invocations. Rewrites go through a
//! temp file and an atomic rename, the same discipline the chunk
//! store applies to chunk writes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bvault_engine::{EngineError, FileRecord, MetadataRepository};

type Result<T> = std::result::Result<T, EngineError>;

pub struct JsonMetadataRepository {
    path: PathBuf,
    records: Mutex<HashMap<String, FileRecord>>,
}

impl JsonMetadataRepository {
    /// Open the repository at `path`, loading any existing records.
    pub fn open(path: &Path) -> Result<Self> {
        let records = if path.exists() {
            let contents = fs::read_to_string(path)?;
            serde_json::from_str(&contents).map_err(|e| {
                EngineError::Metadata(format!("malformed metadata file {}: {e}", path.display()))
            })?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            records: Mutex::new(records),
        })
    }

    /// Snapshot of every record, for listing and for restoring chunk
    /// references at startup.
    pub fn records(&self) -> Vec<FileRecord> {
        let mut records: Vec<_> = self.records.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    fn persist(&self, records: &HashMap<String, FileRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(records)
            .map_err(|e| EngineError::Metadata(format!("serializing metadata: {e}")))?;

        let temp_name = format!(
            "{}.tmp-{}",
            self.path.file_name().unwrap_or_default().to_string_lossy(),
            std::process::id()
        );
        let temp = self.path.with_file_name(temp_name);
        fs::write(&temp, json)?;
        if let Err(e) = fs::rename(&temp, &self.path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }
}

impl MetadataRepository for JsonMetadataRepository {
    fn create(&self, record: FileRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.id) {
            return Err(EngineError::Metadata(format!(
                "duplicate record id: {}",
                record.id
            )));
        }
        let id = record.id.clone();
        records.insert(id.clone(), record);
        if let Err(e) = self.persist(&records) {
            // Keep the in-memory map consistent with what is on disk.
            records.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    fn get_by_id(&self, id: &str) -> Result<Option<FileRecord>> {
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    fn get_by_content_hash(&self, content_hash: &str) -> Result<Option<FileRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .find(|r| r.content_hash == content_hash)
            .cloned())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if records.remove(id).is_none() {
            return Err(EngineError::NotFound(format!("file record {id}")));
        }
        self.persist(&records)
    }
}
