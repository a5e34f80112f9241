//! Reference-counted deduplication index.
//!
//! The single arbiter of "has this exact content already been stored".
//! Every physical chunk write and delete goes through [`DedupIndex`];
//! nothing else mutates refcounts or inspects the store to answer
//! existence questions.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::debug;

use bvault_store::{hash_to_hex, ChunkHash, ChunkStore, StoreError};

use crate::{EngineError, Result};

#[derive(Debug, Default)]
struct Slot {
    refcount: u64,
    /// Set when the entry is released to zero and removed from the
    /// table. A racing acquirer that still holds the old cell must
    /// retry its lookup instead of resurrecting the slot.
    retired: bool,
}

/// Maps a content hash to its reference count and physical-storage
/// state.
///
/// Entries live in a lock table keyed by hash: concurrent operations on
/// the *same* hash serialize on that entry's mutex, unrelated hashes
/// proceed in parallel. The producer passed to [`acquire`] runs at most
/// once per hash for the lifetime of the index.
///
/// [`acquire`]: DedupIndex::acquire
pub struct DedupIndex {
    store: ChunkStore,
    entries: DashMap<ChunkHash, Arc<Mutex<Slot>>>,
}

impl DedupIndex {
    pub fn new(store: ChunkStore) -> Self {
        Self {
            store,
            entries: DashMap::new(),
        }
    }

    /// Take a reference on `hash`, materializing the chunk on first
    /// acquisition.
    ///
    /// If no entry exists, `producer` is invoked for the chunk bytes
    /// and they are written through the store; otherwise the refcount
    /// is bumped without invoking `producer` or touching disk. Returns
    /// the refcount after this acquisition.
    ///
    /// A failed first acquisition leaves no entry behind, so a later
    /// upload of the same content gets a fresh attempt.
    pub fn acquire<F>(&self, hash: ChunkHash, producer: F) -> Result<u64>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        let mut producer = Some(producer);
        loop {
            let cell = Arc::clone(self.entries.entry(hash).or_default().value());
            let mut slot = cell.lock().unwrap();
            if slot.retired {
                // Lost a race against release-to-zero; the table entry
                // we cloned is already gone. Look up again.
                continue;
            }

            if slot.refcount == 0 {
                let produce = producer
                    .take()
                    .expect("producer consumed at most once per acquire");
                let written = produce()
                    .and_then(|bytes| self.store.put(&hash, &bytes).map_err(EngineError::from));
                if let Err(e) = written {
                    slot.retired = true;
                    self.entries.remove_if(&hash, |_, v| Arc::ptr_eq(v, &cell));
                    return Err(e);
                }
                slot.refcount = 1;
                debug!(hash = %hash_to_hex(&hash), "chunk acquired (first)");
                return Ok(1);
            }

            slot.refcount += 1;
            return Ok(slot.refcount);
        }
    }

    /// Drop a reference on `hash`. When the count reaches zero the
    /// physical chunk is deleted and the entry removed, both inside the
    /// per-hash critical section: there is no window where the entry is
    /// gone but the chunk persists, or the reverse.
    ///
    /// Returns the refcount after the release.
    pub fn release(&self, hash: &ChunkHash) -> Result<u64> {
        let cell = match self.entries.get(hash) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                return Err(EngineError::NotFound(format!(
                    "dedup entry {}",
                    hash_to_hex(hash)
                )))
            }
        };

        let mut slot = cell.lock().unwrap();
        if slot.retired || slot.refcount == 0 {
            return Err(EngineError::NotFound(format!(
                "dedup entry {}",
                hash_to_hex(hash)
            )));
        }

        slot.refcount -= 1;
        if slot.refcount > 0 {
            return Ok(slot.refcount);
        }

        match self.store.delete(hash) {
            // Already absent is tolerated: the desired end state holds.
            Ok(()) | Err(StoreError::NotFound { .. }) => {}
            Err(e) => {
                // Keep the reference; the caller may retry the release.
                slot.refcount = 1;
                return Err(e.into());
            }
        }
        slot.retired = true;
        self.entries.remove_if(hash, |_, v| Arc::ptr_eq(v, &cell));
        debug!(hash = %hash_to_hex(hash), "chunk released to zero, deleted");
        Ok(0)
    }

    /// Current refcount for `hash` (0 if untracked).
    pub fn refcount(&self, hash: &ChunkHash) -> u64 {
        match self.entries.get(hash) {
            Some(entry) => entry.value().lock().unwrap().refcount,
            None => 0,
        }
    }

    /// Number of distinct hashes currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }
}
