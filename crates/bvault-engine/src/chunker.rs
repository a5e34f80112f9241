//! Fixed-size stream chunking over a bounded worker pool.
//!
//! Boundary discovery is sequential on the calling thread (chunk `n`'s
//! offset depends only on `n` and the chunk size), while hashing and
//! storing fan out to a fixed set of worker threads over a bounded
//! channel. A collector reassembles completions by index, so the final
//! chunk list is ordered no matter which worker finished first.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, unbounded};
use tracing::{debug, warn};

use bvault_store::{compute_hash, hash_to_hex, ChunkHash};

use crate::cancel::CancelToken;
use crate::dedup::DedupIndex;
use crate::{EngineError, Result};

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound on worker threads per upload.
pub const MAX_WORKERS: usize = 4;

/// Default worker count: min(cpu cores / 2, [`MAX_WORKERS`]), at least 1.
pub fn default_workers() -> usize {
    (num_cpus::get() / 2).clamp(1, MAX_WORKERS)
}

/// Tunables consumed by the engine. Loading these from files or the
/// environment is the caller's concern.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes per chunk; the final chunk of a blob may be shorter.
    pub chunk_size: usize,
    /// Worker threads hashing and storing chunks per upload call.
    pub workers: usize,
    /// Re-hash each chunk when reading it back during download.
    pub verify_reads: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: default_workers(),
            verify_reads: false,
        }
    }
}

/// One stored chunk's place within a blob.
///
/// Identity is `hash`; `index` only records position within the blob
/// this reference belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub index: usize,
    pub hash: ChunkHash,
    pub size: u64,
}

struct Task {
    index: usize,
    bytes: Vec<u8>,
}

/// Splits an input stream into fixed-size chunks and drives them
/// through the dedup index on a bounded worker pool.
pub struct Chunker {
    dedup: Arc<DedupIndex>,
    config: EngineConfig,
}

impl Chunker {
    pub fn new(dedup: Arc<DedupIndex>, config: EngineConfig) -> Self {
        Self { dedup, config }
    }

    /// Split `reader` into chunks, acquiring each chunk's hash through
    /// the dedup index. Returns the chunk list ordered by index.
    ///
    /// Fail-fast: on the first worker error or cancellation, no new
    /// tasks are fed, in-flight workers finish, and every acquisition
    /// made by this call is released before the error is returned, so a
    /// failed upload leaves no leaked chunk references.
    pub fn split<R: Read>(&self, mut reader: R, cancel: &CancelToken) -> Result<Vec<ChunkRef>> {
        let workers = self.config.workers.max(1);
        let chunk_size = self.config.chunk_size.max(1);

        let (task_tx, task_rx) = bounded::<Task>(workers * 2);
        let (done_tx, done_rx) = unbounded::<ChunkRef>();
        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<EngineError>> = Mutex::new(None);

        let fed = thread::scope(|scope| {
            for _ in 0..workers {
                let task_rx = task_rx.clone();
                let done_tx = done_tx.clone();
                let failed = &failed;
                let first_error = &first_error;
                let dedup = &*self.dedup;
                scope.spawn(move || {
                    for task in task_rx.iter() {
                        // Keep draining after a failure so the feeder
                        // never blocks on a full queue; the work itself
                        // is skipped.
                        if failed.load(Ordering::Relaxed) {
                            continue;
                        }
                        if cancel.is_cancelled() {
                            record_failure(failed, first_error, EngineError::Cancelled);
                            continue;
                        }
                        let index = task.index;
                        let size = task.bytes.len() as u64;
                        let hash = compute_hash(&task.bytes);
                        let bytes = task.bytes;
                        match dedup.acquire(hash, move || Ok(bytes)) {
                            Ok(_) => {
                                let _ = done_tx.send(ChunkRef { index, hash, size });
                            }
                            Err(e) => record_failure(failed, first_error, e),
                        }
                    }
                });
            }
            drop(task_rx);
            drop(done_tx);

            // Boundary discovery: sequential, single pass over the source.
            let mut index = 0usize;
            loop {
                if failed.load(Ordering::Relaxed) {
                    break;
                }
                if cancel.is_cancelled() {
                    record_failure(&failed, &first_error, EngineError::Cancelled);
                    break;
                }
                let mut buf = vec![0u8; chunk_size];
                let n = match read_full(&mut reader, &mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        record_failure(&failed, &first_error, e.into());
                        break;
                    }
                };
                if n == 0 {
                    break;
                }
                buf.truncate(n);
                if task_tx.send(Task { index, bytes: buf }).is_err() {
                    break;
                }
                index += 1;
            }
            // Closing the task channel is the join barrier: workers
            // drain what remains and exit, and the scope waits for them.
            drop(task_tx);
            index
        });

        let mut chunks: Vec<ChunkRef> = done_rx.try_iter().collect();

        if let Some(err) = first_error.lock().unwrap().take() {
            for chunk in &chunks {
                if let Err(e) = self.dedup.release(&chunk.hash) {
                    warn!(hash = %hash_to_hex(&chunk.hash), error = %e, "rollback release failed");
                }
            }
            return Err(err);
        }

        debug_assert_eq!(chunks.len(), fed);
        chunks.sort_unstable_by_key(|c| c.index);
        debug!(chunks = chunks.len(), "stream split complete");
        Ok(chunks)
    }
}

fn record_failure(failed: &AtomicBool, slot: &Mutex<Option<EngineError>>, err: EngineError) {
    let mut guard = slot.lock().unwrap();
    if guard.is_none() {
        *guard = Some(err);
    }
    failed.store(true, Ordering::Relaxed);
}

/// Read until `buf` is full or the source is exhausted. Returns the
/// number of bytes read; 0 means clean end of stream.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bvault_store::ChunkStore;
    use tempfile::TempDir;

    fn setup(chunk_size: usize) -> (TempDir, Chunker, Arc<DedupIndex>) {
        let temp = TempDir::new().unwrap();
        let store = ChunkStore::open(temp.path()).unwrap();
        let dedup = Arc::new(DedupIndex::new(store));
        let config = EngineConfig {
            chunk_size,
            workers: 4,
            verify_reads: false,
        };
        let chunker = Chunker::new(Arc::clone(&dedup), config);
        (temp, chunker, dedup)
    }

    /// Reader that fails with an I/O error after yielding `limit` bytes.
    struct FailingReader {
        data: Vec<u8>,
        pos: usize,
        limit: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.limit {
                return Err(io::Error::other("simulated read failure"));
            }
            let n = buf.len().min(self.limit - self.pos).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_concrete_scenario() {
        // 10 bytes at chunk size 4: "abcd", "efgh", "ij".
        let (_temp, chunker, dedup) = setup(4);
        let chunks = chunker
            .split(&b"abcdefghij"[..], &CancelToken::new())
            .unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].size, 4);
        assert_eq!(chunks[1].size, 4);
        assert_eq!(chunks[2].size, 2);
        assert_eq!(chunks[0].hash, compute_hash(b"abcd"));
        assert_eq!(chunks[1].hash, compute_hash(b"efgh"));
        assert_eq!(chunks[2].hash, compute_hash(b"ij"));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert_eq!(dedup.refcount(&c.hash), 1);
        }
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        let (_temp, chunker, dedup) = setup(4);
        let chunks = chunker.split(&b""[..], &CancelToken::new()).unwrap();
        assert!(chunks.is_empty());
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_exact_chunk_size_boundary() {
        let (_temp, chunker, _dedup) = setup(8);
        let chunks = chunker.split(&[7u8; 8][..], &CancelToken::new()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 8);

        let (_temp, chunker, _dedup) = setup(8);
        let chunks = chunker.split(&[7u8; 17][..], &CancelToken::new()).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].size, 1);
    }

    #[test]
    fn test_ordering_with_many_chunks() {
        let (_temp, chunker, _dedup) = setup(16);
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let chunks = chunker.split(&data[..], &CancelToken::new()).unwrap();

        assert_eq!(chunks.len(), 256);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i, "collector must reassemble by index");
            assert_eq!(c.hash, compute_hash(&data[i * 16..(i + 1) * 16]));
        }
    }

    #[test]
    fn test_duplicate_chunks_acquire_per_occurrence() {
        let (_temp, chunker, dedup) = setup(4);
        // Three identical chunks in one blob: one physical chunk,
        // refcount counts every occurrence.
        let chunks = chunker
            .split(&b"aaaaaaaaaaaa"[..], &CancelToken::new())
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].hash, chunks[2].hash);
        assert_eq!(dedup.refcount(&chunks[0].hash), 3);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_read_failure_rolls_back_acquisitions() {
        let (_temp, chunker, dedup) = setup(4);
        let reader = FailingReader {
            data: vec![42u8; 64],
            pos: 0,
            limit: 10,
        };

        let result = chunker.split(reader, &CancelToken::new());
        assert!(matches!(result, Err(EngineError::Io(_))));
        assert!(dedup.is_empty(), "failed split must release everything");
        assert_eq!(dedup.store().stats().unwrap().chunk_count, 0);
    }

    #[test]
    fn test_cancelled_before_start() {
        let (_temp, chunker, dedup) = setup(4);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = chunker.split(&b"abcdefghij"[..], &cancel);
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(dedup.is_empty());
    }
}
