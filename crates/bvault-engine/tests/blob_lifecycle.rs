//! End-to-end blob lifecycle scenarios: upload, dedup, download,
//! delete, failure cleanup.

use std::io::{self, Read};
use std::sync::Arc;

use tempfile::TempDir;

use bvault_engine::{
    BlobService, CancelToken, EngineConfig, EngineError, MemoryMetadataRepository,
    MetadataRepository,
};
use bvault_store::ChunkStore;

fn service(chunk_size: usize) -> (TempDir, BlobService, Arc<MemoryMetadataRepository>) {
    let temp = TempDir::new().unwrap();
    let store = ChunkStore::open(temp.path()).unwrap();
    let meta = Arc::new(MemoryMetadataRepository::new());
    let config = EngineConfig {
        chunk_size,
        workers: 4,
        verify_reads: false,
    };
    let repo: Arc<dyn MetadataRepository> = meta.clone();
    let svc = BlobService::new(store, repo, config);
    (temp, svc, meta)
}

fn download_all(svc: &BlobService, id: &str) -> Vec<u8> {
    let mut out = Vec::new();
    svc.download(id).unwrap().read_to_end(&mut out).unwrap();
    out
}

#[test]
fn round_trip_various_sizes() {
    // Sizes straddling every boundary case: empty, sub-chunk, exact
    // multiples, one byte over.
    for len in [0usize, 1, 7, 8, 9, 64, 65, 1023] {
        let (_temp, svc, _meta) = service(8);
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

        let outcome = svc
            .upload("blob.bin", &data[..], &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.total_size as usize, len);
        assert_eq!(download_all(&svc, &outcome.id), data, "len = {len}");
    }
}

#[test]
fn chunk_count_boundaries() {
    let (_temp, svc, _meta) = service(4);

    let empty = svc.upload("empty", &b""[..], &CancelToken::new()).unwrap();
    assert_eq!(svc.download(&empty.id).unwrap().chunk_count(), 0);

    let exact = svc
        .upload("exact", &b"abcd"[..], &CancelToken::new())
        .unwrap();
    assert_eq!(svc.download(&exact.id).unwrap().chunk_count(), 1);

    // k*S + r with k = 2, r = 2.
    let ragged = svc
        .upload("ragged", &b"abcdefghij"[..], &CancelToken::new())
        .unwrap();
    assert_eq!(svc.download(&ragged.id).unwrap().chunk_count(), 3);
}

#[test]
fn dedup_idempotence_on_disk() {
    let (_temp, svc, meta) = service(4);
    let data = b"abcdefghijklmnop";

    let first = svc.upload("one", &data[..], &CancelToken::new()).unwrap();
    assert!(!first.already_existed);
    let chunks_after_first = svc.store().stats().unwrap().chunk_count;

    let second = svc.upload("two", &data[..], &CancelToken::new()).unwrap();
    assert!(second.already_existed);
    assert_eq!(second.id, first.id, "duplicate upload returns the existing id");
    assert_eq!(second.content_hash, first.content_hash);

    // No new physical chunks, no new records.
    assert_eq!(svc.store().stats().unwrap().chunk_count, chunks_after_first);
    assert_eq!(meta.len(), 1);
}

#[test]
fn shared_chunks_survive_partial_delete() {
    let (_temp, svc, _meta) = service(4);

    // Two different blobs sharing their first two chunks.
    let a = svc
        .upload("a", &b"abcdefghXXXX"[..], &CancelToken::new())
        .unwrap();
    let b = svc
        .upload("b", &b"abcdefghYYYY"[..], &CancelToken::new())
        .unwrap();
    assert!(!b.already_existed);

    let shared = bvault_store::compute_hash(b"abcd");
    assert_eq!(svc.dedup().refcount(&shared), 2);

    svc.delete(&a.id).unwrap();

    // Blob b still downloads intact; the shared chunks survived.
    assert_eq!(download_all(&svc, &b.id), b"abcdefghYYYY");
    assert_eq!(svc.dedup().refcount(&shared), 1);

    svc.delete(&b.id).unwrap();
    assert_eq!(svc.store().stats().unwrap().chunk_count, 0);
    assert!(svc.dedup().is_empty());
}

#[test]
fn delete_releases_storage_and_record() {
    let (_temp, svc, meta) = service(4);
    let outcome = svc
        .upload("gone soon", &b"abcdefghij"[..], &CancelToken::new())
        .unwrap();
    assert!(svc.store().stats().unwrap().chunk_count > 0);

    svc.delete(&outcome.id).unwrap();

    assert_eq!(svc.store().stats().unwrap().chunk_count, 0);
    assert!(meta.is_empty());
    assert!(matches!(
        svc.download(&outcome.id),
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        svc.delete(&outcome.id),
        Err(EngineError::NotFound(_))
    ));
}

#[test]
fn concurrent_identical_uploads() {
    let (_temp, svc, meta) = service(4);
    let svc = Arc::new(svc);
    let data = b"abcdefghijklmnopqrst".to_vec();
    const N: usize = 8;

    let handles: Vec<_> = (0..N)
        .map(|i| {
            let svc = Arc::clone(&svc);
            let data = data.clone();
            std::thread::spawn(move || {
                svc.upload(&format!("copy-{i}"), &data[..], &CancelToken::new())
            })
        })
        .collect();

    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    // Exactly one physical chunk per distinct hash, however the race
    // interleaved.
    assert_eq!(svc.store().stats().unwrap().chunk_count, 5);

    // Every upload that committed a record holds one acquisition per
    // chunk; every blob-level duplicate handed its acquisitions back.
    let committed = outcomes.iter().filter(|o| !o.already_existed).count();
    assert!(committed >= 1);
    assert_eq!(meta.len(), committed);
    let first_chunk = bvault_store::compute_hash(b"abcd");
    assert_eq!(svc.dedup().refcount(&first_chunk), committed as u64);

    // All outcomes agree on the content hash, and every returned id
    // resolves to the same bytes.
    for outcome in &outcomes {
        assert_eq!(outcome.content_hash, outcomes[0].content_hash);
        assert_eq!(download_all(&svc, &outcome.id), data);
    }
}

/// Reader that fails partway through the k-th chunk.
struct FailingReader {
    remaining: usize,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::Error::other("simulated I/O failure"));
        }
        let n = buf.len().min(self.remaining);
        buf[..n].fill(b'x');
        self.remaining -= n;
        Ok(n)
    }
}

#[test]
fn partial_failure_leaves_no_orphans() {
    let (_temp, svc, meta) = service(4);

    // An unrelated blob that must not be disturbed by the failure.
    let survivor = svc
        .upload("survivor", &b"abcdefghij"[..], &CancelToken::new())
        .unwrap();
    let baseline = svc.store().stats().unwrap().chunk_count;

    let result = svc.upload(
        "doomed",
        FailingReader { remaining: 10 },
        &CancelToken::new(),
    );
    assert!(matches!(result, Err(EngineError::Io(_))));

    // No record, no orphaned chunks beyond those the survivor owns.
    assert_eq!(meta.len(), 1);
    assert_eq!(svc.store().stats().unwrap().chunk_count, baseline);
    assert_eq!(download_all(&svc, &survivor.id), b"abcdefghij");
}

#[test]
fn deadline_expiry_cancels_upload() {
    let (_temp, svc, _meta) = service(4);
    let cancel = CancelToken::with_deadline(std::time::Duration::from_millis(0));

    let result = svc.upload("late", &b"abcdefghij"[..], &cancel);
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert_eq!(svc.store().stats().unwrap().chunk_count, 0);
}

#[test]
fn restore_rejects_corrupt_chunk() {
    let (temp, svc, meta) = service(4);
    let outcome = svc
        .upload("fragile", &b"abcdefghij"[..], &CancelToken::new())
        .unwrap();
    let record = meta.get_by_id(&outcome.id).unwrap().unwrap();

    // Rot the first chunk on disk.
    let hex = bvault_store::hash_to_hex(&bvault_store::compute_hash(b"abcd"));
    let path = temp.path().join(&hex[..2]).join(format!("{hex}.chunk"));
    std::fs::write(&path, b"rot!").unwrap();

    let store = ChunkStore::open(svc.store().root()).unwrap();
    let repo: Arc<dyn MetadataRepository> = meta.clone();
    let svc2 = BlobService::new(
        store,
        repo,
        EngineConfig {
            chunk_size: 4,
            workers: 4,
            verify_reads: false,
        },
    );
    assert!(matches!(
        svc2.restore(&record),
        Err(EngineError::Corrupt { .. })
    ));
}

#[test]
fn restore_rebuilds_references() {
    let (_temp, svc, meta) = service(4);
    let outcome = svc
        .upload("persisted", &b"abcdefghij"[..], &CancelToken::new())
        .unwrap();
    let record = meta.get_by_id(&outcome.id).unwrap().unwrap();

    // A fresh service over the same store and repository, as after a
    // process restart with a durable backend.
    let store = ChunkStore::open(svc.store().root()).unwrap();
    let repo: Arc<dyn MetadataRepository> = meta.clone();
    let svc2 = BlobService::new(
        store,
        repo,
        EngineConfig {
            chunk_size: 4,
            workers: 4,
            verify_reads: false,
        },
    );
    svc2.restore(&record).unwrap();

    assert_eq!(download_all(&svc2, &outcome.id), b"abcdefghij");
    svc2.delete(&outcome.id).unwrap();
    assert_eq!(svc2.store().stats().unwrap().chunk_count, 0);
}
