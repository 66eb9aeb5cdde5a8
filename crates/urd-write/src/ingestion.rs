//! Bulk-ingest workflow: file verification and the dedicated worker pool.
//!
//! The synchronous half of an ingest (the empty-put commit barrier) runs on
//! the apply thread in the write service; everything here runs on the
//! `ingestion` pool and touches only the shared store handle, never the
//! apply thread's batch state.

use std::path::Path;

use tokio::runtime;

use urd_storage::ReplicaStore;
use urd_types::{IngestError, IngestFile};

/// Single-threaded worker pool the ingest task is posted to.
///
/// Backed by its own tokio runtime so a slow or stuck ingest can never
/// starve the apply thread. Tasks are blocking file/engine work, hence
/// `spawn_blocking`.
pub(crate) struct IngestionPool {
    runtime: runtime::Runtime,
}

impl IngestionPool {
    pub fn new() -> std::io::Result<Self> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .thread_name("ingestion")
            .enable_all()
            .build()?;
        Ok(IngestionPool { runtime })
    }

    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.runtime.spawn_blocking(job);
    }
}

/// Verify every listed file against its declared size and md5, then hand the
/// batch to the engine's external-file ingest.
pub fn verify_and_ingest(
    store: &ReplicaStore,
    bulk_load_dir: &Path,
    files: &[IngestFile],
) -> Result<(), IngestError> {
    let mut paths = Vec::with_capacity(files.len());
    for f in files {
        let path = bulk_load_dir.join(&f.name);
        let bytes = std::fs::read(&path)?;
        if bytes.len() as u64 != f.size {
            return Err(IngestError::WrongChecksum {
                file: f.name.clone(),
                reason: format!("size {} does not match expected {}", bytes.len(), f.size),
            });
        }
        let digest = file_md5(&bytes);
        if !digest.eq_ignore_ascii_case(&f.md5) {
            return Err(IngestError::WrongChecksum {
                file: f.name.clone(),
                reason: format!("md5 {digest} does not match expected {}", f.md5),
            });
        }
        paths.push(path);
    }
    store.ingest_external_files(&paths).map_err(|e| IngestError::IngestionFailed(e.to_string()))
}

/// Lowercase hex md5 of a byte buffer.
pub fn file_md5(bytes: &[u8]) -> String {
    let mut hasher = md5::Context::new();
    hasher.consume(bytes);
    format!("{:x}", hasher.compute())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::init_topology;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use urd_storage::keys::compose_raw_key;
    use urd_storage::value::{encode_record, DATA_VERSION_1};

    fn dump_file(dir: &Path, name: &str, pairs: &[(Vec<u8>, Vec<u8>)]) -> IngestFile {
        let bytes = bincode::serde::encode_to_vec(&pairs, bincode::config::standard()).unwrap();
        std::fs::write(dir.join(name), &bytes).unwrap();
        IngestFile { name: name.to_string(), size: bytes.len() as u64, md5: file_md5(&bytes) }
    }

    #[test]
    fn verify_and_ingest_loads_files() {
        init_topology();
        let dir = tempfile::tempdir().unwrap();
        let store = ReplicaStore::open(&dir.path().join("db")).unwrap();

        let key = compose_raw_key(b"h", b"s");
        let pairs = vec![(key.clone(), encode_record(DATA_VERSION_1, 0, 0, b"bulk"))];
        let file = dump_file(dir.path(), "part-0.sst", &pairs);

        verify_and_ingest(&store, dir.path(), &[file]).unwrap();
        assert!(store.data.get(&key).unwrap().is_some());
    }

    #[test]
    fn size_mismatch_is_wrong_checksum() {
        init_topology();
        let dir = tempfile::tempdir().unwrap();
        let store = ReplicaStore::open(&dir.path().join("db")).unwrap();

        let mut file = dump_file(dir.path(), "part-0.sst", &[(b"k".to_vec(), b"v".to_vec())]);
        file.size += 1;
        let err = verify_and_ingest(&store, dir.path(), &[file]).unwrap_err();
        assert!(matches!(err, IngestError::WrongChecksum { .. }));
    }

    #[test]
    fn md5_mismatch_is_wrong_checksum() {
        init_topology();
        let dir = tempfile::tempdir().unwrap();
        let store = ReplicaStore::open(&dir.path().join("db")).unwrap();

        let mut file = dump_file(dir.path(), "part-0.sst", &[(b"k".to_vec(), b"v".to_vec())]);
        file.md5 = "0".repeat(32);
        let err = verify_and_ingest(&store, dir.path(), &[file]).unwrap_err();
        assert!(matches!(err, IngestError::WrongChecksum { .. }));
    }

    #[test]
    fn missing_file_is_io_error() {
        init_topology();
        let dir = tempfile::tempdir().unwrap();
        let store = ReplicaStore::open(&dir.path().join("db")).unwrap();

        let file = IngestFile { name: "absent.sst".into(), size: 0, md5: String::new() };
        let err = verify_and_ingest(&store, dir.path(), &[file]).unwrap_err();
        assert!(matches!(err, IngestError::Io(_)));
    }

    #[test]
    fn pool_runs_posted_jobs() {
        let pool = IngestionPool::new().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        pool.execute(move || flag.store(true, Ordering::SeqCst));

        for _ in 0..200 {
            if done.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("ingestion job did not run");
    }

    #[test]
    fn md5_is_stable() {
        // RFC 1321 test vector.
        assert_eq!(file_md5(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }
}
