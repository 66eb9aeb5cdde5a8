use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fail::fail_point;

use urd_types::cluster;
use urd_types::{status, Decree, WriteContext};

use crate::timetag::generate_timetag;
use crate::value::{self, DATA_VERSION_1};

/// Meta keyspace key holding the decimal-encoded decree of the last batch
/// written through the wrapper.
pub const LAST_FLUSHED_DECREE: &str = "last_flushed_decree";

pub fn now_us() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as u64
}

pub fn now_sec() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as u32
}

/// Failure of one wrapper operation.
///
/// `code()` maps onto the engine status-code plane carried in response
/// `error` fields; injected failures keep the exact code the fail point was
/// configured with (negative sentinels by default).
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("lsm error: {0}")]
    Lsm(#[from] fjall::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt payload: {0}")]
    Corrupt(String),
    #[error("injected failure at {site} (code {code})")]
    Injected { site: &'static str, code: i32 },
}

impl DbError {
    pub fn code(&self) -> i32 {
        match self {
            DbError::Lsm(_) | DbError::Io(_) => status::IO_ERROR,
            DbError::Corrupt(_) => status::CORRUPTION,
            DbError::Injected { code, .. } => *code,
        }
    }

    fn injected(site: &'static str, arg: Option<String>, default_code: i32) -> DbError {
        let code = arg.and_then(|s| s.parse().ok()).unwrap_or(default_code);
        DbError::Injected { site, code }
    }
}

// ---------------------------------------------------------------------------
// ReplicaStore — shared handle wrapping both keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle, one per replica, alive for the replica's lifetime.
///
/// Both keyspaces live in a single fjall `Database` so that a write batch
/// spanning user data and replica bookkeeping is atomic. No explicit persist
/// barrier is taken anywhere: durability of applied writes is the
/// replication log's responsibility, not the engine's.
pub struct ReplicaStore {
    /// The underlying fjall database.
    pub db: fjall::Database,
    /// User records: raw key → encoded record (see [`crate::value`]).
    pub data: fjall::Keyspace,
    /// Replica bookkeeping, notably [`LAST_FLUSHED_DECREE`].
    pub meta: fjall::Keyspace,
}

impl ReplicaStore {
    /// Open (or create) a `ReplicaStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, DbError> {
        let db = fjall::Database::builder(path).open()?;
        let data = db.keyspace("data", fjall::KeyspaceCreateOptions::default)?;
        let meta = db.keyspace("meta", fjall::KeyspaceCreateOptions::default)?;
        Ok(Arc::new(ReplicaStore { db, data, meta }))
    }

    /// Ingest pre-verified external files into the data keyspace. Each file
    /// is a bincode dump of `(raw_key, raw_value)` pairs produced by the
    /// offline bulk-load pipeline; the caller has already checked md5 and
    /// size. Runs off the apply thread, so it lives on the shared store
    /// handle rather than the wrapper.
    pub fn ingest_external_files(&self, paths: &[PathBuf]) -> Result<(), DbError> {
        let mut batch = self.db.batch();
        for path in paths {
            let bytes = std::fs::read(path)?;
            let pairs: Vec<(Vec<u8>, Vec<u8>)> =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map(|(v, _)| v)
                    .map_err(|e| DbError::Corrupt(format!("{}: {e}", path.display())))?;
            for (raw_key, raw_value) in pairs {
                batch.insert(&self.data, raw_key, raw_value);
            }
        }
        batch.commit()?;
        Ok(())
    }

    /// Read back the last flushed decree, or `None` on a fresh replica.
    pub fn last_flushed_decree(&self) -> Result<Option<Decree>, DbError> {
        match self.meta.get(LAST_FLUSHED_DECREE)? {
            Some(b) => {
                let s = std::str::from_utf8(&b)
                    .map_err(|e| DbError::Corrupt(format!("last_flushed_decree: {e}")))?;
                let d = s
                    .parse::<Decree>()
                    .map_err(|e| DbError::Corrupt(format!("last_flushed_decree: {e}")))?;
                Ok(Some(d))
            }
            None => Ok(None),
        }
    }
}

/// Result of a point read through the wrapper.
#[derive(Debug, Clone, Default)]
pub struct DbGetContext {
    /// Encoded record read from the data keyspace.
    pub raw_value: Vec<u8>,
    /// Whether the engine had the key at all.
    pub found: bool,
    /// Expiration decoded from `raw_value` (0 = never).
    pub expire_ts: u32,
    /// Whether the record is logically absent. Not an error.
    pub expired: bool,
}

enum BatchOp {
    Put { raw_key: Vec<u8>, raw_value: Vec<u8> },
    Delete { raw_key: Vec<u8> },
}

// ---------------------------------------------------------------------------
// FjallWrapper
// ---------------------------------------------------------------------------

/// The narrow engine interface the write state machine consumes: buffered
/// batch puts/deletes committed atomically per decree, point reads, and
/// external-file ingest.
///
/// Owned by the write path and driven from the single apply thread, so the
/// batch buffer needs no locking. `default_ttl` is the one field shared with
/// the control plane and is an atomic word.
pub struct FjallWrapper {
    store: Arc<ReplicaStore>,
    batch: Vec<BatchOp>,
    default_ttl: Arc<AtomicU32>,
    data_version: u8,
    expire_count: AtomicU64,
}

impl FjallWrapper {
    pub fn new(store: Arc<ReplicaStore>, data_version: u8) -> Self {
        FjallWrapper {
            store,
            batch: Vec::new(),
            default_ttl: Arc::new(AtomicU32::new(0)),
            data_version,
            expire_count: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<ReplicaStore> {
        &self.store
    }

    pub fn batch_len(&self) -> usize {
        self.batch.len()
    }

    /// Buffer a put stamped with a locally generated timetag at the current
    /// wall clock. Used by writes that never flow through duplication
    /// verification (incr, check-and-set, check-and-mutate, empty puts).
    pub fn write_batch_put(
        &mut self,
        decree: Decree,
        raw_key: &[u8],
        value: &[u8],
        expire_sec: u32,
    ) -> Result<(), DbError> {
        self.write_batch_put_ctx(&WriteContext::local(decree, now_us()), raw_key, value, expire_sec)
    }

    /// Buffer a put.
    ///
    /// Local writes are stamped `(ctx.timestamp_us, local_cluster_id,
    /// put)`; duplicated writes carry the remote timetag instead. Under
    /// `verify_timetag` a version-1 record already present with a timetag at
    /// or above the incoming one degrades this put to a null write (empty
    /// key, empty value) so the decree still commits without mutating user
    /// data.
    pub fn write_batch_put_ctx(
        &mut self,
        ctx: &WriteContext,
        raw_key: &[u8],
        value: &[u8],
        expire_sec: u32,
    ) -> Result<(), DbError> {
        fail_point!("db_write_batch_put", |s| Err(DbError::injected(
            "db_write_batch_put",
            s,
            status::FAIL_DB_WRITE_BATCH_PUT
        )));

        let mut raw_key = raw_key;
        let mut value = value;
        let timetag = if ctx.is_duplicated() {
            ctx.remote_timetag
        } else {
            generate_timetag(ctx.timestamp_us, cluster::local_cluster_id(), false)
        };

        if ctx.verify_timetag && self.data_version >= DATA_VERSION_1 && !raw_key.is_empty() {
            let get = self.get(raw_key)?;
            if get.found && !get.expired {
                // Version-0 records carry no timetag and always lose.
                let local_tag = value::decode_record(&get.raw_value).and_then(|r| r.timetag);
                if local_tag.is_some_and(|t| t >= timetag) {
                    raw_key = &[];
                    value = &[];
                }
            }
        }

        let expire_ts = self.db_expire_ts(expire_sec);
        let raw_value = value::encode_record(self.data_version, expire_ts, timetag, value);
        self.batch.push(BatchOp::Put { raw_key: raw_key.to_vec(), raw_value });
        Ok(())
    }

    /// Buffer a tombstone.
    pub fn write_batch_delete(&mut self, _decree: Decree, raw_key: &[u8]) -> Result<(), DbError> {
        fail_point!("db_write_batch_delete", |s| Err(DbError::injected(
            "db_write_batch_delete",
            s,
            status::FAIL_DB_WRITE_BATCH_DELETE
        )));

        self.batch.push(BatchOp::Delete { raw_key: raw_key.to_vec() });
        Ok(())
    }

    /// Commit the buffered batch for `decree` atomically, bundling the
    /// `last_flushed_decree` bookkeeping update into the same batch. The
    /// buffer is consumed whether or not the engine write succeeds; callers
    /// clear residual state through [`FjallWrapper::clear_batch`] on the
    /// abort path.
    pub fn write(&mut self, decree: Decree) -> Result<(), DbError> {
        fail_point!("db_write", |s| Err(DbError::injected("db_write", s, status::FAIL_DB_WRITE)));

        debug_assert!(!self.batch.is_empty(), "write called with an empty batch");

        let mut batch = self.store.db.batch();
        for op in self.batch.drain(..) {
            match op {
                BatchOp::Put { raw_key, raw_value } => {
                    batch.insert(&self.store.data, raw_key, raw_value);
                }
                BatchOp::Delete { raw_key } => {
                    batch.remove(&self.store.data, raw_key);
                }
            }
        }
        batch.insert(
            &self.store.meta,
            LAST_FLUSHED_DECREE.as_bytes().to_vec(),
            decree.to_string().into_bytes(),
        );
        batch.commit()?;
        Ok(())
    }

    /// Drop buffered operations without writing them.
    pub fn clear_batch(&mut self) {
        self.batch.clear();
    }

    /// Point read. A missing key is `found: false` with no error; a
    /// logically expired record is `expired: true` and still carries its
    /// raw value.
    pub fn get(&self, raw_key: &[u8]) -> Result<DbGetContext, DbError> {
        fail_point!("db_get", |s| Err(DbError::injected("db_get", s, status::FAIL_DB_GET)));

        match self.store.data.get(raw_key)? {
            None => Ok(DbGetContext::default()),
            Some(b) => {
                let raw_value = b.to_vec();
                let expire_ts = value::decode_record(&raw_value).map(|r| r.expire_ts).unwrap_or(0);
                let expired = value::check_if_record_expired(expire_ts, now_sec());
                if expired {
                    self.expire_count.fetch_add(1, Ordering::Relaxed);
                }
                Ok(DbGetContext { raw_value, found: true, expire_ts, expired })
            }
        }
    }

    /// Count of point reads that hit a logically expired record.
    pub fn recent_expire_count(&self) -> u64 {
        self.expire_count.load(Ordering::Relaxed)
    }

    /// Update the replica default TTL. Called from the control-plane thread;
    /// writes on the apply thread observe it with a relaxed load.
    pub fn set_default_ttl(&self, ttl_sec: u32) {
        let prev = self.default_ttl.swap(ttl_sec, Ordering::Relaxed);
        if prev != ttl_sec {
            tracing::info!(prev, ttl_sec, "default ttl updated");
        }
    }

    /// Shared handle for control-plane updates of the default TTL.
    pub fn default_ttl_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.default_ttl)
    }

    /// Effective expiration for a put: an explicit expiration wins,
    /// otherwise a non-zero default TTL counts from now.
    fn db_expire_ts(&self, expire_ts: u32) -> u32 {
        if expire_ts > 0 {
            return expire_ts;
        }
        let default_ttl = self.default_ttl.load(Ordering::Relaxed);
        if default_ttl > 0 {
            now_sec().saturating_add(default_ttl)
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::compose_raw_key;
    use crate::timetag::{timetag_cluster_id, timetag_timestamp_us};
    use crate::value::{decode_record, encode_record, DATA_VERSION_0};

    use std::collections::BTreeMap;

    fn init_topology() {
        cluster::init(cluster::ClusterTopology {
            local_cluster_id: 3,
            clusters: BTreeMap::from([(3, "alpha".to_string()), (5, "bravo".to_string())]),
        });
    }

    fn open_wrapper(dir: &Path) -> FjallWrapper {
        init_topology();
        FjallWrapper::new(ReplicaStore::open(dir).expect("open store"), DATA_VERSION_1)
    }

    fn stored_record(wrapper: &FjallWrapper, raw_key: &[u8]) -> (Vec<u8>, u64) {
        let got = wrapper.get(raw_key).unwrap();
        assert!(got.found);
        let rec = decode_record(&got.raw_value).unwrap();
        (rec.user_value.to_vec(), rec.timetag.unwrap())
    }

    #[test]
    fn put_commit_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_wrapper(dir.path());
        let key = compose_raw_key(b"h", b"s");

        let ctx = WriteContext::local(10, 1000);
        w.write_batch_put_ctx(&ctx, &key, b"v0", 0).unwrap();
        assert_eq!(w.batch_len(), 1);
        w.write(10).unwrap();
        assert_eq!(w.batch_len(), 0);

        let (value, tag) = stored_record(&w, &key);
        assert_eq!(value, b"v0");
        assert_eq!(timetag_timestamp_us(tag), 1000);
        assert_eq!(timetag_cluster_id(tag), 3);

        assert_eq!(w.store().last_flushed_decree().unwrap(), Some(10));
    }

    #[test]
    fn get_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let w = open_wrapper(dir.path());
        let got = w.get(b"\x00\x01xs").unwrap();
        assert!(!got.found);
        assert!(!got.expired);
    }

    #[test]
    fn delete_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_wrapper(dir.path());
        let key = compose_raw_key(b"h", b"s");

        w.write_batch_put(1, &key, b"v", 0).unwrap();
        w.write(1).unwrap();
        assert!(w.get(&key).unwrap().found);

        w.write_batch_delete(2, &key).unwrap();
        w.write(2).unwrap();
        assert!(!w.get(&key).unwrap().found);
        assert_eq!(w.store().last_flushed_decree().unwrap(), Some(2));
    }

    #[test]
    fn expired_record_is_logically_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_wrapper(dir.path());
        let key = compose_raw_key(b"h", b"s");

        // Expiration far in the past.
        w.write_batch_put(1, &key, b"v", 1).unwrap();
        w.write(1).unwrap();

        let got = w.get(&key).unwrap();
        assert!(got.found);
        assert!(got.expired);
        assert_eq!(got.expire_ts, 1);
        assert_eq!(w.recent_expire_count(), 1);
    }

    #[test]
    fn default_ttl_applies_only_without_explicit_expiration() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_wrapper(dir.path());
        w.set_default_ttl(3600);

        let key_a = compose_raw_key(b"h", b"a");
        let key_b = compose_raw_key(b"h", b"b");
        w.write_batch_put(1, &key_a, b"v", 0).unwrap();
        w.write_batch_put(1, &key_b, b"v", 123).unwrap();
        w.write(1).unwrap();

        let a = w.get(&key_a).unwrap();
        assert!(a.expire_ts >= now_sec() + 3000);
        let b = w.get(&key_b).unwrap();
        assert_eq!(b.expire_ts, 123);
    }

    #[test]
    fn default_ttl_handle_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let w = open_wrapper(dir.path());
        let handle = w.default_ttl_handle();
        handle.store(77, Ordering::Relaxed);
        assert_eq!(w.default_ttl.load(Ordering::Relaxed), 77);
    }

    #[test]
    fn duplicated_put_carries_remote_timetag() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_wrapper(dir.path());
        let key = compose_raw_key(b"h", b"s");

        let remote = generate_timetag(2000, 5, false);
        let ctx = WriteContext::duplicate(11, remote, false);
        w.write_batch_put_ctx(&ctx, &key, b"new", 0).unwrap();
        w.write(11).unwrap();

        let (value, tag) = stored_record(&w, &key);
        assert_eq!(value, b"new");
        assert_eq!(tag, remote);
    }

    #[test]
    fn verified_duplicate_with_newer_timetag_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_wrapper(dir.path());
        let key = compose_raw_key(b"h", b"s");

        w.write_batch_put_ctx(&WriteContext::local(10, 1000), &key, b"old", 0).unwrap();
        w.write(10).unwrap();

        let remote = generate_timetag(2000, 5, false);
        w.write_batch_put_ctx(&WriteContext::duplicate(11, remote, true), &key, b"new", 0)
            .unwrap();
        w.write(11).unwrap();

        let (value, tag) = stored_record(&w, &key);
        assert_eq!(value, b"new");
        assert_eq!(tag, remote);
    }

    #[test]
    fn verified_duplicate_with_older_timetag_becomes_null_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_wrapper(dir.path());
        let key = compose_raw_key(b"h", b"s");

        w.write_batch_put_ctx(&WriteContext::local(10, 3000), &key, b"old", 0).unwrap();
        w.write(10).unwrap();
        let (_, local_tag) = stored_record(&w, &key);

        let remote = generate_timetag(2000, 5, false);
        w.write_batch_put_ctx(&WriteContext::duplicate(11, remote, true), &key, b"new", 0)
            .unwrap();
        w.write(11).unwrap();

        // Value untouched, decree advanced through the null write.
        let (value, tag) = stored_record(&w, &key);
        assert_eq!(value, b"old");
        assert_eq!(tag, local_tag);
        assert_eq!(w.store().last_flushed_decree().unwrap(), Some(11));
    }

    #[test]
    fn second_identical_local_write_at_same_timestamp_is_null() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_wrapper(dir.path());
        let key = compose_raw_key(b"h", b"s");

        let first =
            WriteContext { decree: 1, timestamp_us: 1000, remote_timetag: 0, verify_timetag: true };
        w.write_batch_put_ctx(&first, &key, b"first", 0).unwrap();
        w.write(1).unwrap();

        let second =
            WriteContext { decree: 2, timestamp_us: 1000, remote_timetag: 0, verify_timetag: true };
        w.write_batch_put_ctx(&second, &key, b"second", 0).unwrap();
        w.write(2).unwrap();

        let (value, _) = stored_record(&w, &key);
        assert_eq!(value, b"first");
        assert_eq!(w.store().last_flushed_decree().unwrap(), Some(2));
    }

    #[test]
    fn verified_duplicate_always_overwrites_version_0_records() {
        let dir = tempfile::tempdir().unwrap();
        let w = open_wrapper(dir.path());
        let key = compose_raw_key(b"h", b"s");

        // Seed a version-0 record directly.
        w.store()
            .data
            .insert(key.clone(), encode_record(DATA_VERSION_0, 0, 0, b"ancient"))
            .unwrap();

        let mut w = FjallWrapper::new(Arc::clone(w.store()), DATA_VERSION_1);
        let remote = generate_timetag(1, 5, false);
        w.write_batch_put_ctx(&WriteContext::duplicate(3, remote, true), &key, b"new", 0)
            .unwrap();
        w.write(3).unwrap();

        let (value, tag) = stored_record(&w, &key);
        assert_eq!(value, b"new");
        assert_eq!(tag, remote);
    }

    #[test]
    fn expired_record_loses_timetag_verification() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_wrapper(dir.path());
        let key = compose_raw_key(b"h", b"s");

        // Stored with a huge timetag but already expired.
        w.write_batch_put_ctx(&WriteContext::local(1, u64::MAX >> 9), &key, b"old", 1).unwrap();
        w.write(1).unwrap();

        let remote = generate_timetag(2000, 5, false);
        w.write_batch_put_ctx(&WriteContext::duplicate(2, remote, true), &key, b"new", 0)
            .unwrap();
        w.write(2).unwrap();

        let (value, _) = stored_record(&w, &key);
        assert_eq!(value, b"new");
    }

    #[test]
    fn ingest_external_files_loads_dumped_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_wrapper(dir.path());

        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..10)
            .map(|i| {
                let key = compose_raw_key(b"h", format!("s{i}").as_bytes());
                let val = encode_record(DATA_VERSION_1, 0, 0, format!("v{i}").as_bytes());
                (key, val)
            })
            .collect();
        let file = dir.path().join("dump.sst");
        std::fs::write(
            &file,
            bincode::serde::encode_to_vec(&pairs, bincode::config::standard()).unwrap(),
        )
        .unwrap();

        w.store().ingest_external_files(&[file]).unwrap();

        for i in 0..10 {
            let key = compose_raw_key(b"h", format!("s{i}").as_bytes());
            let (value, _tag) = {
                let got = w.get(&key).unwrap();
                assert!(got.found);
                let rec = decode_record(&got.raw_value).unwrap();
                (rec.user_value.to_vec(), rec.timetag)
            };
            assert_eq!(value, format!("v{i}").into_bytes());
        }
        // Bookkeeping untouched: ingest is not a decree commit.
        assert_eq!(w.store().last_flushed_decree().unwrap(), None);

        w.write_batch_put(1, &compose_raw_key(b"h", b"s0"), b"over", 0).unwrap();
        w.write(1).unwrap();
    }

    #[test]
    fn ingest_rejects_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let w = open_wrapper(dir.path());
        let file = dir.path().join("bad.sst");
        std::fs::write(&file, b"\xff\xff\xff\xff").unwrap();
        let err = w.store().ingest_external_files(&[file]).unwrap_err();
        assert_eq!(err.code(), status::CORRUPTION);
    }

}
