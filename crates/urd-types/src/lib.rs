pub mod cluster;
pub mod rpc;

pub use rpc::{
    CasCheckType, CheckAndMutateRequest, CheckAndMutateResponse, CheckAndSetRequest,
    CheckAndSetResponse, DuplicateRequest, DuplicateResponse, IncrRequest, IncrResponse,
    IngestFile, IngestionRequest, IngestionResponse, KeyValue, MultiPutRequest,
    MultiRemoveRequest, MultiRemoveResponse, Mutate, MutateOperation, PutRequest, RemoveRequest,
    RpcCode, UpdateResponse, WriteRequest, WriteResponse,
};

pub type Decree = i64;
pub type ClusterId = u8;

/// Status codes shared with the LSM engine, modelled on the RocksDB
/// `Status::Code` numbering so that response `error` fields stay wire
/// compatible with existing readers.
pub mod status {
    pub const OK: i32 = 0;
    pub const NOT_FOUND: i32 = 1;
    pub const CORRUPTION: i32 = 2;
    pub const NOT_SUPPORTED: i32 = 3;
    pub const INVALID_ARGUMENT: i32 = 4;
    pub const IO_ERROR: i32 = 5;
    pub const TRY_AGAIN: i32 = 13;

    /// Sentinels returned by the named fault-injection points. Reserved,
    /// never produced by the engine itself.
    pub const FAIL_DB_WRITE_BATCH_PUT: i32 = -101;
    pub const FAIL_DB_WRITE_BATCH_DELETE: i32 = -102;
    pub const FAIL_DB_WRITE: i32 = -103;
    pub const FAIL_DB_GET: i32 = -104;
}

/// Identity of one partition of one table, stamped into every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReplicaId {
    pub app_id: i32,
    pub partition_index: i32,
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.app_id, self.partition_index)
    }
}

/// Per-dispatch context threaded from the replication layer down to the LSM
/// wrapper.
///
/// A local write stamps `generate_timetag(timestamp_us, local_cluster_id,
/// false)` into the record it produces; a duplicated write carries the
/// already-built `remote_timetag` instead. `remote_timetag != 0` is the
/// duplication marker.
#[derive(Debug, Clone, Copy)]
pub struct WriteContext {
    pub decree: Decree,
    pub timestamp_us: u64,
    pub remote_timetag: u64,
    pub verify_timetag: bool,
}

impl WriteContext {
    pub fn local(decree: Decree, timestamp_us: u64) -> Self {
        WriteContext { decree, timestamp_us, remote_timetag: 0, verify_timetag: false }
    }

    pub fn duplicate(decree: Decree, remote_timetag: u64, verify_timetag: bool) -> Self {
        WriteContext { decree, timestamp_us: 0, remote_timetag, verify_timetag }
    }

    pub fn is_duplicated(&self) -> bool {
        self.remote_timetag != 0
    }
}

/// Replica-wide bulk-ingest progress, flipped by the ingestion worker and
/// polled by admin queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IngestStatus {
    NotRunning = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
}

impl IngestStatus {
    pub fn from_u32(v: u32) -> IngestStatus {
        match v {
            1 => IngestStatus::Running,
            2 => IngestStatus::Succeeded,
            3 => IngestStatus::Failed,
            _ => IngestStatus::NotRunning,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("file {file} failed verification: {reason}")]
    WrongChecksum { file: String, reason: String },
    #[error("ingestion failed: {0}")]
    IngestionFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
