//! Request and response bodies for the replica write path.
//!
//! These are the deserialized forms of the client RPCs after the replication
//! layer has sequenced them into a mutation. All request types are
//! serde-serializable because the duplication path ships them between
//! clusters as an opaque `raw_message` (bincode).
//!
//! Enum-valued wire fields (`check_type`, `Mutate::operation`) are carried as
//! `i32` with `TryFrom` accessors so that an out-of-range value arriving from
//! a foreign writer degrades to invalid-argument instead of failing
//! deserialization outright.

use crate::Decree;

/// The closed set of write RPC opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RpcCode {
    Put,
    Remove,
    MultiPut,
    MultiRemove,
    Incr,
    CheckAndSet,
    CheckAndMutate,
    Duplicate,
    BulkLoad,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Single put. `key` is the composed raw key (hash key length prefix, hash
/// key, sort key).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub expire_ts_seconds: u32,
}

/// Single remove of a raw key.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RemoveRequest {
    pub key: Vec<u8>,
}

/// One `(sort_key, value)` pair inside a multi-put.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MultiPutRequest {
    pub hash_key: Vec<u8>,
    pub kvs: Vec<KeyValue>,
    pub expire_ts_seconds: u32,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MultiRemoveRequest {
    pub hash_key: Vec<u8>,
    pub sort_keys: Vec<Vec<u8>>,
}

/// Atomic increment of a decimal-encoded signed 64-bit value.
///
/// `expire_ts_seconds` semantics: `0` keeps the record's current TTL, a
/// negative value clears it, a positive value sets an absolute expiration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IncrRequest {
    pub key: Vec<u8>,
    pub increment: i64,
    pub expire_ts_seconds: i32,
}

/// Conditions a check-and-set / check-and-mutate may test against the check
/// record. Discriminants are wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CasCheckType {
    NoCheck = 0,
    ValueNotExist = 1,
    ValueNotExistOrEmpty = 2,
    ValueExist = 3,
    ValueNotEmpty = 4,
    MatchAnywhere = 5,
    MatchPrefix = 6,
    MatchPostfix = 7,
    BytesLess = 8,
    BytesLessOrEqual = 9,
    BytesEqual = 10,
    BytesGreaterOrEqual = 11,
    BytesGreater = 12,
    IntLess = 13,
    IntLessOrEqual = 14,
    IntEqual = 15,
    IntGreaterOrEqual = 16,
    IntGreater = 17,
}

impl TryFrom<i32> for CasCheckType {
    type Error = i32;

    fn try_from(v: i32) -> Result<Self, i32> {
        Ok(match v {
            0 => CasCheckType::NoCheck,
            1 => CasCheckType::ValueNotExist,
            2 => CasCheckType::ValueNotExistOrEmpty,
            3 => CasCheckType::ValueExist,
            4 => CasCheckType::ValueNotEmpty,
            5 => CasCheckType::MatchAnywhere,
            6 => CasCheckType::MatchPrefix,
            7 => CasCheckType::MatchPostfix,
            8 => CasCheckType::BytesLess,
            9 => CasCheckType::BytesLessOrEqual,
            10 => CasCheckType::BytesEqual,
            11 => CasCheckType::BytesGreaterOrEqual,
            12 => CasCheckType::BytesGreater,
            13 => CasCheckType::IntLess,
            14 => CasCheckType::IntLessOrEqual,
            15 => CasCheckType::IntEqual,
            16 => CasCheckType::IntGreaterOrEqual,
            17 => CasCheckType::IntGreater,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CheckAndSetRequest {
    pub hash_key: Vec<u8>,
    pub check_sort_key: Vec<u8>,
    /// Wire value of [`CasCheckType`].
    pub check_type: i32,
    pub check_operand: Vec<u8>,
    /// When false the set writes back to the check key itself.
    pub set_diff_sort_key: bool,
    pub set_sort_key: Vec<u8>,
    pub set_value: Vec<u8>,
    pub set_expire_ts_seconds: u32,
    pub return_check_value: bool,
}

/// Operations a check-and-mutate may apply. Discriminants are wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MutateOperation {
    Put = 0,
    Delete = 1,
}

impl TryFrom<i32> for MutateOperation {
    type Error = i32;

    fn try_from(v: i32) -> Result<Self, i32> {
        match v {
            0 => Ok(MutateOperation::Put),
            1 => Ok(MutateOperation::Delete),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Mutate {
    /// Wire value of [`MutateOperation`].
    pub operation: i32,
    pub sort_key: Vec<u8>,
    /// Ignored for deletes.
    pub value: Vec<u8>,
    /// Ignored for deletes.
    pub set_expire_ts_seconds: u32,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CheckAndMutateRequest {
    pub hash_key: Vec<u8>,
    pub check_sort_key: Vec<u8>,
    /// Wire value of [`CasCheckType`].
    pub check_type: i32,
    pub check_operand: Vec<u8>,
    pub mutate_list: Vec<Mutate>,
    pub return_check_value: bool,
}

/// A write replayed from another cluster. `raw_message` is the original
/// request in bincode form; `task_code` names which request type it decodes
/// to.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DuplicateRequest {
    pub cluster_id: u8,
    /// Microseconds, stamped by the originating cluster.
    pub timestamp: u64,
    pub task_code: RpcCode,
    pub raw_message: Vec<u8>,
    pub verify_timetag: bool,
}

/// Descriptor of one prepared ingest file, produced by the offline bulk-load
/// pipeline.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IngestFile {
    pub name: String,
    pub size: u64,
    pub md5: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IngestionRequest {
    pub files: Vec<IngestFile>,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Response shared by put, remove, multi-put, and batched writes.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct UpdateResponse {
    pub error: i32,
    pub app_id: i32,
    pub partition_index: i32,
    pub decree: Decree,
    pub server: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MultiRemoveResponse {
    pub error: i32,
    pub app_id: i32,
    pub partition_index: i32,
    pub decree: Decree,
    pub server: String,
    /// Number of sort keys removed.
    pub count: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IncrResponse {
    pub error: i32,
    pub app_id: i32,
    pub partition_index: i32,
    pub decree: Decree,
    pub server: String,
    pub new_value: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CheckAndSetResponse {
    pub error: i32,
    pub app_id: i32,
    pub partition_index: i32,
    pub decree: Decree,
    pub server: String,
    pub check_value_returned: bool,
    pub check_value_exist: bool,
    pub check_value: Vec<u8>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CheckAndMutateResponse {
    pub error: i32,
    pub app_id: i32,
    pub partition_index: i32,
    pub decree: Decree,
    pub server: String,
    pub check_value_returned: bool,
    pub check_value_exist: bool,
    pub check_value: Vec<u8>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DuplicateResponse {
    pub error: i32,
    /// Human-readable reason accompanying an invalid-argument error.
    pub error_hint: String,
}

/// Two error planes: `err` reports the ingest workflow outcome (ok or
/// try-again), `rocksdb_error` the status of the empty-put commit barrier.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IngestionResponse {
    pub err: i32,
    pub rocksdb_error: i32,
}

// ---------------------------------------------------------------------------
// Dispatcher envelopes
// ---------------------------------------------------------------------------

/// One sequenced request as handed to the write dispatcher.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum WriteRequest {
    Put(PutRequest),
    Remove(RemoveRequest),
    MultiPut(MultiPutRequest),
    MultiRemove(MultiRemoveRequest),
    Incr(IncrRequest),
    CheckAndSet(CheckAndSetRequest),
    CheckAndMutate(CheckAndMutateRequest),
    Duplicate(DuplicateRequest),
    BulkLoad(IngestionRequest),
}

impl WriteRequest {
    pub fn code(&self) -> RpcCode {
        match self {
            WriteRequest::Put(_) => RpcCode::Put,
            WriteRequest::Remove(_) => RpcCode::Remove,
            WriteRequest::MultiPut(_) => RpcCode::MultiPut,
            WriteRequest::MultiRemove(_) => RpcCode::MultiRemove,
            WriteRequest::Incr(_) => RpcCode::Incr,
            WriteRequest::CheckAndSet(_) => RpcCode::CheckAndSet,
            WriteRequest::CheckAndMutate(_) => RpcCode::CheckAndMutate,
            WriteRequest::Duplicate(_) => RpcCode::Duplicate,
            WriteRequest::BulkLoad(_) => RpcCode::BulkLoad,
        }
    }
}

/// Per-request response, positionally matching the dispatched batch.
#[derive(Debug, Clone)]
pub enum WriteResponse {
    Update(UpdateResponse),
    MultiRemove(MultiRemoveResponse),
    Incr(IncrResponse),
    CheckAndSet(CheckAndSetResponse),
    CheckAndMutate(CheckAndMutateResponse),
    Duplicate(DuplicateResponse),
    Ingestion(IngestionResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<T: serde::Serialize>(val: &T) -> Vec<u8> {
        bincode::serde::encode_to_vec(val, bincode::config::standard()).unwrap()
    }

    fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> T {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard()).unwrap().0
    }

    #[test]
    fn put_request_raw_message_round_trip() {
        let req = PutRequest { key: b"\x00\x01hs".to_vec(), value: b"v".to_vec(), expire_ts_seconds: 30 };
        let raw = encode(&req);
        let back: PutRequest = decode(&raw);
        assert_eq!(back.key, req.key);
        assert_eq!(back.value, req.value);
        assert_eq!(back.expire_ts_seconds, 30);
    }

    #[test]
    fn multi_put_raw_message_round_trip() {
        let req = MultiPutRequest {
            hash_key: b"h".to_vec(),
            kvs: vec![
                KeyValue { key: b"s0".to_vec(), value: b"v0".to_vec() },
                KeyValue { key: b"s1".to_vec(), value: b"v1".to_vec() },
            ],
            expire_ts_seconds: 0,
        };
        let back: MultiPutRequest = decode(&encode(&req));
        assert_eq!(back.kvs.len(), 2);
        assert_eq!(back.kvs[1].value, b"v1");
    }

    #[test]
    fn check_type_wire_values() {
        assert_eq!(CasCheckType::try_from(0), Ok(CasCheckType::NoCheck));
        assert_eq!(CasCheckType::try_from(10), Ok(CasCheckType::BytesEqual));
        assert_eq!(CasCheckType::try_from(17), Ok(CasCheckType::IntGreater));
        assert_eq!(CasCheckType::try_from(18), Err(18));
        assert_eq!(CasCheckType::try_from(-1), Err(-1));
    }

    #[test]
    fn mutate_operation_wire_values() {
        assert_eq!(MutateOperation::try_from(0), Ok(MutateOperation::Put));
        assert_eq!(MutateOperation::try_from(1), Ok(MutateOperation::Delete));
        assert_eq!(MutateOperation::try_from(2), Err(2));
    }

    #[test]
    fn write_request_code() {
        let req = WriteRequest::Incr(IncrRequest::default());
        assert_eq!(req.code(), RpcCode::Incr);
        let req = WriteRequest::BulkLoad(IngestionRequest::default());
        assert_eq!(req.code(), RpcCode::BulkLoad);
    }
}
