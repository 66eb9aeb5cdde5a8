//! On-disk record schema for the data keyspace.
//!
//! Version 1 (current): `version(1) ++ expire_ts(4, BE) ++ timetag(8, BE) ++
//! user_value`. Version 0 predates duplication and omits the timetag; such
//! records cannot take part in conflict resolution and any verified
//! duplicated write overwrites them.

pub const DATA_VERSION_0: u8 = 0;
pub const DATA_VERSION_1: u8 = 1;

/// A record decoded from its raw LSM value. Borrows the user value.
#[derive(Debug, PartialEq, Eq)]
pub struct DecodedRecord<'a> {
    pub version: u8,
    /// Seconds from epoch; 0 means the record never expires.
    pub expire_ts: u32,
    /// `None` for version-0 records.
    pub timetag: Option<u64>,
    pub user_value: &'a [u8],
}

pub fn encode_record(version: u8, expire_ts: u32, timetag: u64, user_value: &[u8]) -> Vec<u8> {
    let header = if version >= DATA_VERSION_1 { 13 } else { 5 };
    let mut buf = Vec::with_capacity(header + user_value.len());
    buf.push(version);
    buf.extend_from_slice(&expire_ts.to_be_bytes());
    if version >= DATA_VERSION_1 {
        buf.extend_from_slice(&timetag.to_be_bytes());
    }
    buf.extend_from_slice(user_value);
    buf
}

/// Decode a raw value. Returns `None` on a buffer too short for its declared
/// version, which only happens on corruption.
pub fn decode_record(raw: &[u8]) -> Option<DecodedRecord<'_>> {
    if raw.len() < 5 {
        return None;
    }
    let version = raw[0];
    let expire_ts = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
    if version >= DATA_VERSION_1 {
        if raw.len() < 13 {
            return None;
        }
        let timetag = u64::from_be_bytes(raw[5..13].try_into().ok()?);
        Some(DecodedRecord { version, expire_ts, timetag: Some(timetag), user_value: &raw[13..] })
    } else {
        Some(DecodedRecord { version, expire_ts, timetag: None, user_value: &raw[5..] })
    }
}

/// A record with `expire_ts > 0` and `expire_ts <= now` is logically absent.
pub fn check_if_record_expired(expire_ts: u32, now_sec: u32) -> bool {
    expire_ts > 0 && expire_ts <= now_sec
}
