//! Raw key schema for the data keyspace.
//!
//! A user key is the pair `(hash_key, sort_key)`. On disk the two are packed
//! into one LSM key: `hash_len(2, BE) ++ hash_key ++ sort_key`. The length
//! prefix makes the packing reversible and keeps all sort keys of one hash
//! key adjacent in LSM order.

/// Pack `(hash_key, sort_key)` into a raw LSM key.
///
/// Hash keys longer than `u16::MAX` bytes are rejected by the client layer;
/// here it is a debug assertion.
pub fn compose_raw_key(hash_key: &[u8], sort_key: &[u8]) -> Vec<u8> {
    debug_assert!(hash_key.len() <= u16::MAX as usize, "hash key too long");
    let mut buf = Vec::with_capacity(2 + hash_key.len() + sort_key.len());
    buf.extend_from_slice(&(hash_key.len() as u16).to_be_bytes());
    buf.extend_from_slice(hash_key);
    buf.extend_from_slice(sort_key);
    buf
}

/// Split a raw key back into `(hash_key, sort_key)`. Returns `None` when the
/// buffer is shorter than its own length prefix claims.
pub fn restore_raw_key(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    if raw.len() < 2 {
        return None;
    }
    let hash_len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    if raw.len() < 2 + hash_len {
        return None;
    }
    Some((&raw[2..2 + hash_len], &raw[2 + hash_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let raw = compose_raw_key(b"hash", b"sort");
        let (h, s) = restore_raw_key(&raw).unwrap();
        assert_eq!(h, b"hash");
        assert_eq!(s, b"sort");
    }

    #[test]
    fn round_trip_empty_sort_key() {
        let raw = compose_raw_key(b"hash", b"");
        let (h, s) = restore_raw_key(&raw).unwrap();
        assert_eq!(h, b"hash");
        assert!(s.is_empty());
    }

    #[test]
    fn round_trip_empty_hash_key() {
        let raw = compose_raw_key(b"", b"sort");
        let (h, s) = restore_raw_key(&raw).unwrap();
        assert!(h.is_empty());
        assert_eq!(s, b"sort");
    }

    #[test]
    fn layout_is_length_prefixed() {
        let raw = compose_raw_key(b"abc", b"xy");
        assert_eq!(&raw[..2], &3u16.to_be_bytes());
        assert_eq!(&raw[2..5], b"abc");
        assert_eq!(&raw[5..], b"xy");
    }

    #[test]
    fn sort_keys_of_one_hash_key_are_adjacent() {
        let a = compose_raw_key(b"h", b"s0");
        let b = compose_raw_key(b"h", b"s1");
        let other = compose_raw_key(b"i", b"");
        assert!(a < b);
        assert!(b < other);
    }

    #[test]
    fn restore_rejects_truncated_buffers() {
        assert!(restore_raw_key(b"").is_none());
        assert!(restore_raw_key(&[0x00]).is_none());
        // Claims a 10-byte hash key but carries only 2 bytes.
        assert!(restore_raw_key(&[0x00, 0x0a, b'a', b'b']).is_none());
    }
}
