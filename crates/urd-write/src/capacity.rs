//! Capacity-unit accounting for per-tenant usage metering.
//!
//! Each applied operation is charged `ceil(bytes / unit_size)` read or write
//! units; unit sizes are powers of two so the division is a shift. Only the
//! primary replica accounts (the write service gates on that), and failed
//! operations are never charged.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use urd_types::rpc::{KeyValue, Mutate};
use urd_types::status;

use crate::metrics::WriteMetrics;

pub struct CapacityUnitCalculator {
    metrics: Arc<WriteMetrics>,
    read_cu_size_log: u32,
    write_cu_size_log: u32,
}

impl CapacityUnitCalculator {
    /// `read_cu_size` / `write_cu_size` are bytes per unit and must be
    /// powers of two (validated at config load).
    pub fn new(metrics: Arc<WriteMetrics>, read_cu_size: u64, write_cu_size: u64) -> Self {
        debug_assert!(read_cu_size.is_power_of_two());
        debug_assert!(write_cu_size.is_power_of_two());
        CapacityUnitCalculator {
            metrics,
            read_cu_size_log: read_cu_size.trailing_zeros(),
            write_cu_size_log: write_cu_size.trailing_zeros(),
        }
    }

    fn add_read_cu(&self, read_data_size: u64) -> u64 {
        let cu = if read_data_size > 0 {
            ((read_data_size - 1) >> self.read_cu_size_log) + 1
        } else {
            1
        };
        self.metrics.read_cu.fetch_add(cu, Ordering::Relaxed);
        cu
    }

    fn add_write_cu(&self, write_data_size: u64) -> u64 {
        let cu = if write_data_size > 0 {
            ((write_data_size - 1) >> self.write_cu_size_log) + 1
        } else {
            1
        };
        self.metrics.write_cu.fetch_add(cu, Ordering::Relaxed);
        cu
    }

    // -- read side ---------------------------------------------------------

    pub fn add_get_cu(&self, status: i32, key: &[u8], value: &[u8]) {
        if status != status::OK {
            return;
        }
        let bytes = (key.len() + value.len()) as u64;
        self.metrics.get_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.add_read_cu(bytes);
    }

    pub fn add_multi_get_cu(&self, status: i32, hash_key: &[u8], kvs: &[KeyValue]) {
        if status != status::OK {
            return;
        }
        let bytes = hash_key.len() as u64
            + kvs.iter().map(|kv| (kv.key.len() + kv.value.len()) as u64).sum::<u64>();
        self.metrics.multi_get_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.add_read_cu(bytes);
    }

    pub fn add_scan_cu(&self, status: i32, kvs: &[KeyValue]) {
        if status != status::OK {
            return;
        }
        let bytes = kvs.iter().map(|kv| (kv.key.len() + kv.value.len()) as u64).sum::<u64>();
        self.metrics.scan_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.add_read_cu(bytes);
    }

    pub fn add_sortkey_count_cu(&self, status: i32, hash_key: &[u8]) {
        if status != status::OK {
            return;
        }
        self.add_read_cu(hash_key.len() as u64);
    }

    pub fn add_ttl_cu(&self, status: i32, key: &[u8]) {
        if status != status::OK {
            return;
        }
        self.add_read_cu(key.len() as u64);
    }

    // -- write side --------------------------------------------------------

    pub fn add_put_cu(&self, status: i32, key: &[u8], value: &[u8]) {
        if status != status::OK {
            return;
        }
        let bytes = (key.len() + value.len()) as u64;
        self.metrics.put_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.add_write_cu(bytes);
    }

    pub fn add_remove_cu(&self, status: i32, key: &[u8]) {
        if status != status::OK {
            return;
        }
        self.add_write_cu(key.len() as u64);
    }

    pub fn add_multi_put_cu(&self, status: i32, hash_key: &[u8], kvs: &[KeyValue]) {
        if status != status::OK {
            return;
        }
        let bytes = hash_key.len() as u64
            + kvs.iter().map(|kv| (kv.key.len() + kv.value.len()) as u64).sum::<u64>();
        self.metrics.multi_put_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.add_write_cu(bytes);
    }

    pub fn add_multi_remove_cu(&self, status: i32, hash_key: &[u8], sort_keys: &[Vec<u8>]) {
        if status != status::OK {
            return;
        }
        let bytes =
            hash_key.len() as u64 + sort_keys.iter().map(|sk| sk.len() as u64).sum::<u64>();
        self.add_write_cu(bytes);
    }

    pub fn add_incr_cu(&self, status: i32, key: &[u8]) {
        if status != status::OK {
            return;
        }
        self.add_write_cu(key.len() as u64);
    }

    pub fn add_check_and_set_cu(
        &self,
        status: i32,
        hash_key: &[u8],
        check_sort_key: &[u8],
        set_sort_key: &[u8],
        value: &[u8],
    ) {
        if status != status::OK {
            return;
        }
        let bytes =
            (hash_key.len() + check_sort_key.len() + set_sort_key.len() + value.len()) as u64;
        self.metrics.check_and_set_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.add_write_cu(bytes);
    }

    pub fn add_check_and_mutate_cu(
        &self,
        status: i32,
        hash_key: &[u8],
        check_sort_key: &[u8],
        mutate_list: &[Mutate],
    ) {
        if status != status::OK {
            return;
        }
        let bytes = (hash_key.len() + check_sort_key.len()) as u64
            + mutate_list.iter().map(|m| (m.sort_key.len() + m.value.len()) as u64).sum::<u64>();
        self.metrics.check_and_mutate_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.add_write_cu(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use urd_types::ReplicaId;

    fn calc(read_size: u64, write_size: u64) -> (Arc<WriteMetrics>, CapacityUnitCalculator) {
        let metrics = WriteMetrics::new(ReplicaId { app_id: 1, partition_index: 0 });
        let calc = CapacityUnitCalculator::new(Arc::clone(&metrics), read_size, write_size);
        (metrics, calc)
    }

    fn write_cu(metrics: &WriteMetrics) -> u64 {
        metrics.write_cu.load(Ordering::Relaxed)
    }

    fn read_cu(metrics: &WriteMetrics) -> u64 {
        metrics.read_cu.load(Ordering::Relaxed)
    }

    #[test]
    fn units_are_ceil_divided() {
        let (metrics, calc) = calc(4096, 4096);
        calc.add_put_cu(status::OK, &[0u8; 1], &[0u8; 1]); // 2 bytes -> 1 unit
        assert_eq!(write_cu(&metrics), 1);
        calc.add_put_cu(status::OK, &[0u8; 4096], &[0u8; 1]); // 4097 -> 2 units
        assert_eq!(write_cu(&metrics), 3);
        calc.add_put_cu(status::OK, &[0u8; 2048], &[0u8; 2048]); // 4096 -> 1 unit
        assert_eq!(write_cu(&metrics), 4);
    }

    #[test]
    fn zero_bytes_still_charges_one_unit() {
        let (metrics, calc) = calc(4096, 4096);
        calc.add_remove_cu(status::OK, b"");
        assert_eq!(write_cu(&metrics), 1);
        calc.add_ttl_cu(status::OK, b"");
        assert_eq!(read_cu(&metrics), 1);
    }

    #[test]
    fn failed_operations_are_not_charged() {
        let (metrics, calc) = calc(4096, 4096);
        calc.add_put_cu(status::INVALID_ARGUMENT, b"key", b"value");
        calc.add_get_cu(status::NOT_FOUND, b"key", b"");
        calc.add_multi_remove_cu(status::TRY_AGAIN, b"h", &[b"s".to_vec()]);
        assert_eq!(write_cu(&metrics), 0);
        assert_eq!(read_cu(&metrics), 0);
        assert_eq!(metrics.put_bytes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn multi_put_charges_hash_key_and_all_pairs() {
        let (metrics, calc) = calc(4096, 8);
        let kvs = vec![
            KeyValue { key: b"s0".to_vec(), value: b"v0".to_vec() },
            KeyValue { key: b"s1".to_vec(), value: b"v1".to_vec() },
        ];
        // 1 + 4 * 2 = 9 bytes -> 2 units at 8 bytes/unit.
        calc.add_multi_put_cu(status::OK, b"h", &kvs);
        assert_eq!(write_cu(&metrics), 2);
        assert_eq!(metrics.multi_put_bytes.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn check_and_mutate_charges_mutations() {
        let (metrics, calc) = calc(4096, 4096);
        let mutate_list = vec![
            Mutate { operation: 0, sort_key: b"s".to_vec(), value: b"v".to_vec(), set_expire_ts_seconds: 0 },
            Mutate { operation: 1, sort_key: b"t".to_vec(), value: Vec::new(), set_expire_ts_seconds: 0 },
        ];
        calc.add_check_and_mutate_cu(status::OK, b"h", b"c", &mutate_list);
        assert_eq!(metrics.check_and_mutate_bytes.load(Ordering::Relaxed), 2 + 2 + 1);
        assert_eq!(write_cu(&metrics), 1);
    }

    #[test]
    fn read_side_charging() {
        let (metrics, calc) = calc(8, 4096);
        calc.add_get_cu(status::OK, &[0u8; 8], &[0u8; 9]); // 17 -> 3 units
        assert_eq!(read_cu(&metrics), 3);
        assert_eq!(metrics.get_bytes.load(Ordering::Relaxed), 17);

        let kvs = vec![KeyValue { key: b"k".to_vec(), value: b"v".to_vec() }];
        calc.add_scan_cu(status::OK, &kvs);
        assert_eq!(metrics.scan_bytes.load(Ordering::Relaxed), 2);
    }
}
