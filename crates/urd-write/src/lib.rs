//! The write path of an Urd replica.
//!
//! The replication layer hands this crate a finalized, ordered
//! `(decree, timestamp, requests)` tuple on the replica's apply thread;
//! [`ServerWrite::on_batched_write_requests`] turns it into exactly one
//! atomic engine commit and a response per request. A non-zero return means
//! the replica is broken (engine failure, injected fault); user-input
//! problems are reported per-response while the decree still advances
//! through an empty put.

pub mod capacity;
pub mod config;
pub mod ingestion;
pub mod metrics;
pub mod server_write;
pub mod write_impl;
pub mod write_service;

pub use config::Settings;
pub use server_write::{ReplicaOptions, ServerWrite};
pub use write_service::WriteService;

#[cfg(test)]
pub(crate) mod test_util {
    use std::collections::BTreeMap;

    use urd_types::cluster;

    /// Topology shared by every test in this crate: we are cluster 3
    /// ("alpha"), cluster 5 ("bravo") may duplicate into us, cluster 13 is
    /// from nowhere.
    pub fn init_topology() {
        cluster::init(cluster::ClusterTopology {
            local_cluster_id: 3,
            clusters: BTreeMap::from([(3, "alpha".to_string()), (5, "bravo".to_string())]),
        });
    }
}
