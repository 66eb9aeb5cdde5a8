//! Process-wide cluster topology for cross-cluster duplication.
//!
//! The local cluster id and the duplication cluster table are set once at
//! startup and immutable afterwards. A replica that never initializes the
//! topology runs with cluster id 0, which makes locally stamped timetags
//! lose against any configured foreign writer.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::ClusterId;

#[derive(Debug, Clone, Default)]
pub struct ClusterTopology {
    pub local_cluster_id: ClusterId,
    /// cluster id -> cluster name, covering every cluster allowed to
    /// duplicate writes into this one (the local cluster included).
    pub clusters: BTreeMap<ClusterId, String>,
}

static TOPOLOGY: OnceLock<ClusterTopology> = OnceLock::new();

/// Install the topology. Returns false if it was already set; the first
/// initialization wins.
pub fn init(topology: ClusterTopology) -> bool {
    TOPOLOGY.set(topology).is_ok()
}

pub fn local_cluster_id() -> ClusterId {
    TOPOLOGY.get().map(|t| t.local_cluster_id).unwrap_or(0)
}

/// Whether `cluster_id` appears in the duplication cluster table.
pub fn is_cluster_id_configured(cluster_id: ClusterId) -> bool {
    TOPOLOGY.get().is_some_and(|t| t.clusters.contains_key(&cluster_id))
}

pub fn cluster_name(cluster_id: ClusterId) -> Option<&'static str> {
    TOPOLOGY.get().and_then(|t| t.clusters.get(&cluster_id).map(String::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    // The OnceLock is process-wide, so all assertions about it live in a
    // single test.
    #[test]
    fn topology_init_and_lookup() {
        assert!(init(ClusterTopology {
            local_cluster_id: 3,
            clusters: BTreeMap::from([(3, "alpha".to_string()), (5, "bravo".to_string())]),
        }));
        // Second init loses.
        assert!(!init(ClusterTopology::default()));

        assert_eq!(local_cluster_id(), 3);
        assert!(is_cluster_id_configured(3));
        assert!(is_cluster_id_configured(5));
        assert!(!is_cluster_id_configured(13));
        assert_eq!(cluster_name(5), Some("bravo"));
        assert_eq!(cluster_name(13), None);
    }
}
