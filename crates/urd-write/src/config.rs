//! Write-path configuration.
//!
//! Layered the usual way: baked-in defaults from `config/default.toml`,
//! then an optional config file, then `URD_`-prefixed environment variables
//! (`URD_SERVER__VERBOSE_LOG=true`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use urd_types::cluster::ClusterTopology;
use urd_types::ClusterId;

const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    /// A duplicated write older than this is counted as a lagging write.
    pub dup_lagging_write_threshold_ms: u64,
    /// Record schema version stamped on every write (1 carries timetags).
    pub data_version: u8,
    pub verbose_log: bool,
    pub bulk_load_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct CapacitySettings {
    /// Bytes per read capacity unit; power of two.
    pub read_capacity_unit_size: u64,
    /// Bytes per write capacity unit; power of two.
    pub write_capacity_unit_size: u64,
}

#[derive(Debug, Deserialize)]
pub struct DuplicationSettings {
    pub local_cluster_id: ClusterId,
    /// cluster name -> cluster id for every cluster allowed to duplicate
    /// writes into this one.
    pub clusters: BTreeMap<String, ClusterId>,
}

impl DuplicationSettings {
    /// The process-wide topology to install at startup via
    /// [`urd_types::cluster::init`].
    pub fn topology(&self) -> ClusterTopology {
        ClusterTopology {
            local_cluster_id: self.local_cluster_id,
            clusters: self.clusters.iter().map(|(name, id)| (*id, name.clone())).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub capacity: CapacitySettings,
    pub duplication: DuplicationSettings,
}

impl Settings {
    /// Load defaults, then `path` (if given), then environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Settings> {
        let mut figment = Figment::new().merge(Toml::string(DEFAULT_CONFIG));
        if let Some(path) = path {
            figment = figment.merge(Toml::file_exact(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed("URD_").split("__"))
            .extract()
            .context("failed to load configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.capacity.read_capacity_unit_size.is_power_of_two(),
            "read_capacity_unit_size must be a power of two, got {}",
            self.capacity.read_capacity_unit_size
        );
        anyhow::ensure!(
            self.capacity.write_capacity_unit_size.is_power_of_two(),
            "write_capacity_unit_size must be a power of two, got {}",
            self.capacity.write_capacity_unit_size
        );
        Ok(())
    }
}
