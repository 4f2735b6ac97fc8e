use serde::Deserialize;

use crate::Config;
use crate::shared::{ClusterConfig, PipelineConfig, ValidationError};

/// Role of a replicator within its cluster.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatorRole {
    /// Accepts writes; must belong to the primary partition to go online.
    Master,
    #[default]
    Slave,
}

/// Complete configuration of the replicator service.
///
/// Aggregates pipeline settings and the optional cluster membership used for quorum checks.
#[derive(Clone, Debug, Deserialize)]
pub struct ReplicatorConfig {
    #[serde(default)]
    pub role: ReplicatorRole,
    pub pipeline: PipelineConfig,
    /// Cluster membership; when absent the replicator runs standalone.
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
}

impl ReplicatorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pipeline.validate()?;

        if let Some(cluster) = &self.cluster {
            cluster.validate()?;
        }

        Ok(())
    }
}

impl Config for ReplicatorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[
        "cluster.configured_members",
        "cluster.witness_hosts",
        "cluster.ping.methods",
    ];
}
