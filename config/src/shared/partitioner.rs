use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::shared::ValidationError;

/// What a shard-list partitioner does with shards missing from its assignment table.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedShardPolicy {
    /// Route the shard by hashing its identifier.
    #[default]
    Hash,
    /// Treat the shard as ambiguous and serialize it across all channels.
    Critical,
}

/// Selects how events are routed to parallel queue channels.
///
/// Shards listed in `critical_shards` are always serialized, in addition to the unknown-shard
/// sentinel and empty shard identifiers.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionerConfig {
    Hash {
        #[serde(default)]
        critical_shards: BTreeSet<String>,
    },
    ShardList {
        assignments: BTreeMap<String, u32>,
        #[serde(default)]
        critical_shards: BTreeSet<String>,
        #[serde(default)]
        unassigned: UnassignedShardPolicy,
    },
}

impl PartitionerConfig {
    pub fn critical_shards(&self) -> &BTreeSet<String> {
        match self {
            PartitionerConfig::Hash { critical_shards } => critical_shards,
            PartitionerConfig::ShardList {
                critical_shards, ..
            } => critical_shards,
        }
    }

    /// Checks that every explicit assignment targets an existing partition.
    pub fn validate(&self, partitions: u32) -> Result<(), ValidationError> {
        if let PartitionerConfig::ShardList { assignments, .. } = self {
            for (shard, partition) in assignments {
                if *partition >= partitions {
                    return Err(ValidationError::ShardAssignmentOutOfRange {
                        shard: shard.clone(),
                        partition: *partition,
                        partitions,
                    });
                }
            }
        }

        Ok(())
    }
}

impl Default for PartitionerConfig {
    fn default() -> Self {
        PartitionerConfig::Hash {
            critical_shards: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_shard_list_partitioner() {
        let config: PartitionerConfig = serde_json::from_str(
            r#"{"type": "shard_list", "assignments": {"db0": 0, "db1": 2}, "unassigned": "critical"}"#,
        )
        .unwrap();

        let PartitionerConfig::ShardList {
            assignments,
            unassigned,
            critical_shards,
        } = &config
        else {
            panic!("expected shard list partitioner");
        };
        assert_eq!(assignments.get("db1"), Some(&2));
        assert_eq!(*unassigned, UnassignedShardPolicy::Critical);
        assert!(critical_shards.is_empty());
        assert!(config.validate(3).is_ok());
        assert_eq!(
            config.validate(2),
            Err(ValidationError::ShardAssignmentOutOfRange {
                shard: "db1".to_string(),
                partition: 2,
                partitions: 2,
            })
        );
    }
}
