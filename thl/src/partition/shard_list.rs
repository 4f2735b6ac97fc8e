use std::collections::BTreeMap;

use config::shared::UnassignedShardPolicy;

use crate::partition::{CriticalShards, HashPartitioner, Partitioner, PartitionerResponse};
use crate::types::ReplHeader;

/// Routes events through an explicit shard to partition table.
#[derive(Debug, Clone)]
pub struct ShardListPartitioner {
    assignments: BTreeMap<String, u32>,
    unassigned: UnassignedShardPolicy,
    critical_shards: CriticalShards,
}

impl ShardListPartitioner {
    pub fn new(
        assignments: BTreeMap<String, u32>,
        unassigned: UnassignedShardPolicy,
        critical_shards: CriticalShards,
    ) -> Self {
        Self {
            assignments,
            unassigned,
            critical_shards,
        }
    }
}

impl Partitioner for ShardListPartitioner {
    fn partition(&self, header: &ReplHeader, partitions: u32) -> PartitionerResponse {
        let shard_id = header.shard_id.as_str();
        if self.critical_shards.is_critical(shard_id) {
            return PartitionerResponse::new(0, true);
        }

        let partitions = partitions.max(1);
        if let Some(partition) = self.assignments.get(shard_id) {
            // Assignments are validated against the partition count when the queue is built.
            return PartitionerResponse::new(*partition % partitions, false);
        }

        match self.unassigned {
            UnassignedShardPolicy::Hash => {
                PartitionerResponse::new(HashPartitioner::shard_hash(shard_id) % partitions, false)
            }
            UnassignedShardPolicy::Critical => PartitionerResponse::new(0, true),
        }
    }
}
