use crate::partition::{CriticalShards, Partitioner, PartitionerResponse};
use crate::types::ReplHeader;

/// Routes events by hashing their shard id.
///
/// Critical events go to partition 0.
#[derive(Debug, Clone, Default)]
pub struct HashPartitioner {
    critical_shards: CriticalShards,
}

impl HashPartitioner {
    pub fn new(critical_shards: CriticalShards) -> Self {
        Self { critical_shards }
    }

    /// Polynomial string hash over UTF-16 code units with multiplier 31.
    ///
    /// Stable across runs and platforms, unlike the std hasher which is randomly seeded.
    pub fn shard_hash(shard_id: &str) -> u32 {
        shard_id
            .encode_utf16()
            .fold(0u32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as u32))
    }
}

impl Partitioner for HashPartitioner {
    fn partition(&self, header: &ReplHeader, partitions: u32) -> PartitionerResponse {
        if self.critical_shards.is_critical(&header.shard_id) {
            return PartitionerResponse::new(0, true);
        }

        PartitionerResponse::new(Self::shard_hash(&header.shard_id) % partitions.max(1), false)
    }
}
