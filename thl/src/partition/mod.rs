//! Routing of events to parallel queue channels.
//!
//! A [`Partitioner`] maps an event header to a channel index and flags events that must be
//! serialized across every channel. Routing is a pure function of the shard id, so a shard keeps
//! its channel for the lifetime of a pipeline.

mod hash;
mod shard_list;

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use config::shared::PartitionerConfig;

pub use hash::HashPartitioner;
pub use shard_list::ShardListPartitioner;

use crate::types::{ReplHeader, UNKNOWN_SHARD_ID};

/// Channel chosen for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionerResponse {
    pub partition: u32,
    /// Whether the event must be serialized against all channels.
    pub critical: bool,
}

impl PartitionerResponse {
    pub fn new(partition: u32, critical: bool) -> Self {
        Self {
            partition,
            critical,
        }
    }
}

/// Maps an event to one of `partitions` channels.
pub trait Partitioner: Send + Sync + Debug {
    fn partition(&self, header: &ReplHeader, partitions: u32) -> PartitionerResponse;
}

/// Shard ids whose events cannot be attributed to a single channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriticalShards {
    shards: BTreeSet<String>,
}

impl CriticalShards {
    pub fn new(shards: BTreeSet<String>) -> Self {
        Self { shards }
    }

    /// The unknown-shard sentinel, an empty shard id and any configured shard are critical.
    pub fn is_critical(&self, shard_id: &str) -> bool {
        shard_id.is_empty() || shard_id == UNKNOWN_SHARD_ID || self.shards.contains(shard_id)
    }
}

/// Builds the partitioner described by `config`.
pub fn build_partitioner(config: &PartitionerConfig) -> Arc<dyn Partitioner> {
    let critical_shards = CriticalShards::new(config.critical_shards().clone());

    match config {
        PartitionerConfig::Hash { .. } => Arc::new(HashPartitioner::new(critical_shards)),
        PartitionerConfig::ShardList {
            assignments,
            unassigned,
            ..
        } => Arc::new(ShardListPartitioner::new(
            assignments.clone(),
            *unassigned,
            critical_shards,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_and_empty_shards_are_always_critical() {
        let critical = CriticalShards::new(BTreeSet::from(["ddl".to_string()]));

        assert!(critical.is_critical(UNKNOWN_SHARD_ID));
        assert!(critical.is_critical(""));
        assert!(critical.is_critical("ddl"));
        assert!(!critical.is_critical("db0"));
    }
}
