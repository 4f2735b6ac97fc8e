//! Shared configuration types for replication pipelines and cluster membership.

mod base;
mod batch;
mod cluster;
mod partitioner;
mod pipeline;
mod queue;
mod replicator;

pub use base::ValidationError;
pub use batch::BatchConfig;
pub use cluster::{ClusterConfig, PingConfig, PingMethodConfig};
pub use partitioner::{PartitionerConfig, UnassignedShardPolicy};
pub use pipeline::PipelineConfig;
pub use queue::ParallelQueueConfig;
pub use replicator::{ReplicatorConfig, ReplicatorRole};
