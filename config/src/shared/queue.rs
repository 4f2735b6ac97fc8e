use serde::Deserialize;

use crate::shared::{PartitionerConfig, ValidationError};

/// Configuration of the parallel queue that fans a serial stream out into channels.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ParallelQueueConfig {
    /// Number of channels, and therefore of apply tasks.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Capacity of every channel; a full channel blocks the producer.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Whether sync control events are broadcast every `sync_interval` events.
    #[serde(default = "default_sync_enabled")]
    pub sync_enabled: bool,
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,
    /// Upper bound on quiescing all channels before a serialized event is delivered.
    #[serde(default = "default_serialization_timeout_ms")]
    pub serialization_timeout_ms: u64,
    #[serde(default)]
    pub partitioner: PartitionerConfig,
}

impl ParallelQueueConfig {
    pub const DEFAULT_PARTITIONS: u32 = 1;
    pub const DEFAULT_MAX_SIZE: usize = 10;
    pub const DEFAULT_SYNC_INTERVAL: u64 = 2000;
    pub const DEFAULT_SERIALIZATION_TIMEOUT_MS: u64 = 60_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.partitions == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "queue.partitions".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.max_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "queue.max_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if self.sync_enabled && self.sync_interval == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "queue.sync_interval".to_string(),
                constraint: "must be greater than 0 when sync is enabled".to_string(),
            });
        }

        self.partitioner.validate(self.partitions)
    }
}

impl Default for ParallelQueueConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            max_size: default_max_size(),
            sync_enabled: default_sync_enabled(),
            sync_interval: default_sync_interval(),
            serialization_timeout_ms: default_serialization_timeout_ms(),
            partitioner: PartitionerConfig::default(),
        }
    }
}

fn default_partitions() -> u32 {
    ParallelQueueConfig::DEFAULT_PARTITIONS
}

fn default_max_size() -> usize {
    ParallelQueueConfig::DEFAULT_MAX_SIZE
}

fn default_sync_enabled() -> bool {
    true
}

fn default_sync_interval() -> u64 {
    ParallelQueueConfig::DEFAULT_SYNC_INTERVAL
}

fn default_serialization_timeout_ms() -> u64 {
    ParallelQueueConfig::DEFAULT_SERIALIZATION_TIMEOUT_MS
}
