use serde::Deserialize;

use crate::shared::{BatchConfig, ParallelQueueConfig, ValidationError};

/// Configuration of a replication pipeline.
///
/// Contains the settings needed to run the extract, fan-out and parallel apply stages of one
/// replication service.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// The unique identifier for this pipeline.
    pub id: u64,
    /// Name of the replication service this pipeline belongs to, used in logs and status.
    pub service_name: String,
    /// Block-commit policy of every stage task.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Parallel queue feeding the apply tasks.
    #[serde(default)]
    pub queue: ParallelQueueConfig,
    /// Maximum source-time distance, in milliseconds, between the fastest and slowest apply task.
    ///
    /// When unset, apply tasks are never throttled.
    #[serde(default)]
    pub max_task_drift_ms: Option<u64>,
    /// Interval at which throttled tasks re-check the slowest task position.
    #[serde(default = "default_guard_poll_interval_ms")]
    pub guard_poll_interval_ms: u64,
}

impl PipelineConfig {
    pub const DEFAULT_GUARD_POLL_INTERVAL_MS: u64 = 1000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.batch.validate()?;
        self.queue.validate()?;

        if self.guard_poll_interval_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "pipeline.guard_poll_interval_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

fn default_guard_poll_interval_ms() -> u64 {
    PipelineConfig::DEFAULT_GUARD_POLL_INTERVAL_MS
}
