//! Metric names and labels recorded through the [`metrics`] facade.

/// Label for pipeline ID in metrics.
pub const PIPELINE_ID_LABEL: &str = "pipeline_id";

/// Label for the stage name in metrics.
pub const STAGE_LABEL: &str = "stage";

/// Label for the parallel queue name in metrics.
pub const QUEUE_LABEL: &str = "queue";

// Parallel queue metrics

/// Counter for events put into a parallel queue.
pub const THL_QUEUE_EVENTS_TOTAL: &str = "thl_queue_events_total";

/// Counter for critical transactions serialized across all channels.
pub const THL_QUEUE_SERIALIZATIONS_TOTAL: &str = "thl_queue_serializations_total";

/// Counter for items dropped from channels by an immediate shutdown.
pub const THL_QUEUE_DISCARDED_TOTAL: &str = "thl_queue_discarded_total";

// Stage metrics

/// Counter for events applied by stage tasks.
pub const THL_STAGE_EVENTS_APPLIED_TOTAL: &str = "thl_stage_events_applied_total";

/// Counter for commits performed by stage tasks.
pub const THL_STAGE_COMMITS_TOTAL: &str = "thl_stage_commits_total";
