//! Common types used throughout the THL pipeline.

mod event;

pub use event::*;

/// Monotonic transaction sequence number.
pub type Seqno = i64;

/// Index of a task within a stage; parallel apply task `i` owns channel `i`.
pub type TaskId = usize;

pub type PipelineId = u64;

/// Shard id of events whose scope cannot be attributed to a single shard.
pub const UNKNOWN_SHARD_ID: &str = "#UNKNOWN";
