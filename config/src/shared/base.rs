use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A numeric field holds a value outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// A shard is assigned to a partition that does not exist.
    #[error("shard `{shard}` is assigned to partition {partition} but only {partitions} partitions exist")]
    ShardAssignmentOutOfRange {
        shard: String,
        partition: u32,
        partitions: u32,
    },
    /// The local member name is empty.
    #[error("`cluster.member_name` cannot be empty")]
    EmptyMemberName,
    /// Reachability probing has no methods to try.
    #[error("`cluster.ping.methods` must contain at least one method")]
    NoPingMethods,
}
