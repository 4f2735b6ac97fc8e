//! Parallel transaction history log (THL) pipeline.
//!
//! Change events flow from a serial log through a [`queue::ParallelQueue`], which fans them out
//! into per-channel bounded queues, to parallel appliers. Stages of a [`pipeline::Pipeline`]
//! connect extractors, filters and appliers, and callers can wait on positions through
//! [`watch`] futures.

pub mod concurrency;
pub mod error;
pub mod failpoints;
pub mod log;
mod macros;
pub mod metrics;
pub mod partition;
pub mod pipeline;
pub mod queue;
pub mod status;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod watch;
