//! Concurrency primitives used by stage tasks.
//!
//! - [`shutdown`] broadcasts shutdown and drain signals to every task of a pipeline.
//! - [`stream`] batches extracted items by size and fill time so tasks can block-commit.
//! - [`interval_guard`] tracks the positions of parallel tasks and throttles tasks that run too
//!   far ahead of the slowest one.

pub mod interval_guard;
pub mod shutdown;
pub mod stream;
