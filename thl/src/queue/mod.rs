//! Fan-out of a serial event stream into bounded per-channel queues.

mod parallel;

pub use parallel::ParallelQueue;
