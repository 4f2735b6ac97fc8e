//! Helpers for tests of THL pipelines.

pub mod applier;
pub mod event;
pub mod extractor;
pub mod notify;
