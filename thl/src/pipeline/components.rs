//! Components a stage task strings together: an extractor, filters and an applier.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ThlResult;
use crate::types::{ReplEvent, ReplItem, TaskId};

/// Source of the items processed by a stage task.
#[async_trait]
pub trait Extractor: Send {
    async fn connect(&mut self) -> ThlResult<()> {
        Ok(())
    }

    /// Returns the next item, waiting until one is available, or `None` at the end of input.
    async fn extract(&mut self) -> ThlResult<Option<ReplItem>>;

    async fn disconnect(&mut self) -> ThlResult<()> {
        Ok(())
    }
}

/// Transforms or drops events between extraction and apply.
pub trait Filter: Send + Sync + Debug {
    /// Returns the event to apply, or `None` to drop it.
    fn filter(&self, event: ReplEvent) -> ThlResult<Option<ReplEvent>>;
}

/// Target of the events processed by a stage task.
///
/// A task applies events one by one and commits on transaction boundaries, either when a batch
/// is complete or when a control event asks for it.
#[async_trait]
pub trait Applier: Send {
    async fn connect(&mut self) -> ThlResult<()> {
        Ok(())
    }

    async fn apply(&mut self, event: ReplEvent) -> ThlResult<()>;

    async fn commit(&mut self) -> ThlResult<()>;

    async fn rollback(&mut self) -> ThlResult<()>;

    /// Called once the task consumed all of its input, after the last commit.
    async fn release(&mut self) -> ThlResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> ThlResult<()> {
        Ok(())
    }
}

/// Creates the extractor of each task of a stage.
pub type ExtractorFactory = Arc<dyn Fn(TaskId) -> ThlResult<Box<dyn Extractor>> + Send + Sync>;

/// Creates the applier of each task of a stage.
pub type ApplierFactory = Arc<dyn Fn(TaskId) -> ThlResult<Box<dyn Applier>> + Send + Sync>;
