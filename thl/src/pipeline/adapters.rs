//! Extractors and appliers connecting stages through a serial log or a parallel queue.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ThlResult;
use crate::log::{LogCursor, SerialLog};
use crate::pipeline::components::{Applier, Extractor};
use crate::queue::ParallelQueue;
use crate::types::{ReplEvent, ReplItem, TaskId};

/// Reads events from a [`SerialLog`] until the log is closed.
#[derive(Debug)]
pub struct LogExtractor {
    log: Arc<dyn SerialLog>,
    cursor: LogCursor,
}

impl LogExtractor {
    pub fn new(log: Arc<dyn SerialLog>, cursor: LogCursor) -> Self {
        Self { log, cursor }
    }
}

#[async_trait]
impl Extractor for LogExtractor {
    async fn extract(&mut self) -> ThlResult<Option<ReplItem>> {
        let event = self.log.next(&mut self.cursor).await?;

        Ok(event.map(ReplItem::Event))
    }
}

/// Appends events to a [`SerialLog`] and closes it once the stage input is exhausted.
#[derive(Debug)]
pub struct LogApplier {
    log: Arc<dyn SerialLog>,
}

impl LogApplier {
    pub fn new(log: Arc<dyn SerialLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Applier for LogApplier {
    async fn apply(&mut self, event: ReplEvent) -> ThlResult<()> {
        self.log.append(event).await
    }

    async fn commit(&mut self) -> ThlResult<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> ThlResult<()> {
        Ok(())
    }

    async fn release(&mut self) -> ThlResult<()> {
        debug!(last_seqno = ?self.log.last_seqno(), "closing serial log");
        self.log.close();

        Ok(())
    }
}

/// Reads the channel of a [`ParallelQueue`] owned by one task.
#[derive(Debug)]
pub struct ParallelQueueExtractor {
    queue: ParallelQueue,
    task_id: TaskId,
}

impl ParallelQueueExtractor {
    pub fn new(queue: ParallelQueue, task_id: TaskId) -> Self {
        Self { queue, task_id }
    }
}

#[async_trait]
impl Extractor for ParallelQueueExtractor {
    async fn extract(&mut self) -> ThlResult<Option<ReplItem>> {
        self.queue.get(self.task_id).await.map(Some)
    }
}

/// Puts events into a [`ParallelQueue`] and stops its consumers once the stage input is exhausted.
#[derive(Debug)]
pub struct ParallelQueueApplier {
    queue: ParallelQueue,
}

impl ParallelQueueApplier {
    pub fn new(queue: ParallelQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Applier for ParallelQueueApplier {
    async fn apply(&mut self, event: ReplEvent) -> ThlResult<()> {
        self.queue.put(event).await
    }

    async fn commit(&mut self) -> ThlResult<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> ThlResult<()> {
        Ok(())
    }

    async fn release(&mut self) -> ThlResult<()> {
        self.queue.insert_stop_event().await
    }
}
