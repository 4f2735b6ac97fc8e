use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use config::shared::BatchConfig;

use crate::concurrency::interval_guard::SharedIntervalGuard;
use crate::error::ThlResult;
use crate::pipeline::components::{
    Applier, ApplierFactory, Extractor, ExtractorFactory, Filter,
};
use crate::queue::ParallelQueue;
use crate::status::StatusProperties;
use crate::types::{ReplHeader, TaskId};
use crate::watch::WatchRegistry;

/// Bound on how far a task may run ahead of the slowest task of its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskThrottle {
    pub max_drift: Duration,
    pub poll_interval: Duration,
}

/// Describes a stage before the pipeline starts it.
pub struct StageBuilder {
    pub(crate) name: String,
    pub(crate) task_count: usize,
    pub(crate) extractor_factory: ExtractorFactory,
    pub(crate) applier_factory: ApplierFactory,
    pub(crate) filters: Vec<Arc<dyn Filter>>,
    pub(crate) batch: BatchConfig,
    pub(crate) sync_source: Option<ParallelQueue>,
    pub(crate) throttle: Option<TaskThrottle>,
}

impl StageBuilder {
    /// Creates a stage run by `task_count` tasks, each with its own extractor and applier.
    pub fn new<E, A>(name: impl Into<String>, task_count: usize, extractor: E, applier: A) -> Self
    where
        E: Fn(TaskId) -> ThlResult<Box<dyn Extractor>> + Send + Sync + 'static,
        A: Fn(TaskId) -> ThlResult<Box<dyn Applier>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            task_count,
            extractor_factory: Arc::new(extractor),
            applier_factory: Arc::new(applier),
            filters: Vec::new(),
            batch: BatchConfig::default(),
            sync_source: None,
            throttle: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Sets the queue the stage reads from.
    ///
    /// Watches on the stage insert sync events into this queue so that every task reaches the
    /// watched position, and its channels are discarded on an immediate shutdown. Tasks report
    /// their commits to the queue, so critical events wait for earlier work to be committed.
    pub fn with_sync_source(mut self, queue: ParallelQueue) -> Self {
        self.sync_source = Some(queue);
        self
    }

    pub fn with_task_drift(mut self, max_drift: Duration, poll_interval: Duration) -> Self {
        self.throttle = Some(TaskThrottle {
            max_drift,
            poll_interval,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }
}

impl fmt::Debug for StageBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageBuilder")
            .field("name", &self.name)
            .field("task_count", &self.task_count)
            .field("filters", &self.filters)
            .field("batch", &self.batch)
            .field("sync_source", &self.sync_source)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

/// Positions shared by the tasks of a running stage.
#[derive(Debug)]
pub struct Stage {
    name: String,
    task_count: usize,
    sync_source: Option<ParallelQueue>,
    processed: WatchRegistry<ReplHeader>,
    committed: WatchRegistry<ReplHeader>,
    guard: SharedIntervalGuard<ReplHeader>,
}

impl Stage {
    pub(crate) fn new(name: String, task_count: usize, sync_source: Option<ParallelQueue>) -> Self {
        if let Some(queue) = &sync_source {
            queue.track_commits();
        }

        Self {
            name,
            task_count,
            sync_source,
            processed: WatchRegistry::new(task_count),
            committed: WatchRegistry::new(task_count),
            guard: SharedIntervalGuard::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    pub fn sync_source(&self) -> Option<&ParallelQueue> {
        self.sync_source.as_ref()
    }

    /// Watches offered every event as a task sees it.
    pub fn processed_watches(&self) -> &WatchRegistry<ReplHeader> {
        &self.processed
    }

    /// Watches offered the last committed position of a task.
    pub fn committed_watches(&self) -> &WatchRegistry<ReplHeader> {
        &self.committed
    }

    pub fn guard(&self) -> &SharedIntervalGuard<ReplHeader> {
        &self.guard
    }

    pub(crate) fn cancel_watches(&self) {
        self.processed.cancel_all();
        self.committed.cancel_all();
    }

    pub fn status(&self) -> StatusProperties {
        let mut status = StatusProperties::new();
        status.set("taskCount", self.task_count as u64);

        self.guard.with(|guard| {
            status.set("lowSeqno", guard.low_seqno().unwrap_or(-1));
            status.set("highSeqno", guard.hi_seqno().unwrap_or(-1));
            status.set(
                "lowLatency",
                guard.low_latency().map_or(0.0, |latency| latency.as_secs_f64()),
            );
            status.set(
                "highLatency",
                guard.hi_latency().map_or(0.0, |latency| latency.as_secs_f64()),
            );
        });

        status.set("pendingProcessedWatches", self.processed.pending() as u64);
        status.set("pendingCommittedWatches", self.committed.pending() as u64);

        status
    }
}
