//! Orchestration of extract, filter and apply stages.
//!
//! A [`Pipeline`] runs a sequence of stages, each with one or more tasks. Stages are connected
//! through stores such as a [`crate::log::SerialLog`] or a [`crate::queue::ParallelQueue`]; the
//! [`adapters`] module provides the extractors and appliers doing so. The pipeline exposes
//! watches on the positions reached by its last stage.

pub mod adapters;
pub mod components;
pub mod stage;
mod task;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use config::shared::PipelineConfig;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span};

use crate::bail;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, ThlError, ThlResult};
use crate::pipeline::stage::{Stage, StageBuilder};
use crate::pipeline::task::{StageTask, TaskContext, TaskSignals};
use crate::status::StatusProperties;
use crate::thl_error;
use crate::types::{PipelineId, ReplHeader, Seqno, TaskId};
use crate::watch::{
    SeqnoWatchPredicate, SourceTimestampWatchPredicate, WatchFuture, WatchPredicate, WatchScope,
};

/// How a running pipeline stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Ends the input of the first stage; every stage then drains what it has and stops.
    Clean,
    /// Stops every task at once and discards the contents of the queues.
    Immediate,
}

/// Sends shutdown requests to a running pipeline.
#[derive(Debug, Clone)]
pub struct PipelineShutdown {
    shutdown_tx: ShutdownTx,
    drain_tx: ShutdownTx,
    discard: Arc<AtomicBool>,
}

impl PipelineShutdown {
    pub fn shutdown(&self, mode: ShutdownMode) {
        info!(?mode, "trying to shut down the pipeline");

        let result = match mode {
            ShutdownMode::Clean => self.drain_tx.shutdown(),
            ShutdownMode::Immediate => {
                self.discard.store(true, Ordering::Release);
                self.shutdown_tx.shutdown()
            }
        };

        // No receiver left means every task already finished.
        if let Err(err) = result {
            debug!("no stage task received the shutdown signal: {}", err);
            return;
        }

        info!("shut down signal successfully sent to all stage tasks");
    }
}

type TaskResult = (String, TaskId, ThlResult<()>);

#[derive(Debug)]
enum PipelineState {
    NotStarted,
    Started {
        stages: Vec<Arc<Stage>>,
        tasks: Vec<JoinHandle<TaskResult>>,
    },
}

#[derive(Debug)]
pub struct Pipeline {
    id: PipelineId,
    config: Arc<PipelineConfig>,
    builders: Vec<StageBuilder>,
    state: PipelineState,
    shutdown: PipelineShutdown,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        // Receivers are created per task through `subscribe`.
        let (shutdown_tx, _) = create_shutdown_channel();
        let (drain_tx, _) = create_shutdown_channel();

        Self {
            id: config.id,
            config: Arc::new(config),
            builders: Vec::new(),
            state: PipelineState::NotStarted,
            shutdown: PipelineShutdown {
                shutdown_tx,
                drain_tx,
                discard: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// Appends a stage. Stages run in the order they are added.
    pub fn add_stage(&mut self, stage: StageBuilder) -> &mut Self {
        self.builders.push(stage);
        self
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> PipelineShutdown {
        self.shutdown.clone()
    }

    pub fn stages(&self) -> &[Arc<Stage>] {
        match &self.state {
            PipelineState::NotStarted => &[],
            PipelineState::Started { stages, .. } => stages,
        }
    }

    pub fn start(&mut self) -> ThlResult<()> {
        if matches!(self.state, PipelineState::Started { .. }) {
            bail!(ErrorKind::InvalidState, "Pipeline already started");
        }
        if self.builders.is_empty() {
            bail!(
                ErrorKind::ConfigError,
                "Pipeline has no stages",
                format!("pipeline {}", self.id)
            );
        }

        info!(
            "starting pipeline for service '{}' with id {}",
            self.config.service_name, self.id
        );

        for builder in &self.builders {
            if builder.task_count == 0 {
                bail!(
                    ErrorKind::ConfigError,
                    "Stage has no tasks",
                    format!("stage '{}'", builder.name)
                );
            }
            if let Some(queue) = &builder.sync_source
                && queue.partitions() as usize != builder.task_count
            {
                bail!(
                    ErrorKind::ConfigError,
                    "Stage task count does not match its queue partitions",
                    format!(
                        "stage '{}' has {} tasks, queue '{}' has {} partitions",
                        builder.name,
                        builder.task_count,
                        queue.name(),
                        queue.partitions()
                    )
                );
            }
        }

        // Every component is created before the first task runs.
        let mut stages = Vec::with_capacity(self.builders.len());
        let mut stage_tasks = Vec::new();
        for (index, builder) in self.builders.drain(..).enumerate() {
            let stage = Arc::new(Stage::new(
                builder.name.clone(),
                builder.task_count,
                builder.sync_source.clone(),
            ));

            for task_id in 0..builder.task_count {
                stage_tasks.push(StageTask {
                    ctx: TaskContext {
                        pipeline_id: self.id,
                        stage: stage.clone(),
                        task_id,
                        batch: builder.batch.clone(),
                        throttle: builder.throttle,
                    },
                    extractor: (builder.extractor_factory)(task_id)?,
                    filters: builder.filters.clone(),
                    applier: (builder.applier_factory)(task_id)?,
                    signals: TaskSignals {
                        shutdown_rx: self.shutdown.shutdown_tx.subscribe(),
                        drain_rx: (index == 0).then(|| self.shutdown.drain_tx.subscribe()),
                    },
                });
            }

            stages.push(stage);
        }

        let tasks = stage_tasks
            .into_iter()
            .map(|task| {
                let stage_name = task.ctx.stage.name().to_string();
                let task_id = task.ctx.task_id;
                let span = info_span!(
                    "stage_task",
                    pipeline_id = self.id,
                    stage = %stage_name,
                    task_id
                );

                tokio::spawn(
                    async move { (stage_name, task_id, task.run().await) }.instrument(span),
                )
            })
            .collect();

        self.state = PipelineState::Started { stages, tasks };

        Ok(())
    }

    /// Waits for every stage task to end.
    ///
    /// The first failing task shuts the pipeline down immediately. Once all tasks ended, pending
    /// watches are cancelled and, after an immediate shutdown, the queues are discarded.
    pub async fn wait(self) -> ThlResult<()> {
        let PipelineState::Started { stages, tasks } = self.state else {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        };

        info!("waiting for stage tasks to complete");

        let mut errors: Vec<ThlError> = Vec::new();
        let mut tasks: FuturesUnordered<_> = tasks.into_iter().collect();
        while let Some(result) = tasks.next().await {
            let result = match result {
                Ok((stage, task_id, Err(err))) => {
                    error!(
                        stage = %stage,
                        task_id,
                        error = %err,
                        "stage task completed with an error"
                    );
                    Err(err)
                }
                Ok(_) => Ok(()),
                Err(err) if err.is_cancelled() => Err(thl_error!(
                    ErrorKind::StageTaskCancelled,
                    "Stage task was cancelled",
                    err
                )),
                Err(err) => Err(thl_error!(
                    ErrorKind::StageTaskPanic,
                    "Stage task panicked",
                    err
                )),
            };

            if let Err(err) = result {
                if errors.is_empty() {
                    info!("stage task failed, shutting down the remaining stage tasks");
                    self.shutdown.shutdown(ShutdownMode::Immediate);
                }
                errors.push(err);
            }
        }

        if self.shutdown.discard.load(Ordering::Acquire) {
            for stage in &stages {
                if let Some(queue) = stage.sync_source() {
                    queue.discard().await;
                }
            }
        }

        for stage in &stages {
            stage.cancel_watches();
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        info!("pipeline completed");

        Ok(())
    }

    pub fn shutdown(&self, mode: ShutdownMode) {
        self.shutdown.shutdown(mode);
    }

    pub async fn shutdown_and_wait(self, mode: ShutdownMode) -> ThlResult<()> {
        self.shutdown(mode);
        self.wait().await
    }

    /// Watches for every task of the last stage to see an event at or beyond `seqno`.
    ///
    /// Resolves with the first event matching on all tasks, so with contiguous seqnos the
    /// matched seqno is exactly `seqno`.
    pub async fn watch_for_processed_seqno(
        &self,
        seqno: Seqno,
    ) -> ThlResult<WatchFuture<ReplHeader>> {
        let stage = self.last_stage()?;
        let future = stage
            .processed_watches()
            .watch(SeqnoWatchPredicate::new(seqno), WatchScope::AllTasks)?;
        sync_at(stage, SeqnoWatchPredicate::new(seqno)).await?;

        Ok(future)
    }

    /// Watches for every task of the last stage to commit a position at or beyond `seqno`.
    pub async fn watch_for_committed_seqno(
        &self,
        seqno: Seqno,
    ) -> ThlResult<WatchFuture<ReplHeader>> {
        let stage = self.last_stage()?;
        let future = stage
            .committed_watches()
            .watch(SeqnoWatchPredicate::new(seqno), WatchScope::AllTasks)?;
        sync_at(stage, SeqnoWatchPredicate::new(seqno)).await?;

        Ok(future)
    }

    /// Watches for every task of the last stage to see an event from `timestamp` or later.
    pub async fn watch_for_processed_timestamp(
        &self,
        timestamp: DateTime<Utc>,
    ) -> ThlResult<WatchFuture<ReplHeader>> {
        let stage = self.last_stage()?;
        let future = stage.processed_watches().watch(
            SourceTimestampWatchPredicate::new(timestamp),
            WatchScope::AllTasks,
        )?;
        sync_at(stage, SourceTimestampWatchPredicate::new(timestamp)).await?;

        Ok(future)
    }

    /// Watches for everything put into the last stage's queue so far to be committed.
    pub async fn flush(&self) -> ThlResult<WatchFuture<ReplHeader>> {
        let stage = self.last_stage()?;
        let Some(queue) = stage.sync_source() else {
            bail!(
                ErrorKind::InvalidState,
                "Flush requires the last stage to read from a parallel queue",
                format!("stage '{}'", stage.name())
            );
        };
        let Some(header) = queue.last_header() else {
            bail!(
                ErrorKind::InvalidState,
                "Nothing to flush",
                format!("queue '{}' is empty", queue.name())
            );
        };

        info!(seqno = header.seqno, "flushing pipeline");

        self.watch_for_committed_seqno(header.seqno).await
    }

    pub fn status(&self) -> StatusProperties {
        let mut status = StatusProperties::new();
        status.set("pipelineId", self.id);
        status.set("serviceName", self.config.service_name.clone());
        status.set(
            "state",
            match self.state {
                PipelineState::NotStarted => "notStarted",
                PipelineState::Started { .. } => "started",
            },
        );

        for stage in self.stages() {
            status.merge_prefixed(&format!("stage.{}", stage.name()), stage.status());
            if let Some(queue) = stage.sync_source() {
                status.merge_prefixed(&format!("queue.{}", queue.name()), queue.status());
            }
        }

        status
    }

    fn last_stage(&self) -> ThlResult<&Arc<Stage>> {
        self.stages()
            .last()
            .ok_or_else(|| thl_error!(ErrorKind::InvalidState, "Pipeline was not started"))
    }
}

/// Makes every task of `stage` reach the position matching `predicate`.
async fn sync_at<P>(stage: &Stage, predicate: P) -> ThlResult<()>
where
    P: WatchPredicate<ReplHeader> + 'static,
{
    match stage.sync_source() {
        Some(queue) => queue.insert_watch_sync_event(predicate).await,
        None => Ok(()),
    }
}
