use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use config::shared::BatchConfig;
use futures::{Stream, StreamExt};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx, shutdown_signalled};
use crate::concurrency::stream::BatchStream;
use crate::error::ThlResult;
use crate::failpoints::{STAGE_TASK_BEFORE_APPLY, thl_fail_point};
use crate::metrics::{
    PIPELINE_ID_LABEL, STAGE_LABEL, THL_STAGE_COMMITS_TOTAL, THL_STAGE_EVENTS_APPLIED_TOTAL,
};
use crate::pipeline::components::{Applier, Extractor, Filter};
use crate::pipeline::stage::{Stage, TaskThrottle};
use crate::types::{
    ControlKind, PipelineId, ReplControlEvent, ReplEvent, ReplHeader, ReplItem, TaskId,
};

/// Signals a task listens to.
#[derive(Debug)]
pub(crate) struct TaskSignals {
    /// Stops the task at once, rolling back uncommitted work.
    pub(crate) shutdown_rx: ShutdownRx,
    /// Ends the input of a first-stage task, which then commits and releases its applier.
    pub(crate) drain_rx: Option<ShutdownRx>,
}

/// Identity and settings of one task of a stage.
#[derive(Debug)]
pub(crate) struct TaskContext {
    pub(crate) pipeline_id: PipelineId,
    pub(crate) stage: Arc<Stage>,
    pub(crate) task_id: TaskId,
    pub(crate) batch: BatchConfig,
    pub(crate) throttle: Option<TaskThrottle>,
}

/// Why a task leaves its loop before its input ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskExit {
    /// A stop event was read; the task commits and releases its applier.
    Stopped,
    /// A shutdown was signalled; uncommitted work is rolled back.
    Shutdown,
}

/// Progress of a task since its last commit.
#[derive(Debug, Default)]
struct TaskProgress {
    /// Last event or control position seen.
    position: Option<ReplHeader>,
    /// Last position reported as committed.
    committed: Option<ReplHeader>,
    /// Events applied since the last commit.
    uncommitted: u64,
}

impl TaskProgress {
    fn at_boundary(&self) -> bool {
        self.position.as_ref().is_none_or(|header| header.last_frag)
    }
}

/// A stage task: extracts items, filters and applies events and commits in blocks.
pub(crate) struct StageTask {
    pub(crate) ctx: TaskContext,
    pub(crate) extractor: Box<dyn Extractor>,
    pub(crate) filters: Vec<Arc<dyn Filter>>,
    pub(crate) applier: Box<dyn Applier>,
    pub(crate) signals: TaskSignals,
}

impl StageTask {
    pub(crate) async fn run(self) -> ThlResult<()> {
        let StageTask {
            ctx,
            mut extractor,
            filters,
            mut applier,
            signals,
        } = self;
        let TaskSignals {
            mut shutdown_rx,
            mut drain_rx,
        } = signals;

        extractor.connect().await?;
        applier.connect().await?;

        info!("stage task started");

        let mut worker = TaskWorker {
            ctx,
            filters,
            applier,
            progress: TaskProgress::default(),
            throttle_rx: shutdown_rx.clone(),
        };

        let stream = BatchStream::wrap(extract_stream(extractor), worker.ctx.batch.clone());
        tokio::pin!(stream);

        let result = loop {
            let batch = tokio::select! {
                biased;

                _ = shutdown_signalled(&mut shutdown_rx) => {
                    info!("shutting down stage task");
                    break worker.abort().await;
                }

                _ = drain_signalled(drain_rx.as_mut()) => {
                    info!("draining stage task");
                    break worker.finish().await;
                }

                batch = stream.next() => batch,
            };

            let Some(batch) = batch else {
                debug!("stage task input ended");
                break worker.finish().await;
            };

            let flow = tokio::select! {
                biased;

                _ = shutdown_signalled(&mut shutdown_rx) => {
                    info!("shutting down stage task while processing a batch");
                    break worker.abort().await;
                }

                flow = worker.process_batch(batch) => flow,
            };

            match flow {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(TaskExit::Stopped)) => break worker.finish().await,
                Ok(ControlFlow::Break(TaskExit::Shutdown)) => {
                    info!("shutting down throttled stage task");
                    break worker.abort().await;
                }
                Err(err) => {
                    if let Err(rollback_err) = worker.applier.rollback().await {
                        warn!(error = %rollback_err, "rollback after a failed batch failed");
                    }
                    break Err(err);
                }
            }
        };

        if let Err(err) = worker.applier.disconnect().await {
            warn!(error = %err, "failed to disconnect applier");
        }

        result
    }
}

struct TaskWorker {
    ctx: TaskContext,
    filters: Vec<Arc<dyn Filter>>,
    applier: Box<dyn Applier>,
    progress: TaskProgress,
    throttle_rx: ShutdownRx,
}

impl TaskWorker {
    async fn process_batch(
        &mut self,
        batch: Vec<ThlResult<ReplItem>>,
    ) -> ThlResult<ControlFlow<TaskExit>> {
        for item in batch {
            let flow = match item? {
                ReplItem::Event(event) => self.process_event(event).await?,
                ReplItem::Control(control) => self.process_control(control).await?,
            };
            if flow.is_break() {
                return Ok(flow);
            }
        }

        if self.progress.at_boundary() {
            self.commit().await?;
        }

        Ok(ControlFlow::Continue(()))
    }

    async fn process_event(&mut self, event: ReplEvent) -> ThlResult<ControlFlow<TaskExit>> {
        let stage = self.ctx.stage.clone();
        stage
            .processed_watches()
            .process(&event.header, self.ctx.task_id)?;

        if self.throttle(&event).await.should_shutdown() {
            return Ok(ControlFlow::Break(TaskExit::Shutdown));
        }

        let header = event.header.clone();
        let mut filtered = Some(event);
        for filter in &self.filters {
            let Some(event) = filtered.take() else {
                break;
            };
            filtered = filter.filter(event)?;
        }

        if let Some(event) = filtered {
            thl_fail_point(STAGE_TASK_BEFORE_APPLY)?;

            self.applier.apply(event).await?;
            self.progress.uncommitted += 1;
            counter!(
                THL_STAGE_EVENTS_APPLIED_TOTAL,
                PIPELINE_ID_LABEL => self.ctx.pipeline_id.to_string(),
                STAGE_LABEL => stage.name().to_string(),
            )
            .increment(1);
        }

        self.progress.position = Some(header);

        Ok(ControlFlow::Continue(()))
    }

    async fn process_control(
        &mut self,
        control: ReplControlEvent,
    ) -> ThlResult<ControlFlow<TaskExit>> {
        debug!(
            kind = ?control.kind,
            seqno = ?control.header.as_ref().map(|h| h.seqno),
            "control event"
        );

        // Control events are only inserted between transactions.
        self.commit().await?;

        if let Some(header) = control.header {
            let ahead = self
                .progress
                .committed
                .as_ref()
                .is_none_or(|committed| header.seqno >= committed.seqno);
            if ahead {
                self.ctx
                    .stage
                    .processed_watches()
                    .process(&header, self.ctx.task_id)?;
                self.progress.position = Some(header.clone());
                self.report_committed(header)?;
            }
        }

        match control.kind {
            ControlKind::Sync => Ok(ControlFlow::Continue(())),
            ControlKind::Stop => {
                info!("stop event received");
                Ok(ControlFlow::Break(TaskExit::Stopped))
            }
        }
    }

    /// Waits while this task runs too far ahead of the slowest task of the stage.
    ///
    /// A slowest task with an empty channel is idle rather than slow and does not hold this
    /// task back.
    async fn throttle(&mut self, event: &ReplEvent) -> ShutdownResult<(), ()> {
        let Some(throttle) = self.ctx.throttle else {
            return ShutdownResult::Ok(());
        };
        let stage = self.ctx.stage.clone();
        let guard = stage.guard();
        let Some(own_seqno) = guard.with(|guard| guard.seqno_of(self.ctx.task_id)) else {
            return ShutdownResult::Ok(());
        };

        let max_drift = TimeDelta::from_std(throttle.max_drift).unwrap_or(TimeDelta::MAX);
        let min_time = event
            .source_timestamp()
            .checked_sub_signed(max_drift)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        loop {
            let wait = guard.wait_min_time(
                min_time,
                own_seqno,
                throttle.poll_interval,
                &mut self.throttle_rx,
            );
            if let Ok(result) = tokio::time::timeout(throttle.poll_interval, wait).await {
                return result;
            }

            let slowest = guard.with(|guard| guard.low_task_id());
            if let (Some(queue), Some(slowest)) = (stage.sync_source(), slowest)
                && queue.channel_size(slowest) == 0
            {
                debug!(slowest, "slowest task is idle, no longer throttling");
                return ShutdownResult::Ok(());
            }
        }
    }

    /// Commits applied events and reports the committed position.
    async fn commit(&mut self) -> ThlResult<()> {
        if self.progress.uncommitted > 0 {
            self.applier.commit().await?;
            self.progress.uncommitted = 0;
            counter!(
                THL_STAGE_COMMITS_TOTAL,
                PIPELINE_ID_LABEL => self.ctx.pipeline_id.to_string(),
                STAGE_LABEL => self.ctx.stage.name().to_string(),
            )
            .increment(1);
        }

        let Some(position) = self.progress.position.clone() else {
            return Ok(());
        };
        if self.progress.committed.as_ref() == Some(&position) {
            return Ok(());
        }

        self.report_committed(position)
    }

    fn report_committed(&mut self, header: ReplHeader) -> ThlResult<()> {
        let stage = &self.ctx.stage;
        stage.committed_watches().process(&header, self.ctx.task_id)?;
        if let Some(queue) = stage.sync_source() {
            queue.acknowledge(self.ctx.task_id, header.seqno);
        }
        stage.guard().report(
            self.ctx.task_id,
            header.seqno,
            header.source_timestamp,
            header.clone(),
        )?;
        self.progress.committed = Some(header);

        Ok(())
    }

    /// Commits what can be committed and releases the applier.
    async fn finish(&mut self) -> ThlResult<()> {
        if self.progress.at_boundary() {
            self.commit().await?;
        } else {
            warn!(
                seqno = ?self.progress.position.as_ref().map(|h| h.seqno),
                "rolling back an incomplete transaction"
            );
            self.applier.rollback().await?;
            self.progress.uncommitted = 0;
        }

        self.applier.release().await?;
        info!(
            committed_seqno = ?self.progress.committed.as_ref().map(|h| h.seqno),
            "stage task finished"
        );

        Ok(())
    }

    /// Rolls back uncommitted work.
    async fn abort(&mut self) -> ThlResult<()> {
        if self.progress.uncommitted > 0 {
            self.applier.rollback().await?;
            self.progress.uncommitted = 0;
        }

        Ok(())
    }
}

/// Turns an extractor into a stream ending with the extractor input.
fn extract_stream(
    extractor: Box<dyn Extractor>,
) -> impl Stream<Item = ThlResult<ReplItem>> + Send {
    futures::stream::unfold(Some(extractor), |extractor| async move {
        let mut extractor = extractor?;
        match extractor.extract().await {
            Ok(Some(item)) => Some((Ok(item), Some(extractor))),
            Ok(None) => match extractor.disconnect().await {
                Ok(()) => None,
                Err(err) => Some((Err(err), None)),
            },
            Err(err) => Some((Err(err), None)),
        }
    })
}

async fn drain_signalled(drain_rx: Option<&mut ShutdownRx>) {
    match drain_rx {
        Some(drain_rx) => shutdown_signalled(drain_rx).await,
        None => futures::future::pending().await,
    }
}
