use std::sync::Arc;
use std::time::Duration;

use cluster::QuorumEvaluator;
use config::shared::{PipelineConfig, ReplicatorConfig, ReplicatorRole};
use thl::error::ThlResult;
use thl::log::{LogCursor, MemoryLog, SerialLog};
use thl::pipeline::adapters::{
    LogApplier, LogExtractor, ParallelQueueApplier, ParallelQueueExtractor,
};
use thl::pipeline::components::{Applier, Extractor};
use thl::pipeline::stage::StageBuilder;
use thl::pipeline::{Pipeline, ShutdownMode};
use thl::queue::ParallelQueue;
use tokio::io::BufReader;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use crate::sink::TracingApplier;
use crate::source::JsonLinesExtractor;

const QUEUE_NAME: &str = "parallel-q";

pub async fn start_replicator(config: ReplicatorConfig) -> anyhow::Result<()> {
    check_quorum(&config).await?;

    let pipeline = build_pipeline(&config.pipeline)?;
    start_pipeline(pipeline).await
}

/// Refuses to start a master replicator outside the primary partition.
///
/// There is no group communication layer here, so the view is made of the configured members
/// answering a probe. Members that do not answer still count towards the quorum set.
async fn check_quorum(config: &ReplicatorConfig) -> anyhow::Result<()> {
    let Some(cluster) = &config.cluster else {
        info!("no cluster configured, running standalone");
        return Ok(());
    };

    if config.role != ReplicatorRole::Master || !cluster.require_quorum_for_master {
        info!(role = ?config.role, "quorum check not required");
        return Ok(());
    }

    let evaluator = QuorumEvaluator::from_config(cluster.clone());
    let evaluation = evaluator.evaluate_configured().await;

    if !evaluation.primary {
        anyhow::bail!(
            "member '{}' is not in the primary partition, refusing to start as master",
            cluster.member_name
        );
    }

    info!(member = %cluster.member_name, "member is in the primary partition");

    Ok(())
}

/// Builds the stages `remote-to-thl`, `thl-to-q` and `q-to-dbms`.
fn build_pipeline(config: &PipelineConfig) -> ThlResult<Pipeline> {
    let thl: Arc<dyn SerialLog> = Arc::new(MemoryLog::new());
    let queue = ParallelQueue::new(config.id, QUEUE_NAME, config.queue.clone())?;

    let remote_to_thl = {
        let thl = thl.clone();
        StageBuilder::new(
            "remote-to-thl",
            1,
            |_| {
                let reader = BufReader::new(tokio::io::stdin());
                Ok(Box::new(JsonLinesExtractor::new(reader)) as Box<dyn Extractor>)
            },
            move |_| Ok(Box::new(LogApplier::new(thl.clone())) as Box<dyn Applier>),
        )
        .with_batch(config.batch.clone())
    };

    let thl_to_q = {
        let queue = queue.clone();
        StageBuilder::new(
            "thl-to-q",
            1,
            move |_| {
                let extractor = LogExtractor::new(thl.clone(), LogCursor::start());
                Ok(Box::new(extractor) as Box<dyn Extractor>)
            },
            move |_| Ok(Box::new(ParallelQueueApplier::new(queue.clone())) as Box<dyn Applier>),
        )
        .with_batch(config.batch.clone())
    };

    let mut q_to_dbms = {
        let extract_queue = queue.clone();
        StageBuilder::new(
            "q-to-dbms",
            queue.partitions() as usize,
            move |task_id| {
                Ok(Box::new(ParallelQueueExtractor::new(extract_queue.clone(), task_id))
                    as Box<dyn Extractor>)
            },
            |task_id| Ok(Box::new(TracingApplier::new(task_id)) as Box<dyn Applier>),
        )
        .with_batch(config.batch.clone())
        .with_sync_source(queue)
    };
    if let Some(max_task_drift_ms) = config.max_task_drift_ms {
        q_to_dbms = q_to_dbms.with_task_drift(
            Duration::from_millis(max_task_drift_ms),
            Duration::from_millis(config.guard_poll_interval_ms),
        );
    }

    let mut pipeline = Pipeline::new(config.clone());
    pipeline
        .add_stage(remote_to_thl)
        .add_stage(thl_to_q)
        .add_stage(q_to_dbms);

    Ok(pipeline)
}

/// Starts a pipeline and handles shutdown signals.
///
/// The first SIGINT or SIGTERM drains the pipeline, a second one stops it immediately.
#[tracing::instrument(skip(pipeline), fields(pipeline_id = pipeline.id()))]
async fn start_pipeline(mut pipeline: Pipeline) -> anyhow::Result<()> {
    pipeline.start()?;

    let shutdown = pipeline.shutdown_handle();
    let shutdown_handle = tokio::spawn(async move {
        for mode in [ShutdownMode::Clean, ShutdownMode::Immediate] {
            match shutdown_signal().await {
                Ok(signal) => info!(signal, ?mode, "shutdown signal received"),
                Err(err) => {
                    error!(error = %err, "failed to listen for shutdown signals");
                    return;
                }
            }

            shutdown.shutdown(mode);
        }
    });

    let result = pipeline.wait().await;

    // The signal listener outlives a pipeline that completed on its own.
    shutdown_handle.abort();
    if let Err(err) = shutdown_handle.await
        && !err.is_cancelled()
    {
        warn!(error = %err, "shutdown signal listener failed");
    }

    result?;

    info!("replicator stopped");

    Ok(())
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "sigint"),
        _ = sigterm.recv() => Ok("sigterm"),
    }
}
