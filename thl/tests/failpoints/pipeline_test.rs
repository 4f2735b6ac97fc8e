use std::collections::BTreeSet;
use std::sync::Arc;

use config::shared::{BatchConfig, ParallelQueueConfig, PartitionerConfig, PipelineConfig};
use fail::FailScenario;
use telemetry::tracing::init_test_tracing;
use thl::error::{ErrorKind, ThlResult};
use thl::failpoints::{PARALLEL_QUEUE_BEFORE_PUT, STAGE_TASK_BEFORE_APPLY};
use thl::log::{LogCursor, MemoryLog, SerialLog};
use thl::pipeline::Pipeline;
use thl::pipeline::adapters::{LogExtractor, ParallelQueueApplier};
use thl::pipeline::components::{Applier, Extractor};
use thl::pipeline::stage::StageBuilder;
use thl::queue::ParallelQueue;
use thl::test_utils::applier::MemoryApplier;
use thl::test_utils::event::{event, events, items};
use thl::test_utils::extractor::IteratorExtractor;

fn queue_config() -> ParallelQueueConfig {
    ParallelQueueConfig {
        partitions: 2,
        max_size: 10,
        sync_enabled: false,
        sync_interval: 1,
        serialization_timeout_ms: 1_000,
        partitioner: PartitionerConfig::Hash {
            critical_shards: BTreeSet::new(),
        },
    }
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        id: 7,
        service_name: "failpoints".to_string(),
        batch: BatchConfig {
            max_size: 5,
            max_fill_ms: 5,
        },
        queue: queue_config(),
        max_task_drift_ms: None,
        guard_poll_interval_ms: 10,
    }
}

fn extractor(extractor: impl Extractor + 'static) -> ThlResult<Box<dyn Extractor>> {
    Ok(Box::new(extractor))
}

fn applier(applier: impl Applier + 'static) -> ThlResult<Box<dyn Applier>> {
    Ok(Box::new(applier))
}

#[tokio::test(flavor = "multi_thread")]
async fn injected_apply_failure_fails_the_pipeline() {
    init_test_tracing();
    let scenario = FailScenario::setup();
    fail::cfg(STAGE_TASK_BEFORE_APPLY, "return").unwrap();

    let target = MemoryApplier::new();
    let source_items = items(events(0..20, "db0"));
    let stage = {
        let target = target.clone();
        StageBuilder::new(
            "apply",
            1,
            move |_| extractor(IteratorExtractor::new(source_items.clone())),
            move |task_id| applier(target.for_task(task_id)),
        )
    };

    let mut pipeline = Pipeline::new(pipeline_config());
    pipeline.add_stage(stage);
    pipeline.start().unwrap();

    let err = pipeline.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailpointInjected);
    assert!(target.committed_seqnos().is_empty());
    assert!(target.released_tasks().is_empty());

    scenario.teardown();
}

#[tokio::test(flavor = "multi_thread")]
async fn injected_queue_failure_fails_the_pipeline() {
    init_test_tracing();
    let scenario = FailScenario::setup();
    fail::cfg(PARALLEL_QUEUE_BEFORE_PUT, "return").unwrap();

    let log: Arc<dyn SerialLog> = Arc::new(MemoryLog::new());
    for event in events(0..5, "db0") {
        log.append(event).await.unwrap();
    }
    log.close();

    let queue = ParallelQueue::new(7, "q", queue_config()).unwrap();
    let stage = {
        let log = log.clone();
        let queue = queue.clone();
        StageBuilder::new(
            "thl-to-q",
            1,
            move |_| extractor(LogExtractor::new(log.clone(), LogCursor::start())),
            move |_| applier(ParallelQueueApplier::new(queue.clone())),
        )
    };

    let mut pipeline = Pipeline::new(pipeline_config());
    pipeline.add_stage(stage);
    pipeline.start().unwrap();

    let err = pipeline.wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailpointInjected);
    assert!(queue.last_header().is_none());

    let err = queue.put(event(5, "db0")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailpointInjected);

    scenario.teardown();
}
