use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use config::shared::{BatchConfig, ParallelQueueConfig, PartitionerConfig, PipelineConfig};
use telemetry::tracing::init_test_tracing;
use thl::error::{ErrorKind, ThlResult};
use thl::log::{LogCursor, MemoryLog, SerialLog};
use thl::pipeline::adapters::{
    LogApplier, LogExtractor, ParallelQueueApplier, ParallelQueueExtractor,
};
use thl::pipeline::components::{Applier, Extractor};
use thl::pipeline::stage::StageBuilder;
use thl::pipeline::{Pipeline, ShutdownMode};
use thl::queue::ParallelQueue;
use thl::test_utils::applier::MemoryApplier;
use thl::test_utils::event::{event, items};
use thl::test_utils::extractor::IteratorExtractor;
use thl::types::{ReplEvent, Seqno, UNKNOWN_SHARD_ID};

const SHARDS: [&str; 3] = ["db0", "db1", "db2"];
const WATCH_TIMEOUT: Duration = Duration::from_secs(30);

fn queue_config() -> ParallelQueueConfig {
    ParallelQueueConfig {
        partitions: 3,
        max_size: 20,
        sync_enabled: true,
        sync_interval: 25,
        serialization_timeout_ms: 10_000,
        partitioner: PartitionerConfig::Hash {
            critical_shards: BTreeSet::new(),
        },
    }
}

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        id: 1,
        service_name: "alpha".to_string(),
        batch: BatchConfig {
            max_size: 10,
            max_fill_ms: 5,
        },
        queue: queue_config(),
        max_task_drift_ms: None,
        guard_poll_interval_ms: 10,
    }
}

fn sharded_events(seqnos: impl IntoIterator<Item = Seqno>) -> Vec<ReplEvent> {
    seqnos
        .into_iter()
        .map(|seqno| event(seqno, SHARDS[seqno as usize % SHARDS.len()]))
        .collect()
}

fn extractor(extractor: impl Extractor + 'static) -> ThlResult<Box<dyn Extractor>> {
    Ok(Box::new(extractor))
}

fn applier(applier: impl Applier + 'static) -> ThlResult<Box<dyn Applier>> {
    Ok(Box::new(applier))
}

/// Stage reading the three channels of `queue` into `target`.
fn q_to_dbms(queue: &ParallelQueue, target: &MemoryApplier) -> StageBuilder {
    let extract_queue = queue.clone();
    let target = target.clone();

    StageBuilder::new(
        "q-to-dbms",
        3,
        move |task_id| extractor(ParallelQueueExtractor::new(extract_queue.clone(), task_id)),
        move |task_id| applier(target.for_task(task_id)),
    )
    .with_sync_source(queue.clone())
}

/// Stage moving events from `log` into `queue`.
fn thl_to_q(log: &Arc<dyn SerialLog>, queue: &ParallelQueue) -> StageBuilder {
    let log = log.clone();
    let queue = queue.clone();

    StageBuilder::new(
        "thl-to-q",
        1,
        move |_| extractor(LogExtractor::new(log.clone(), LogCursor::start())),
        move |_| applier(ParallelQueueApplier::new(queue.clone())),
    )
}

/// Pipeline fed by appending to the returned log.
fn log_fed_pipeline(target: &MemoryApplier) -> (Pipeline, Arc<dyn SerialLog>, ParallelQueue) {
    let config = pipeline_config();
    let source: Arc<dyn SerialLog> = Arc::new(MemoryLog::new());
    let queue = ParallelQueue::new(config.id, "q", config.queue.clone()).unwrap();

    let mut pipeline = Pipeline::new(config);
    pipeline
        .add_stage(thl_to_q(&source, &queue))
        .add_stage(q_to_dbms(&queue, target));

    (pipeline, source, queue)
}

fn assert_shards_stay_on_one_task(target: &MemoryApplier) {
    let mut task_of_shard = HashMap::new();
    for task_id in 0..3 {
        let seqnos = target.committed_seqnos_of(task_id);
        assert!(seqnos.windows(2).all(|pair| pair[0] < pair[1]));

        for seqno in seqnos {
            let shard = SHARDS[seqno as usize % SHARDS.len()];
            let previous = task_of_shard.insert(shard, task_id);
            assert!(previous.is_none_or(|previous| previous == task_id));
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn three_stage_pipeline_applies_every_event_and_stops_at_end_of_input() {
    init_test_tracing();

    let config = pipeline_config();
    let thl: Arc<dyn SerialLog> = Arc::new(MemoryLog::new());
    let queue = ParallelQueue::new(config.id, "q", config.queue.clone()).unwrap();
    let target = MemoryApplier::new();

    let source_items = items(sharded_events(0..300));
    let remote_to_thl = {
        let thl = thl.clone();
        StageBuilder::new(
            "remote-to-thl",
            1,
            move |_| extractor(IteratorExtractor::new(source_items.clone())),
            move |_| applier(LogApplier::new(thl.clone())),
        )
    };

    let mut pipeline = Pipeline::new(config);
    pipeline
        .add_stage(remote_to_thl)
        .add_stage(thl_to_q(&thl, &queue))
        .add_stage(q_to_dbms(&queue, &target));
    pipeline.start().unwrap();

    pipeline.wait().await.unwrap();

    let mut committed = target.committed_seqnos();
    committed.sort_unstable();
    assert_eq!(committed, (0..300).collect::<Vec<_>>());
    assert_shards_stay_on_one_task(&target);

    let mut released = target.released_tasks();
    released.sort_unstable();
    assert_eq!(released, vec![0, 1, 2]);

    assert!(thl.is_closed());
    assert_eq!(thl.last_seqno(), Some(299));
    assert_eq!(target.rollbacks(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn processed_watch_resolves_exactly_at_its_seqno() {
    init_test_tracing();

    let target = MemoryApplier::new();
    let (mut pipeline, source, _queue) = log_fed_pipeline(&target);
    pipeline.start().unwrap();

    let mut processed = pipeline.watch_for_processed_seqno(50).await.unwrap();
    let mut committed = pipeline.watch_for_committed_seqno(50).await.unwrap();

    for event in sharded_events(0..100) {
        source.append(event).await.unwrap();
    }

    let header = processed.get_timeout(WATCH_TIMEOUT).await.unwrap();
    assert_eq!(header.seqno, 50);

    let header = committed.get_timeout(WATCH_TIMEOUT).await.unwrap();
    assert!(header.seqno >= 50);

    target.wait_for_committed(100).await;
    pipeline.shutdown_and_wait(ShutdownMode::Clean).await.unwrap();

    let mut seqnos = target.committed_seqnos();
    seqnos.sort_unstable();
    assert_eq!(seqnos, (0..100).collect::<Vec<_>>());
    assert_shards_stay_on_one_task(&target);
}

#[tokio::test(flavor = "multi_thread")]
async fn timestamp_watch_resolves_once_every_task_reaches_it() {
    init_test_tracing();

    let target = MemoryApplier::new();
    let (mut pipeline, source, _queue) = log_fed_pipeline(&target);
    pipeline.start().unwrap();

    let timestamp = event(30, "db0").source_timestamp();
    let mut processed = pipeline.watch_for_processed_timestamp(timestamp).await.unwrap();

    for event in sharded_events(0..60) {
        source.append(event).await.unwrap();
    }

    let header = processed.get_timeout(WATCH_TIMEOUT).await.unwrap();
    assert_eq!(header.seqno, 30);
    assert_eq!(header.source_timestamp, timestamp);

    pipeline.shutdown_and_wait(ShutdownMode::Clean).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_waits_for_everything_queued_to_commit() {
    init_test_tracing();

    let target = MemoryApplier::new();
    let (mut pipeline, source, queue) = log_fed_pipeline(&target);
    pipeline.start().unwrap();

    let err = pipeline.flush().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    for event in sharded_events(0..30) {
        source.append(event).await.unwrap();
    }
    tokio::time::timeout(WATCH_TIMEOUT, async {
        while queue.last_header().map(|header| header.seqno) != Some(29) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let header = pipeline
        .flush()
        .await
        .unwrap()
        .get_timeout(WATCH_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(header.seqno, 29);
    assert_eq!(target.committed_seqnos().len(), 30);

    pipeline.shutdown_and_wait(ShutdownMode::Clean).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn immediate_shutdown_cancels_pending_watches() {
    init_test_tracing();

    let target = MemoryApplier::new();
    let (mut pipeline, source, queue) = log_fed_pipeline(&target);
    pipeline.start().unwrap();

    let processed = pipeline.watch_for_processed_seqno(1_000).await.unwrap();
    for event in sharded_events(0..10) {
        source.append(event).await.unwrap();
    }
    target.wait_for_committed(10).await;

    pipeline
        .shutdown_and_wait(ShutdownMode::Immediate)
        .await
        .unwrap();

    let err = processed.await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WatchCancelled);
    assert_eq!(queue.channel_size(0), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_applier_stops_the_pipeline_with_its_error() {
    init_test_tracing();

    let target = MemoryApplier::new().fail_at(42);
    let (mut pipeline, source, _queue) = log_fed_pipeline(&target);
    pipeline.start().unwrap();

    for event in sharded_events(0..100) {
        source.append(event).await.unwrap();
    }

    let err = pipeline.wait().await.unwrap_err();
    assert!(err.kinds().contains(&ErrorKind::ApplyFailed));
    assert!(!target.committed_seqnos().contains(&42));
}

#[tokio::test(flavor = "multi_thread")]
async fn drifting_tasks_complete_without_deadlock() {
    init_test_tracing();

    let config = PipelineConfig {
        batch: BatchConfig {
            max_size: 1,
            max_fill_ms: 1,
        },
        ..pipeline_config()
    };
    let thl: Arc<dyn SerialLog> = Arc::new(MemoryLog::new());
    let queue = ParallelQueue::new(config.id, "q", config.queue.clone()).unwrap();
    let target = MemoryApplier::new();

    // Most events land on db0 so the other tasks keep running ahead of it.
    let mut source_events = Vec::new();
    for seqno in 0..200 {
        let shard = if seqno % 5 == 0 { SHARDS[seqno as usize % 3] } else { "db0" };
        source_events.push(event(seqno, shard));
    }
    for event in source_events {
        thl.append(event).await.unwrap();
    }
    thl.close();

    let mut pipeline = Pipeline::new(config);
    pipeline
        .add_stage(thl_to_q(&thl, &queue))
        .add_stage(
            q_to_dbms(&queue, &target)
                .with_task_drift(Duration::from_secs(2), Duration::from_millis(10)),
        );
    pipeline.start().unwrap();

    tokio::time::timeout(Duration::from_secs(60), pipeline.wait())
        .await
        .expect("drifting pipeline did not complete")
        .unwrap();

    let mut committed = target.committed_seqnos();
    committed.sort_unstable();
    assert_eq!(committed, (0..200).collect::<Vec<_>>());
    for task_id in 0..3 {
        let seqnos = target.committed_seqnos_of(task_id);
        assert!(seqnos.windows(2).all(|pair| pair[0] < pair[1]));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn critical_event_is_applied_after_earlier_work_commits() {
    init_test_tracing();

    let target = MemoryApplier::new().slow_at(0, Duration::from_millis(500));
    let (mut pipeline, source, queue) = log_fed_pipeline(&target);
    pipeline.start().unwrap();

    source.append(event(0, "db1")).await.unwrap();
    source.append(event(1, UNKNOWN_SHARD_ID)).await.unwrap();
    source.append(event(2, "db2")).await.unwrap();
    source.append(event(3, "db0")).await.unwrap();
    tokio::time::timeout(WATCH_TIMEOUT, target.wait_for_committed(4))
        .await
        .unwrap();

    pipeline.shutdown_and_wait(ShutdownMode::Clean).await.unwrap();

    let committed_0 = target.committed_at(0).unwrap();
    let applied_1 = target.applied_at(1).unwrap();
    let committed_1 = target.committed_at(1).unwrap();
    assert!(committed_0 < applied_1, "{:?}", target.operations());
    assert!(committed_1 < target.applied_at(2).unwrap());
    assert!(committed_1 < target.applied_at(3).unwrap());
    assert_eq!(target.committed_seqnos_of(0), vec![1, 3]);
    assert_eq!(queue.status().get_u64("serializationCount"), Some(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn fast_task_waits_for_slowest_task_within_drift() {
    init_test_tracing();

    let config = PipelineConfig {
        batch: BatchConfig {
            max_size: 1,
            max_fill_ms: 1,
        },
        ..pipeline_config()
    };
    let source: Arc<dyn SerialLog> = Arc::new(MemoryLog::new());
    let queue = ParallelQueue::new(config.id, "q", config.queue.clone()).unwrap();
    let target = MemoryApplier::new().slow_at(2, Duration::from_millis(500));

    let mut pipeline = Pipeline::new(config);
    pipeline.add_stage(thl_to_q(&source, &queue)).add_stage(
        q_to_dbms(&queue, &target)
            .with_task_drift(Duration::from_secs(2), Duration::from_millis(10)),
    );
    pipeline.start().unwrap();

    // Both tasks report a position before task 1 falls behind.
    source.append(event(0, "db1")).await.unwrap();
    source.append(event(1, "db0")).await.unwrap();
    tokio::time::timeout(WATCH_TIMEOUT, target.wait_for_committed(2))
        .await
        .unwrap();

    // Seqno 3 keeps task 1 busy, so seqno 4, more than two seconds ahead of task 1, has to
    // wait for the slow seqno 2 to commit.
    for (seqno, shard) in [(2, "db1"), (3, "db1"), (4, "db0"), (5, "db0")] {
        source.append(event(seqno, shard)).await.unwrap();
    }
    tokio::time::timeout(WATCH_TIMEOUT, target.wait_for_committed(6))
        .await
        .unwrap();

    pipeline.shutdown_and_wait(ShutdownMode::Clean).await.unwrap();

    let committed_2 = target.committed_at(2).unwrap();
    assert!(
        committed_2 < target.applied_at(4).unwrap(),
        "{:?}",
        target.operations()
    );
    assert_eq!(target.committed_seqnos_of(0), vec![1, 4, 5]);
    assert_eq!(target.committed_seqnos_of(1), vec![0, 2, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reports_stages_and_queues() {
    init_test_tracing();

    let target = MemoryApplier::new();
    let (mut pipeline, source, _queue) = log_fed_pipeline(&target);

    let status = pipeline.status();
    assert_eq!(
        status.get("state").and_then(|value| value.as_str()),
        Some("notStarted")
    );

    pipeline.start().unwrap();
    for event in sharded_events(0..9) {
        source.append(event).await.unwrap();
    }
    target.wait_for_committed(9).await;

    let status = pipeline.status();
    assert_eq!(status.get_u64("pipelineId"), Some(1));
    assert_eq!(
        status.get("serviceName").and_then(|value| value.as_str()),
        Some("alpha")
    );
    assert_eq!(
        status.get("state").and_then(|value| value.as_str()),
        Some("started")
    );
    assert_eq!(status.get_u64("stage.q-to-dbms.taskCount"), Some(3));
    assert_eq!(status.get_u64("stage.thl-to-q.taskCount"), Some(1));
    assert_eq!(status.get_u64("queue.q.partitions"), Some(3));
    assert_eq!(status.get_u64("queue.q.eventCount"), Some(9));
    assert_eq!(status.get_u64("queue.q.maxSize"), Some(20));

    pipeline.shutdown_and_wait(ShutdownMode::Clean).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pipeline_rejects_invalid_stage_layouts() {
    init_test_tracing();

    let mut empty = Pipeline::new(pipeline_config());
    assert_eq!(empty.start().unwrap_err().kind(), ErrorKind::ConfigError);

    let queue = ParallelQueue::new(1, "q", queue_config()).unwrap();
    let target = MemoryApplier::new();
    let mismatched = {
        let extract_queue = queue.clone();
        let target = target.clone();
        StageBuilder::new(
            "q-to-dbms",
            2,
            move |task_id| extractor(ParallelQueueExtractor::new(extract_queue.clone(), task_id)),
            move |task_id| applier(target.for_task(task_id)),
        )
        .with_sync_source(queue.clone())
    };

    let mut pipeline = Pipeline::new(pipeline_config());
    pipeline.add_stage(mismatched);
    assert_eq!(pipeline.start().unwrap_err().kind(), ErrorKind::ConfigError);
    assert!(pipeline.stages().is_empty());
}
