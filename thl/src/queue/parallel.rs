use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use config::shared::ParallelQueueConfig;
use metrics::counter;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bail;
use crate::error::{ErrorKind, ThlResult};
use crate::failpoints::{PARALLEL_QUEUE_BEFORE_PUT, thl_fail_point};
use crate::metrics::{
    PIPELINE_ID_LABEL, QUEUE_LABEL, THL_QUEUE_DISCARDED_TOTAL, THL_QUEUE_EVENTS_TOTAL,
    THL_QUEUE_SERIALIZATIONS_TOTAL,
};
use crate::partition::{Partitioner, PartitionerResponse, build_partitioner};
use crate::status::StatusProperties;
use crate::types::{
    ControlKind, PipelineId, ReplControlEvent, ReplEvent, ReplHeader, ReplItem, Seqno, TaskId,
};
use crate::watch::WatchPredicate;

/// Routing of the transaction currently being put.
#[derive(Debug, Clone, Copy)]
struct OpenTransaction {
    seqno: Seqno,
    route: PartitionerResponse,
}

/// State owned by the single producer feeding the queue.
#[derive(Debug, Default)]
struct ProducerState {
    last_seqno: Option<Seqno>,
    open_transaction: Option<OpenTransaction>,
    events_since_sync: u64,
}

/// Progress of one channel as seen by the producer and reported by the consumer.
#[derive(Debug, Default, Clone, Copy)]
struct ChannelProgress {
    /// Seqno of the last event put into the channel.
    sent: Option<Seqno>,
    /// Highest seqno the consumer reported as committed.
    committed: Option<Seqno>,
}

impl ChannelProgress {
    fn settled(&self) -> bool {
        match self.sent {
            None => true,
            Some(sent) => self.committed.is_some_and(|committed| committed >= sent),
        }
    }
}

struct QueueInner {
    pipeline_id: PipelineId,
    name: String,
    config: ParallelQueueConfig,
    partitioner: Arc<dyn Partitioner>,
    senders: Vec<mpsc::Sender<ReplItem>>,
    receivers: Vec<Mutex<mpsc::Receiver<ReplItem>>>,
    producer: Mutex<ProducerState>,
    /// Signalled every time an item leaves a channel or a consumer commits.
    drained: Notify,
    progress: StdMutex<Vec<ChannelProgress>>,
    /// Set once consumers report their commits through [`ParallelQueue::acknowledge`].
    track_commits: AtomicBool,
    last_header: StdMutex<Option<ReplHeader>>,
    sync_predicates: StdMutex<Vec<Box<dyn WatchPredicate<ReplHeader>>>>,
    event_count: AtomicU64,
    commit_count: AtomicU64,
    serialization_count: AtomicU64,
    discard_count: AtomicU64,
}

/// Fans a serial stream of events out into `partitions` bounded channels.
///
/// Events are routed by the configured [`Partitioner`], so each channel sees its events in
/// stream order. Critical events are serialized: before their first fragment is delivered every
/// channel is drained, and after their last fragment channel 0 is drained again, so they hold
/// the same position relative to every channel. Once commit tracking is enabled, a channel only
/// counts as drained when its consumer also committed everything put into it. Control events
/// are broadcast to all channels at the position they were inserted.
///
/// A full channel blocks the producer; other channels are not affected until the producer needs
/// to put into the full one.
#[derive(Clone)]
pub struct ParallelQueue {
    inner: Arc<QueueInner>,
}

impl ParallelQueue {
    pub fn new(
        pipeline_id: PipelineId,
        name: impl Into<String>,
        config: ParallelQueueConfig,
    ) -> ThlResult<Self> {
        let partitioner = build_partitioner(&config.partitioner);

        Self::with_partitioner(pipeline_id, name, config, partitioner)
    }

    /// Creates a queue routing through a caller supplied partitioner.
    pub fn with_partitioner(
        pipeline_id: PipelineId,
        name: impl Into<String>,
        config: ParallelQueueConfig,
        partitioner: Arc<dyn Partitioner>,
    ) -> ThlResult<Self> {
        config.validate()?;

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..config.partitions)
            .map(|_| {
                let (tx, rx) = mpsc::channel(config.max_size);
                (tx, Mutex::new(rx))
            })
            .unzip();

        let progress = vec![ChannelProgress::default(); senders.len()];

        Ok(Self {
            inner: Arc::new(QueueInner {
                pipeline_id,
                name: name.into(),
                config,
                partitioner,
                senders,
                receivers,
                producer: Mutex::new(ProducerState::default()),
                drained: Notify::new(),
                progress: StdMutex::new(progress),
                track_commits: AtomicBool::new(false),
                last_header: StdMutex::new(None),
                sync_predicates: StdMutex::new(Vec::new()),
                event_count: AtomicU64::new(0),
                commit_count: AtomicU64::new(0),
                serialization_count: AtomicU64::new(0),
                discard_count: AtomicU64::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn partitions(&self) -> u32 {
        self.inner.config.partitions
    }

    pub fn config(&self) -> &ParallelQueueConfig {
        &self.inner.config
    }

    /// Header of the last event put into the queue.
    pub fn last_header(&self) -> Option<ReplHeader> {
        lock(&self.inner.last_header).clone()
    }

    /// Puts an event into the channel chosen by the partitioner.
    ///
    /// Blocks while the target channel is full. Fails when the seqno moves backwards or when
    /// serializing a critical event cannot drain the channels within the configured timeout.
    pub async fn put(&self, event: ReplEvent) -> ThlResult<()> {
        thl_fail_point(PARALLEL_QUEUE_BEFORE_PUT)?;

        let inner = &self.inner;
        let mut producer = inner.producer.lock().await;

        let seqno = event.seqno();
        if let Some(last_seqno) = producer.last_seqno
            && seqno < last_seqno
        {
            bail!(
                ErrorKind::ConsistencyViolation,
                "Event seqno moved backwards in parallel queue",
                format!("queue {}: seqno {seqno} after {last_seqno}", inner.name)
            );
        }

        // Every fragment of a transaction follows the route chosen for its first fragment.
        let (route, first_fragment) = match producer.open_transaction {
            Some(open) if open.seqno == seqno => (open.route, false),
            _ => {
                let route = inner
                    .partitioner
                    .partition(&event.header, inner.config.partitions);
                producer.open_transaction = Some(OpenTransaction { seqno, route });
                (route, true)
            }
        };

        if route.critical && first_fragment {
            inner.serialization_count.fetch_add(1, Ordering::Relaxed);
            counter!(
                THL_QUEUE_SERIALIZATIONS_TOTAL,
                PIPELINE_ID_LABEL => inner.pipeline_id.to_string(),
                QUEUE_LABEL => inner.name.clone(),
            )
            .increment(1);

            debug!(seqno, shard_id = %event.shard_id(), "serializing critical event");
            self.quiesce(None).await?;
        }

        let header = event.header.clone();
        self.send(route.partition, ReplItem::Event(event)).await?;
        if let Some(progress) = lock(&inner.progress).get_mut(route.partition as usize) {
            progress.sent = Some(seqno);
        }

        producer.last_seqno = Some(seqno);
        *lock(&inner.last_header) = Some(header.clone());
        producer.events_since_sync += 1;
        inner.event_count.fetch_add(1, Ordering::Relaxed);
        counter!(
            THL_QUEUE_EVENTS_TOTAL,
            PIPELINE_ID_LABEL => inner.pipeline_id.to_string(),
            QUEUE_LABEL => inner.name.clone(),
        )
        .increment(1);

        if !header.last_frag {
            return Ok(());
        }

        producer.open_transaction = None;
        inner.commit_count.fetch_add(1, Ordering::Relaxed);

        if route.critical {
            self.quiesce(Some(route.partition)).await?;
        }

        let sync_requested = self.take_matching_sync_predicates(&header);
        let sync_due = inner.config.sync_enabled
            && producer.events_since_sync >= inner.config.sync_interval;
        if sync_requested || sync_due {
            producer.events_since_sync = 0;
            self.broadcast(ReplControlEvent::new(ControlKind::Sync, Some(header)))
                .await?;
        }

        Ok(())
    }

    /// Broadcasts a stop event after the last event put so far.
    pub async fn insert_stop_event(&self) -> ThlResult<()> {
        let _producer = self.inner.producer.lock().await;
        let header = self.last_header();

        info!(
            queue = %self.inner.name,
            seqno = ?header.as_ref().map(|h| h.seqno),
            "inserting stop event"
        );

        self.broadcast(ReplControlEvent::new(ControlKind::Stop, header))
            .await
    }

    /// Broadcasts a sync event at the first transaction boundary matching `predicate`.
    ///
    /// When the last transaction put already matches, the sync event is broadcast immediately.
    pub async fn insert_watch_sync_event<P>(&self, predicate: P) -> ThlResult<()>
    where
        P: WatchPredicate<ReplHeader> + 'static,
    {
        let producer = self.inner.producer.lock().await;

        if producer.open_transaction.is_none()
            && let Some(header) = self.last_header()
            && predicate.matches(&header)
        {
            return self
                .broadcast(ReplControlEvent::new(ControlKind::Sync, Some(header)))
                .await;
        }

        lock(&self.inner.sync_predicates).push(Box::new(predicate));

        Ok(())
    }

    /// Takes the next item of `task_id`'s channel, waiting while the channel is empty.
    pub async fn get(&self, task_id: TaskId) -> ThlResult<ReplItem> {
        let receiver = self.receiver(task_id)?;
        let item = receiver.lock().await.recv().await;
        self.inner.drained.notify_waiters();

        match item {
            Some(item) => Ok(item),
            None => bail!(
                ErrorKind::InvalidState,
                "Parallel queue channel closed",
                format!("queue {} channel {task_id}", self.inner.name)
            ),
        }
    }

    /// Like [`ParallelQueue::get`], returning `None` when nothing arrives within `timeout`.
    pub async fn get_timeout(
        &self,
        task_id: TaskId,
        timeout: Duration,
    ) -> ThlResult<Option<ReplItem>> {
        match tokio::time::timeout(timeout, self.get(task_id)).await {
            Ok(item) => item.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Makes serialization also wait for consumers to commit what they took from their channels.
    ///
    /// Consumers must then report their commits through [`ParallelQueue::acknowledge`].
    pub fn track_commits(&self) {
        self.inner.track_commits.store(true, Ordering::Release);
    }

    /// Records that the consumer of `task_id`'s channel committed up to `seqno`.
    pub fn acknowledge(&self, task_id: TaskId, seqno: Seqno) {
        {
            let mut progress = lock(&self.inner.progress);
            let Some(progress) = progress.get_mut(task_id) else {
                return;
            };
            if progress.committed.is_none_or(|committed| committed < seqno) {
                progress.committed = Some(seqno);
            }
        }

        self.inner.drained.notify_waiters();
    }

    /// Number of items waiting in `task_id`'s channel.
    pub fn channel_size(&self, task_id: TaskId) -> usize {
        self.inner
            .senders
            .get(task_id)
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Drops everything waiting in the channels and returns the number of dropped items.
    ///
    /// Meant for an immediate shutdown, once the consumers stopped.
    pub async fn discard(&self) -> u64 {
        let mut discarded = 0;
        for receiver in &self.inner.receivers {
            let mut receiver = receiver.lock().await;
            while receiver.try_recv().is_ok() {
                discarded += 1;
            }
        }
        lock(&self.inner.sync_predicates).clear();

        self.inner
            .discard_count
            .fetch_add(discarded, Ordering::Relaxed);
        self.inner.drained.notify_waiters();

        if discarded > 0 {
            counter!(
                THL_QUEUE_DISCARDED_TOTAL,
                PIPELINE_ID_LABEL => self.inner.pipeline_id.to_string(),
                QUEUE_LABEL => self.inner.name.clone(),
            )
            .increment(discarded);
            warn!(queue = %self.inner.name, discarded, "discarded queued items");
        }

        discarded
    }

    pub fn status(&self) -> StatusProperties {
        let inner = &self.inner;
        let mut status = StatusProperties::new();
        status.set("maxSize", inner.config.max_size as u64);
        status.set("eventCount", inner.event_count.load(Ordering::Relaxed));
        status.set("commitCount", inner.commit_count.load(Ordering::Relaxed));
        status.set(
            "serializationCount",
            inner.serialization_count.load(Ordering::Relaxed),
        );
        status.set("discardCount", inner.discard_count.load(Ordering::Relaxed));
        status.set("partitions", inner.config.partitions);
        status.set(
            "syncInterval",
            if inner.config.sync_enabled {
                inner.config.sync_interval
            } else {
                0
            },
        );
        for task_id in 0..inner.senders.len() {
            status.set(
                format!("channel.{task_id}.size"),
                self.channel_size(task_id) as u64,
            );
        }

        status
    }

    async fn send(&self, partition: u32, item: ReplItem) -> ThlResult<()> {
        let Some(tx) = self.inner.senders.get(partition as usize) else {
            bail!(
                ErrorKind::InvalidState,
                "Partitioner returned a partition outside of the queue",
                format!("partition {partition} of {}", self.inner.config.partitions)
            );
        };

        if tx.send(item).await.is_err() {
            bail!(
                ErrorKind::InvalidState,
                "Parallel queue channel closed",
                format!("queue {} channel {partition}", self.inner.name)
            );
        }

        Ok(())
    }

    /// Puts `control` into every channel. The caller holds the producer lock.
    async fn broadcast(&self, control: ReplControlEvent) -> ThlResult<()> {
        for partition in 0..self.inner.config.partitions {
            self.send(partition, ReplItem::Control(control.clone()))
                .await?;
        }

        Ok(())
    }

    /// Waits until the given channel, or every channel, has been drained by its consumer.
    async fn quiesce(&self, partition: Option<u32>) -> ThlResult<()> {
        let timeout = Duration::from_millis(self.inner.config.serialization_timeout_ms);
        let deadline = Instant::now() + timeout;

        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            let quiesced = match partition {
                Some(partition) => self.is_quiesced(partition as usize),
                None => (0..self.inner.senders.len()).all(|task_id| self.is_quiesced(task_id)),
            };
            if quiesced {
                return Ok(());
            }

            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                bail!(
                    ErrorKind::SerializationTimeout,
                    "Channels were not drained in time to serialize a critical event",
                    format!("queue {} waited {timeout:?}", self.inner.name)
                );
            }
        }
    }

    /// Whether `task_id`'s channel is empty and, when commits are tracked, fully committed.
    fn is_quiesced(&self, task_id: TaskId) -> bool {
        if self.channel_size(task_id) > 0 {
            return false;
        }
        if !self.inner.track_commits.load(Ordering::Acquire) {
            return true;
        }

        lock(&self.inner.progress)
            .get(task_id)
            .is_none_or(ChannelProgress::settled)
    }

    fn take_matching_sync_predicates(&self, header: &ReplHeader) -> bool {
        let mut predicates = lock(&self.inner.sync_predicates);
        let pending = predicates.len();
        predicates.retain(|predicate| !predicate.matches(header));

        predicates.len() < pending
    }

    fn receiver(&self, task_id: TaskId) -> ThlResult<&Mutex<mpsc::Receiver<ReplItem>>> {
        match self.inner.receivers.get(task_id) {
            Some(receiver) => Ok(receiver),
            None => bail!(
                ErrorKind::InvalidState,
                "Task has no channel in the parallel queue",
                format!("task {task_id} of {}", self.inner.receivers.len())
            ),
        }
    }
}

impl std::fmt::Debug for ParallelQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelQueue")
            .field("pipeline_id", &self.inner.pipeline_id)
            .field("name", &self.inner.name)
            .field("partitions", &self.inner.config.partitions)
            .field("partitioner", &self.inner.partitioner)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use config::shared::PartitionerConfig;

    use super::*;
    use crate::types::UNKNOWN_SHARD_ID;
    use crate::watch::SeqnoWatchPredicate;

    fn queue(partitions: u32, max_size: usize, sync_enabled: bool) -> ParallelQueue {
        let config = ParallelQueueConfig {
            partitions,
            max_size,
            sync_enabled,
            sync_interval: 5,
            serialization_timeout_ms: 100,
            partitioner: PartitionerConfig::Hash {
                critical_shards: BTreeSet::new(),
            },
        };

        ParallelQueue::new(1, "test", config).unwrap()
    }

    fn seqnos(items: &[ReplItem]) -> Vec<Option<i64>> {
        items.iter().map(|item| item.header().map(|h| h.seqno)).collect()
    }

    #[tokio::test]
    async fn routes_shards_to_stable_channels() {
        let queue = queue(3, 10, false);
        queue.put(ReplEvent::new(0, "db0", "")).await.unwrap();
        queue.put(ReplEvent::new(1, "db1", "")).await.unwrap();
        queue.put(ReplEvent::new(2, "db0", "")).await.unwrap();

        assert_eq!(queue.channel_size(0), 2);
        assert_eq!(queue.channel_size(1), 1);
        assert_eq!(queue.get(0).await.unwrap().header().unwrap().seqno, 0);
        assert_eq!(queue.get(0).await.unwrap().header().unwrap().seqno, 2);
        assert_eq!(queue.get(1).await.unwrap().header().unwrap().seqno, 1);
        assert_eq!(queue.get_timeout(2, Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_seqno_regression() {
        let queue = queue(1, 10, false);
        queue.put(ReplEvent::new(5, "db0", "")).await.unwrap();

        let err = queue.put(ReplEvent::new(4, "db0", "")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConsistencyViolation);
    }

    #[tokio::test]
    async fn fragments_follow_first_fragment_route() {
        let queue = queue(3, 10, false);
        queue
            .put(ReplEvent::new(0, "db1", "").with_fragment(0, false))
            .await
            .unwrap();
        queue
            .put(ReplEvent::new(0, "db2", "").with_fragment(1, true))
            .await
            .unwrap();

        assert_eq!(queue.channel_size(1), 2);
        assert_eq!(queue.status().get_u64("commitCount"), Some(1));
        assert_eq!(queue.status().get_u64("eventCount"), Some(2));
    }

    #[tokio::test]
    async fn periodic_sync_reaches_every_channel() {
        let queue = queue(2, 20, true);
        for seqno in 0..5 {
            queue.put(ReplEvent::new(seqno, "db0", "")).await.unwrap();
        }

        let mut channel_1 = Vec::new();
        while let Some(item) = queue
            .get_timeout(1, Duration::from_millis(10))
            .await
            .unwrap()
        {
            channel_1.push(item);
        }

        assert_eq!(seqnos(&channel_1), vec![Some(4)]);
        assert!(channel_1[0].is_control());
        assert_eq!(queue.channel_size(0), 6);
    }

    #[tokio::test]
    async fn watch_sync_event_is_broadcast_at_matching_boundary() {
        let queue = queue(2, 20, false);
        queue.put(ReplEvent::new(0, "db0", "")).await.unwrap();
        queue
            .insert_watch_sync_event(SeqnoWatchPredicate::new(2))
            .await
            .unwrap();
        queue.put(ReplEvent::new(1, "db0", "")).await.unwrap();
        assert_eq!(queue.channel_size(1), 0);

        queue.put(ReplEvent::new(2, "db0", "")).await.unwrap();

        let item = queue.get(1).await.unwrap();
        assert!(item.is_control());
        assert_eq!(item.header().unwrap().seqno, 2);

        // Already reached positions are synced immediately.
        queue
            .insert_watch_sync_event(SeqnoWatchPredicate::new(1))
            .await
            .unwrap();
        assert_eq!(queue.channel_size(1), 1);
    }

    #[tokio::test]
    async fn critical_event_times_out_when_channels_are_not_drained() {
        let queue = queue(2, 10, false);
        queue.put(ReplEvent::new(0, "db1", "")).await.unwrap();

        let err = queue
            .put(ReplEvent::new(1, UNKNOWN_SHARD_ID, ""))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SerializationTimeout);
        assert_eq!(queue.status().get_u64("serializationCount"), Some(1));
    }

    #[test]
    fn custom_partitioner_queue_validates_its_config() {
        let config = ParallelQueueConfig {
            max_size: 0,
            ..Default::default()
        };
        let partitioner = build_partitioner(&config.partitioner);

        let err = ParallelQueue::with_partitioner(1, "test", config, partitioner).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[tokio::test]
    async fn taken_but_uncommitted_channel_holds_back_critical_event() {
        let queue = queue(2, 10, false);
        queue.track_commits();
        queue.put(ReplEvent::new(0, "db1", "")).await.unwrap();
        queue.get(1).await.unwrap();
        assert_eq!(queue.channel_size(1), 0);

        let err = queue
            .put(ReplEvent::new(1, UNKNOWN_SHARD_ID, ""))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SerializationTimeout);
        assert_eq!(queue.channel_size(0), 0);
    }

    #[tokio::test]
    async fn critical_event_waits_for_its_own_commit() {
        let queue = queue(2, 10, false);
        queue.track_commits();
        queue.put(ReplEvent::new(0, "db1", "")).await.unwrap();
        queue.get(1).await.unwrap();
        queue.acknowledge(1, 0);

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let seqno = queue.get(0).await.unwrap().header().unwrap().seqno;
                queue.acknowledge(0, seqno);
                seqno
            })
        };
        queue
            .put(ReplEvent::new(1, UNKNOWN_SHARD_ID, ""))
            .await
            .unwrap();

        assert_eq!(consumer.await.unwrap(), 1);
        assert_eq!(queue.status().get_u64("serializationCount"), Some(1));
    }

    #[tokio::test]
    async fn stop_event_carries_last_header_and_discard_empties_channels() {
        let queue = queue(2, 10, false);
        queue.put(ReplEvent::new(7, "db0", "")).await.unwrap();
        queue.insert_stop_event().await.unwrap();

        let ReplItem::Control(control) = queue.get(1).await.unwrap() else {
            panic!("expected a control event");
        };
        assert_eq!(control.kind, ControlKind::Stop);
        assert_eq!(control.header.map(|h| h.seqno), Some(7));

        assert_eq!(queue.discard().await, 2);
        assert_eq!(queue.status().get_u64("discardCount"), Some(2));
        assert_eq!(queue.status().get_u64("channel.0.size"), Some(0));
    }
}
