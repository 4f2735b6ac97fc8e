use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use config::shared::{ParallelQueueConfig, PartitionerConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use telemetry::tracing::init_test_tracing;
use thl::error::ThlResult;
use thl::partition::HashPartitioner;
use thl::queue::ParallelQueue;
use thl::test_utils::event::{event, fragments};
use thl::types::{ReplItem, Seqno, UNKNOWN_SHARD_ID};

fn queue_config(partitions: u32, max_size: usize) -> ParallelQueueConfig {
    ParallelQueueConfig {
        partitions,
        max_size,
        sync_enabled: false,
        sync_interval: 1,
        serialization_timeout_ms: 10_000,
        partitioner: PartitionerConfig::Hash {
            critical_shards: BTreeSet::new(),
        },
    }
}

async fn drain_events(queue: &ParallelQueue, channel: usize, count: usize) -> Vec<Seqno> {
    let mut seqnos = Vec::with_capacity(count);
    while seqnos.len() < count {
        let item = tokio::time::timeout(Duration::from_secs(30), queue.get(channel))
            .await
            .expect("channel was not fed in time")
            .unwrap();
        if let ReplItem::Event(event) = item {
            seqnos.push(event.seqno());
        }
    }

    seqnos
}

async fn drain_available(queue: &ParallelQueue, channel: usize) -> Vec<ReplItem> {
    let mut items = Vec::new();
    while let Some(item) = queue
        .get_timeout(channel, Duration::from_millis(20))
        .await
        .unwrap()
    {
        items.push(item);
    }

    items
}

#[tokio::test(flavor = "multi_thread")]
async fn lagging_channel_does_not_hold_back_other_channels() {
    init_test_tracing();

    let queue = ParallelQueue::new(1, "lagging", queue_config(3, 10)).unwrap();
    assert_eq!(HashPartitioner::shard_hash("db0") % 3, 0);
    assert_eq!(HashPartitioner::shard_hash("db1") % 3, 1);

    let producer = tokio::spawn({
        let queue = queue.clone();
        async move {
            for seqno in 0..100_000 {
                queue.put(event(seqno, "db0")).await?;
            }
            for seqno in 100_000..100_100 {
                queue.put(event(seqno, "db1")).await?;
            }
            ThlResult::Ok(())
        }
    });

    // The db0 consumer stops early and leaves its channel full.
    let db0_consumer = tokio::spawn({
        let queue = queue.clone();
        async move { drain_events(&queue, 0, 99_990).await }
    });
    let db1_consumer = tokio::spawn({
        let queue = queue.clone();
        async move { drain_events(&queue, 1, 100).await }
    });

    let db1_seqnos = db1_consumer.await.unwrap();
    assert_eq!(db1_seqnos, (100_000..100_100).collect::<Vec<_>>());

    producer.await.unwrap().unwrap();
    assert_eq!(queue.channel_size(0), 10);

    let mut db0_seqnos = db0_consumer.await.unwrap();
    db0_seqnos.extend(drain_events(&queue, 0, 10).await);
    assert_eq!(db0_seqnos, (0..100_000).collect::<Vec<_>>());

    let status = queue.status();
    assert_eq!(status.get_u64("eventCount"), Some(100_100));
    assert_eq!(status.get_u64("commitCount"), Some(100_100));
    assert_eq!(status.get_u64("serializationCount"), Some(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn shards_keep_their_channel_and_channels_stay_ordered() {
    init_test_tracing();

    let mut rng = StdRng::seed_from_u64(11);
    let queue = ParallelQueue::new(1, "stable", queue_config(4, 10_000)).unwrap();

    let mut shards_by_seqno = HashMap::new();
    for seqno in 0..2_000 {
        let shard = format!("shard{}", rng.gen_range(0..25));
        queue.put(event(seqno, &shard)).await.unwrap();
        shards_by_seqno.insert(seqno, shard);
    }

    let mut channel_of_shard: HashMap<String, usize> = HashMap::new();
    let mut total = 0;
    for channel in 0..4 {
        let seqnos: Vec<Seqno> = drain_available(&queue, channel)
            .await
            .iter()
            .filter_map(|item| item.header().map(|header| header.seqno))
            .collect();
        assert!(seqnos.windows(2).all(|pair| pair[0] < pair[1]));

        for seqno in &seqnos {
            let shard = shards_by_seqno[seqno].clone();
            let previous = channel_of_shard.insert(shard.clone(), channel);
            assert!(previous.is_none_or(|previous| previous == channel), "{shard} moved");
        }
        total += seqnos.len();
    }

    assert_eq!(total, 2_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn critical_transactions_are_serialized_with_live_consumers() {
    init_test_tracing();

    let queue = ParallelQueue::new(1, "serialized", queue_config(3, 5)).unwrap();

    let consumers: Vec<_> = (0..3)
        .map(|channel| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut items = Vec::new();
                loop {
                    match queue.get(channel).await.unwrap() {
                        ReplItem::Control(_) => break items,
                        item => items.push(item),
                    }
                }
            })
        })
        .collect();

    let mut critical = Vec::new();
    let mut seqno = 0;
    for round in 0..20 {
        for shard in ["db0", "db1", "db2"] {
            queue.put(event(seqno, shard)).await.unwrap();
            seqno += 1;
        }
        if round % 4 == 0 {
            for fragment in fragments(seqno, UNKNOWN_SHARD_ID, 3) {
                queue.put(fragment).await.unwrap();
            }
            critical.push(seqno);
            seqno += 1;
        }
    }
    queue.insert_stop_event().await.unwrap();

    let mut received = 0;
    for (channel, consumer) in consumers.into_iter().enumerate() {
        let items = consumer.await.unwrap();
        let seqnos: Vec<Seqno> = items
            .iter()
            .filter_map(|item| item.header().map(|header| header.seqno))
            .collect();
        assert!(seqnos.windows(2).all(|pair| pair[0] <= pair[1]));

        for seqno in &critical {
            let count = seqnos.iter().filter(|s| *s == seqno).count();
            assert_eq!(count, if channel == 0 { 3 } else { 0 });
        }
        received += items.len();
    }

    assert_eq!(received, 60 + critical.len() * 3);
    assert_eq!(
        queue.status().get_u64("serializationCount"),
        Some(critical.len() as u64)
    );
}
