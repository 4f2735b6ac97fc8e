use chrono::{DateTime, TimeDelta, Utc};

use crate::types::{ReplEvent, ReplItem, Seqno};

/// Fixed base time so event timestamps are reproducible.
pub fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

/// Single-fragment event whose source timestamp is `seqno` seconds after [`base_time`].
pub fn event(seqno: Seqno, shard_id: &str) -> ReplEvent {
    ReplEvent::new(seqno, shard_id, format!("payload-{seqno}"))
        .with_source_id("source")
        .with_source_timestamp(base_time() + TimeDelta::seconds(seqno))
}

/// One event per seqno of `seqnos`, all on `shard_id`.
pub fn events(seqnos: impl IntoIterator<Item = Seqno>, shard_id: &str) -> Vec<ReplEvent> {
    seqnos
        .into_iter()
        .map(|seqno| event(seqno, shard_id))
        .collect()
}

/// The `fragments` fragments of one transaction.
pub fn fragments(seqno: Seqno, shard_id: &str, fragments: i16) -> Vec<ReplEvent> {
    (0..fragments)
        .map(|fragno| event(seqno, shard_id).with_fragment(fragno, fragno == fragments - 1))
        .collect()
}

pub fn items(events: impl IntoIterator<Item = ReplEvent>) -> Vec<ReplItem> {
    events.into_iter().map(ReplItem::Event).collect()
}
