use std::fmt;

use chrono::{DateTime, Utc};

use crate::types::{ReplHeader, Seqno};

/// Condition a watch waits for.
pub trait WatchPredicate<H>: Send + Sync {
    fn matches(&self, header: &H) -> bool;
}

impl<H, F> WatchPredicate<H> for F
where
    F: Fn(&H) -> bool + Send + Sync,
{
    fn matches(&self, header: &H) -> bool {
        self(header)
    }
}

/// Matches positions at or beyond a seqno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqnoWatchPredicate {
    pub seqno: Seqno,
}

impl SeqnoWatchPredicate {
    pub fn new(seqno: Seqno) -> Self {
        Self { seqno }
    }
}

impl WatchPredicate<ReplHeader> for SeqnoWatchPredicate {
    fn matches(&self, header: &ReplHeader) -> bool {
        header.seqno >= self.seqno
    }
}

impl fmt::Display for SeqnoWatchPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seqno >= {}", self.seqno)
    }
}

/// Matches positions whose source timestamp is at or beyond a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceTimestampWatchPredicate {
    pub timestamp: DateTime<Utc>,
}

impl SourceTimestampWatchPredicate {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self { timestamp }
    }
}

impl WatchPredicate<ReplHeader> for SourceTimestampWatchPredicate {
    fn matches(&self, header: &ReplHeader) -> bool {
        header.source_timestamp >= self.timestamp
    }
}

/// Matches positions from one source at or beyond a seqno.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIdSeqnoWatchPredicate {
    pub source_id: String,
    pub seqno: Seqno,
}

impl SourceIdSeqnoWatchPredicate {
    pub fn new(source_id: impl Into<String>, seqno: Seqno) -> Self {
        Self {
            source_id: source_id.into(),
            seqno,
        }
    }
}

impl WatchPredicate<ReplHeader> for SourceIdSeqnoWatchPredicate {
    fn matches(&self, header: &ReplHeader) -> bool {
        header.source_id == self.source_id && header.seqno >= self.seqno
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplEvent;

    #[test]
    fn predicates_match_at_or_after_target() {
        let header = ReplEvent::new(50, "db0", "").with_source_id("m1").header;

        assert!(SeqnoWatchPredicate::new(50).matches(&header));
        assert!(!SeqnoWatchPredicate::new(51).matches(&header));
        assert!(SourceTimestampWatchPredicate::new(header.source_timestamp).matches(&header));
        assert!(SourceIdSeqnoWatchPredicate::new("m1", 49).matches(&header));
        assert!(!SourceIdSeqnoWatchPredicate::new("m2", 49).matches(&header));
        assert!((|h: &ReplHeader| h.shard_id == "db0").matches(&header));
    }
}
