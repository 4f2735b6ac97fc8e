use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Seqno;

/// Position metadata of a replicated transaction fragment.
///
/// A transaction may span several fragments sharing one seqno; only the fragment with
/// `last_frag` set completes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplHeader {
    pub seqno: Seqno,
    pub fragno: i16,
    pub last_frag: bool,
    pub shard_id: String,
    pub source_id: String,
    pub source_timestamp: DateTime<Utc>,
}

impl fmt::Display for ReplHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seqno={} fragno={}{} shard={}",
            self.seqno,
            self.fragno,
            if self.last_frag { " (last)" } else { "" },
            self.shard_id
        )
    }
}

/// A replicated change event: a header plus a payload the pipeline never inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplEvent {
    pub header: ReplHeader,
    pub payload: Bytes,
}

impl ReplEvent {
    /// Creates a single-fragment event stamped with the current time.
    pub fn new(seqno: Seqno, shard_id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            header: ReplHeader {
                seqno,
                fragno: 0,
                last_frag: true,
                shard_id: shard_id.into(),
                source_id: String::new(),
                source_timestamp: Utc::now(),
            },
            payload: payload.into(),
        }
    }

    pub fn with_fragment(mut self, fragno: i16, last_frag: bool) -> Self {
        self.header.fragno = fragno;
        self.header.last_frag = last_frag;
        self
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.header.source_id = source_id.into();
        self
    }

    pub fn with_source_timestamp(mut self, source_timestamp: DateTime<Utc>) -> Self {
        self.header.source_timestamp = source_timestamp;
        self
    }

    pub fn seqno(&self) -> Seqno {
        self.header.seqno
    }

    pub fn fragno(&self) -> i16 {
        self.header.fragno
    }

    pub fn last_frag(&self) -> bool {
        self.header.last_frag
    }

    pub fn shard_id(&self) -> &str {
        &self.header.shard_id
    }

    pub fn source_timestamp(&self) -> DateTime<Utc> {
        self.header.source_timestamp
    }
}

/// Kind of a [`ReplControlEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlKind {
    /// Consumers commit and stop after reading it.
    Stop,
    /// Consumers commit and report the carried position to watches.
    Sync,
}

/// Control event inserted into every channel of a parallel queue.
///
/// It carries the header of the last event put before it, which is the position every channel
/// has reached once the control event is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplControlEvent {
    pub kind: ControlKind,
    pub header: Option<ReplHeader>,
}

impl ReplControlEvent {
    pub fn new(kind: ControlKind, header: Option<ReplHeader>) -> Self {
        Self { kind, header }
    }
}

/// An item moving between pipeline stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplItem {
    Event(ReplEvent),
    Control(ReplControlEvent),
}

impl ReplItem {
    /// Position of the item, if it has one.
    pub fn header(&self) -> Option<&ReplHeader> {
        match self {
            ReplItem::Event(event) => Some(&event.header),
            ReplItem::Control(control) => control.header.as_ref(),
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, ReplItem::Control(_))
    }
}

impl From<ReplEvent> for ReplItem {
    fn from(event: ReplEvent) -> Self {
        ReplItem::Event(event)
    }
}

impl From<ReplControlEvent> for ReplItem {
    fn from(control: ReplControlEvent) -> Self {
        ReplItem::Control(control)
    }
}
