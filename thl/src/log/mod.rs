//! Serial transaction history log.
//!
//! The log is an ordered append-only sequence of events keyed by `(seqno, fragno)`. It is the
//! single-writer source the parallel queue fans out from.

mod memory;

use std::fmt::Debug;

use async_trait::async_trait;

pub use memory::MemoryLog;

use crate::error::ThlResult;
use crate::types::{ReplEvent, Seqno};

/// Read position in a [`SerialLog`].
///
/// Points at the first event whose `(seqno, fragno)` is at or after the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogCursor {
    seqno: Seqno,
    fragno: i16,
}

impl LogCursor {
    /// Cursor before the first event of the log.
    pub fn start() -> Self {
        Self {
            seqno: Seqno::MIN,
            fragno: 0,
        }
    }

    /// Cursor before the first fragment of `seqno`.
    pub fn at(seqno: Seqno) -> Self {
        Self { seqno, fragno: 0 }
    }

    pub fn seqno(&self) -> Seqno {
        self.seqno
    }

    /// Moves the cursor past `event`.
    pub fn advance(&mut self, event: &ReplEvent) {
        *self = if event.last_frag() {
            Self::at(event.seqno().saturating_add(1))
        } else {
            Self {
                seqno: event.seqno(),
                fragno: event.fragno().saturating_add(1),
            }
        };
    }

    pub(crate) fn admits(&self, event: &ReplEvent) -> bool {
        (event.seqno(), event.fragno()) >= (self.seqno, self.fragno)
    }
}

impl Default for LogCursor {
    fn default() -> Self {
        Self::start()
    }
}

/// An ordered append log keyed by seqno.
#[async_trait]
pub trait SerialLog: Send + Sync + Debug {
    /// Appends an event; `(seqno, fragno)` must grow strictly.
    async fn append(&self, event: ReplEvent) -> ThlResult<()>;

    /// Returns the event at `cursor` and moves the cursor past it.
    ///
    /// Waits while the cursor is at the end of an open log and returns `None` at the end of a
    /// closed one.
    async fn next(&self, cursor: &mut LogCursor) -> ThlResult<Option<ReplEvent>>;

    fn last_seqno(&self) -> Option<Seqno>;

    /// Marks the end of the log. Readers drain what is left and then see the end.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
