//! Watches: futures resolved when the events flowing through a stage reach a position.
//!
//! Every stage owns two [`WatchRegistry`]s. The processed registry is offered each event as a
//! task sees it, so a processed watch resolves on the exact event that satisfies it. The
//! committed registry is offered the last committed position whenever a task commits, so a
//! committed watch may resolve at or after the requested position.

mod future;
mod predicate;
mod registry;

pub use future::WatchFuture;
pub use predicate::{
    SeqnoWatchPredicate, SourceIdSeqnoWatchPredicate, SourceTimestampWatchPredicate,
    WatchPredicate,
};
pub use registry::{WatchAction, WatchRegistry, WatchScope};

use crate::types::{ReplHeader, Seqno};

/// A position a watch can resolve with.
pub trait WatchPosition: Clone + Send + Sync + 'static {
    fn seqno(&self) -> Seqno;
}

impl WatchPosition for ReplHeader {
    fn seqno(&self) -> Seqno {
        self.seqno
    }
}
