use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::bail;
use crate::error::{ErrorKind, ThlResult};
use crate::log::{LogCursor, SerialLog};
use crate::types::{ReplEvent, Seqno};

#[derive(Debug, Default)]
struct LogState {
    events: Vec<ReplEvent>,
    closed: bool,
}

/// A [`SerialLog`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    state: Mutex<LogState>,
    appended: Notify,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SerialLog for MemoryLog {
    async fn append(&self, event: ReplEvent) -> ThlResult<()> {
        {
            let mut state = self.lock();
            if state.closed {
                bail!(
                    ErrorKind::InvalidState,
                    "Cannot append to a closed log",
                    format!("seqno {}", event.seqno())
                );
            }

            if let Some(last) = state.events.last()
                && (event.seqno(), event.fragno()) <= (last.seqno(), last.fragno())
            {
                bail!(
                    ErrorKind::ConsistencyViolation,
                    "Log position must grow on every append",
                    format!(
                        "appending {}/{} after {}/{}",
                        event.seqno(),
                        event.fragno(),
                        last.seqno(),
                        last.fragno()
                    )
                );
            }

            state.events.push(event);
        }

        self.appended.notify_waiters();

        Ok(())
    }

    async fn next(&self, cursor: &mut LogCursor) -> ThlResult<Option<ReplEvent>> {
        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            {
                let state = self.lock();
                let index = state.events.partition_point(|event| !cursor.admits(event));
                if let Some(event) = state.events.get(index) {
                    cursor.advance(event);
                    return Ok(Some(event.clone()));
                }

                if state.closed {
                    return Ok(None);
                }
            }

            appended.await;
        }
    }

    fn last_seqno(&self) -> Option<Seqno> {
        self.lock().events.last().map(ReplEvent::seqno)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.appended.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
