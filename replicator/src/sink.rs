use async_trait::async_trait;
use thl::error::ThlResult;
use thl::pipeline::components::Applier;
use thl::types::{ReplEvent, Seqno, TaskId};
use tracing::{debug, info, warn};

/// Applies events by logging them, committing in blocks.
#[derive(Debug)]
pub struct TracingApplier {
    task_id: TaskId,
    pending: u64,
    last_seqno: Option<Seqno>,
    committed: u64,
}

impl TracingApplier {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            pending: 0,
            last_seqno: None,
            committed: 0,
        }
    }
}

#[async_trait]
impl Applier for TracingApplier {
    async fn apply(&mut self, event: ReplEvent) -> ThlResult<()> {
        debug!(
            task_id = self.task_id,
            seqno = event.seqno(),
            fragno = event.fragno(),
            shard_id = %event.shard_id(),
            bytes = event.payload.len(),
            "applying event"
        );

        self.pending += 1;
        self.last_seqno = Some(event.seqno());

        Ok(())
    }

    async fn commit(&mut self) -> ThlResult<()> {
        if self.pending == 0 {
            return Ok(());
        }

        self.committed += self.pending;
        info!(
            task_id = self.task_id,
            events = self.pending,
            last_seqno = ?self.last_seqno,
            committed = self.committed,
            "committed block"
        );
        self.pending = 0;

        Ok(())
    }

    async fn rollback(&mut self) -> ThlResult<()> {
        if self.pending > 0 {
            warn!(
                task_id = self.task_id,
                events = self.pending,
                "rolled back uncommitted events"
            );
        }
        self.pending = 0;

        Ok(())
    }
}
