use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::bail;
use crate::error::{ErrorKind, ThlResult};
use crate::pipeline::components::Applier;
use crate::test_utils::notify::TimedNotify;
use crate::types::{ReplEvent, Seqno, TaskId};

/// A step taken by one task's [`MemoryApplier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplierOp {
    Apply { task_id: TaskId, seqno: Seqno },
    Commit { task_id: TaskId, seqnos: Vec<Seqno> },
}

/// What the appliers sharing a [`MemoryApplier`] store recorded.
#[derive(Debug, Default)]
struct Recorded {
    /// Committed events with the task that applied them, in commit order.
    committed: Vec<(TaskId, ReplEvent)>,
    /// Applies and commits of every task, in the order they completed.
    operations: Vec<ApplierOp>,
    commits: usize,
    rollbacks: usize,
    released: Vec<TaskId>,
}

/// An applier keeping committed events in memory.
///
/// Clones share the recorded events; [`MemoryApplier::for_task`] creates the applier of one
/// task.
#[derive(Debug, Clone)]
pub struct MemoryApplier {
    recorded: Arc<Mutex<Recorded>>,
    committed_notify: Arc<Notify>,
    task_id: TaskId,
    pending: Vec<ReplEvent>,
    fail_at: Option<Seqno>,
    slow_at: Option<(Seqno, Duration)>,
}

impl MemoryApplier {
    pub fn new() -> Self {
        Self {
            recorded: Arc::new(Mutex::new(Recorded::default())),
            committed_notify: Arc::new(Notify::new()),
            task_id: 0,
            pending: Vec::new(),
            fail_at: None,
            slow_at: None,
        }
    }

    /// Makes `apply` fail on the event with `seqno`.
    pub fn fail_at(mut self, seqno: Seqno) -> Self {
        self.fail_at = Some(seqno);
        self
    }

    /// Makes `apply` take `delay` on the event with `seqno`.
    pub fn slow_at(mut self, seqno: Seqno, delay: Duration) -> Self {
        self.slow_at = Some((seqno, delay));
        self
    }

    pub fn for_task(&self, task_id: TaskId) -> Self {
        Self {
            task_id,
            pending: Vec::new(),
            ..self.clone()
        }
    }

    /// Notified after every commit.
    pub fn committed_notify(&self) -> TimedNotify {
        TimedNotify::new(self.committed_notify.clone())
    }

    /// Waits until at least `count` events are committed.
    pub async fn wait_for_committed(&self, count: usize) {
        let notify = self.committed_notify();
        while self.committed_seqnos().len() < count {
            notify.notified().await;
        }
    }

    pub fn committed_seqnos(&self) -> Vec<Seqno> {
        self.lock()
            .committed
            .iter()
            .map(|(_, event)| event.seqno())
            .collect()
    }

    pub fn committed_seqnos_of(&self, task_id: TaskId) -> Vec<Seqno> {
        self.lock()
            .committed
            .iter()
            .filter(|(task, _)| *task == task_id)
            .map(|(_, event)| event.seqno())
            .collect()
    }

    pub fn operations(&self) -> Vec<ApplierOp> {
        self.lock().operations.clone()
    }

    /// Index in [`MemoryApplier::operations`] of the apply of `seqno`.
    pub fn applied_at(&self, seqno: Seqno) -> Option<usize> {
        self.lock().operations.iter().position(
            |op| matches!(op, ApplierOp::Apply { seqno: applied, .. } if *applied == seqno),
        )
    }

    /// Index in [`MemoryApplier::operations`] of the commit including `seqno`.
    pub fn committed_at(&self, seqno: Seqno) -> Option<usize> {
        self.lock().operations.iter().position(
            |op| matches!(op, ApplierOp::Commit { seqnos, .. } if seqnos.contains(&seqno)),
        )
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    pub fn released_tasks(&self) -> Vec<TaskId> {
        self.lock().released.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryApplier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Applier for MemoryApplier {
    async fn apply(&mut self, event: ReplEvent) -> ThlResult<()> {
        if self.fail_at == Some(event.seqno()) {
            bail!(
                ErrorKind::ApplyFailed,
                "Injected apply failure",
                format!("seqno {}", event.seqno())
            );
        }

        if let Some((seqno, delay)) = self.slow_at
            && seqno == event.seqno()
        {
            tokio::time::sleep(delay).await;
        }

        let task_id = self.task_id;
        self.lock().operations.push(ApplierOp::Apply {
            task_id,
            seqno: event.seqno(),
        });
        self.pending.push(event);

        Ok(())
    }

    async fn commit(&mut self) -> ThlResult<()> {
        {
            let task_id = self.task_id;
            let pending = std::mem::take(&mut self.pending);
            let mut recorded = self.lock();
            recorded.operations.push(ApplierOp::Commit {
                task_id,
                seqnos: pending.iter().map(ReplEvent::seqno).collect(),
            });
            recorded
                .committed
                .extend(pending.into_iter().map(|event| (task_id, event)));
            recorded.commits += 1;
        }
        self.committed_notify.notify_one();

        Ok(())
    }

    async fn rollback(&mut self) -> ThlResult<()> {
        self.pending.clear();
        self.lock().rollbacks += 1;

        Ok(())
    }

    async fn release(&mut self) -> ThlResult<()> {
        let task_id = self.task_id;
        self.lock().released.push(task_id);

        Ok(())
    }
}
