use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;

use crate::bail;
use crate::concurrency::shutdown::{ShutdownResult, ShutdownRx, shutdown_signalled};
use crate::error::{ErrorKind, ThlResult};
use crate::types::{Seqno, TaskId};

/// Last position reported by one task.
#[derive(Debug)]
struct TaskPosition<D> {
    task_id: TaskId,
    seqno: Seqno,
    time: DateTime<Utc>,
    report_time: DateTime<Utc>,
    datum: D,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Tracks the positions of a set of tasks ordered by seqno.
///
/// Positions live in an arena linked as a doubly linked list: the head is the slowest task and
/// the tail the fastest, so both watermarks are read in constant time. A task only ever moves
/// toward the tail because its seqno never decreases.
#[derive(Debug)]
pub struct IntervalGuard<D> {
    nodes: Vec<TaskPosition<D>>,
    index: HashMap<TaskId, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<D> Default for IntervalGuard<D> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }
}

impl<D> IntervalGuard<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks that reported at least once.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Records the position of `task_id`, stamping it with the current time.
    pub fn report(
        &mut self,
        task_id: TaskId,
        seqno: Seqno,
        time: DateTime<Utc>,
        datum: D,
    ) -> ThlResult<()> {
        self.report_at(task_id, seqno, time, Utc::now(), datum)
    }

    /// Records the position of `task_id` as observed at `report_time`.
    ///
    /// A seqno lower than the one previously reported by the same task means parallel apply
    /// is corrupted and is returned as [`ErrorKind::ConsistencyViolation`].
    pub fn report_at(
        &mut self,
        task_id: TaskId,
        seqno: Seqno,
        time: DateTime<Utc>,
        report_time: DateTime<Utc>,
        datum: D,
    ) -> ThlResult<()> {
        let Some(&idx) = self.index.get(&task_id) else {
            self.insert(task_id, seqno, time, report_time, datum);
            return Ok(());
        };

        let node = &mut self.nodes[idx];
        if seqno < node.seqno {
            bail!(
                ErrorKind::ConsistencyViolation,
                "Task seqno moved backwards",
                format!(
                    "task {task_id} reported seqno {seqno} after seqno {}",
                    node.seqno
                )
            );
        }

        node.seqno = seqno;
        node.time = time;
        node.report_time = report_time;
        node.datum = datum;

        self.move_forward(idx);

        Ok(())
    }

    pub fn low_seqno(&self) -> Option<Seqno> {
        self.head.map(|idx| self.nodes[idx].seqno)
    }

    pub fn low_time(&self) -> Option<DateTime<Utc>> {
        self.head.map(|idx| self.nodes[idx].time)
    }

    pub fn low_datum(&self) -> Option<&D> {
        self.head.map(|idx| &self.nodes[idx].datum)
    }

    /// Task currently at the head of the list.
    pub fn low_task_id(&self) -> Option<TaskId> {
        self.head.map(|idx| self.nodes[idx].task_id)
    }

    pub fn hi_seqno(&self) -> Option<Seqno> {
        self.tail.map(|idx| self.nodes[idx].seqno)
    }

    pub fn hi_time(&self) -> Option<DateTime<Utc>> {
        self.tail.map(|idx| self.nodes[idx].time)
    }

    pub fn hi_datum(&self) -> Option<&D> {
        self.tail.map(|idx| &self.nodes[idx].datum)
    }

    /// Latency of the slowest task: report time minus event time, never negative.
    pub fn low_latency(&self) -> Option<Duration> {
        self.head.map(|idx| self.latency(idx))
    }

    /// Latency of the fastest task: report time minus event time, never negative.
    pub fn hi_latency(&self) -> Option<Duration> {
        self.tail.map(|idx| self.latency(idx))
    }

    /// Last seqno reported by `task_id`.
    pub fn seqno_of(&self, task_id: TaskId) -> Option<Seqno> {
        self.index.get(&task_id).map(|&idx| self.nodes[idx].seqno)
    }

    /// Task ids ordered from slowest to fastest.
    pub fn task_ids(&self) -> Vec<TaskId> {
        let mut task_ids = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            task_ids.push(self.nodes[idx].task_id);
            cursor = self.nodes[idx].next;
        }

        task_ids
    }

    /// Walks the list and checks its links, its length and its ordering.
    pub fn validate(&self) -> ThlResult<()> {
        if let Some(head) = self.head
            && self.nodes[head].prev.is_some()
        {
            bail!(
                ErrorKind::ConsistencyViolation,
                "Interval guard head has a predecessor"
            );
        }

        if let Some(tail) = self.tail
            && self.nodes[tail].next.is_some()
        {
            bail!(
                ErrorKind::ConsistencyViolation,
                "Interval guard tail has a successor"
            );
        }

        let mut count = 0;
        let mut previous: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let node = &self.nodes[idx];
            if node.prev != previous {
                bail!(
                    ErrorKind::ConsistencyViolation,
                    "Interval guard list links are broken",
                    format!("task {} has a wrong predecessor", node.task_id)
                );
            }

            if let Some(prev) = previous
                && self.nodes[prev].seqno > node.seqno
            {
                bail!(
                    ErrorKind::ConsistencyViolation,
                    "Interval guard list is out of order",
                    format!(
                        "task {} at seqno {} precedes task {} at seqno {}",
                        self.nodes[prev].task_id,
                        self.nodes[prev].seqno,
                        node.task_id,
                        node.seqno
                    )
                );
            }

            count += 1;
            previous = Some(idx);
            cursor = node.next;
        }

        if previous != self.tail {
            bail!(
                ErrorKind::ConsistencyViolation,
                "Interval guard tail is not the last node"
            );
        }

        if count != self.index.len() {
            bail!(
                ErrorKind::ConsistencyViolation,
                "Interval guard list length does not match the task map",
                format!("list has {count} nodes, map has {} tasks", self.index.len())
            );
        }

        Ok(())
    }

    fn latency(&self, idx: usize) -> Duration {
        let node = &self.nodes[idx];
        (node.report_time - node.time)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn insert(
        &mut self,
        task_id: TaskId,
        seqno: Seqno,
        time: DateTime<Utc>,
        report_time: DateTime<Utc>,
        datum: D,
    ) {
        let idx = self.nodes.len();
        self.nodes.push(TaskPosition {
            task_id,
            seqno,
            time,
            report_time,
            datum,
            prev: None,
            next: None,
        });
        self.index.insert(task_id, idx);

        // Walk back from the tail to the last node not ahead of the new one.
        let mut after = self.tail;
        while let Some(candidate) = after {
            if self.nodes[candidate].seqno <= seqno {
                break;
            }
            after = self.nodes[candidate].prev;
        }

        self.link_after(idx, after);
    }

    fn move_forward(&mut self, idx: usize) {
        let seqno = self.nodes[idx].seqno;

        let mut after = None;
        let mut cursor = self.nodes[idx].next;
        while let Some(candidate) = cursor {
            if self.nodes[candidate].seqno > seqno {
                break;
            }
            after = Some(candidate);
            cursor = self.nodes[candidate].next;
        }

        if let Some(after) = after {
            self.unlink(idx);
            self.link_after(idx, Some(after));
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);

        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }

        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
    }

    /// Links a detached node after `after`, or at the head when `after` is `None`.
    fn link_after(&mut self, idx: usize, after: Option<usize>) {
        let next = match after {
            Some(after) => self.nodes[after].next.replace(idx),
            None => self.head.replace(idx),
        };

        self.nodes[idx].prev = after;
        self.nodes[idx].next = next;

        match next {
            Some(next) => self.nodes[next].prev = Some(idx),
            None => self.tail = Some(idx),
        }
    }
}

#[derive(Debug)]
struct Inner<D> {
    guard: Mutex<IntervalGuard<D>>,
    reported: Notify,
}

/// An [`IntervalGuard`] shared by the tasks of a stage.
///
/// Every report wakes up tasks blocked in [`SharedIntervalGuard::wait_min_time`].
#[derive(Debug)]
pub struct SharedIntervalGuard<D> {
    inner: Arc<Inner<D>>,
}

impl<D> Clone for SharedIntervalGuard<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D> Default for SharedIntervalGuard<D> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                guard: Mutex::new(IntervalGuard::new()),
                reported: Notify::new(),
            }),
        }
    }
}

impl<D> SharedIntervalGuard<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(
        &self,
        task_id: TaskId,
        seqno: Seqno,
        time: DateTime<Utc>,
        datum: D,
    ) -> ThlResult<()> {
        self.lock().report(task_id, seqno, time, datum)?;
        self.inner.reported.notify_waiters();

        Ok(())
    }

    /// Runs `f` against the guard while holding its lock.
    pub fn with<R>(&self, f: impl FnOnce(&IntervalGuard<D>) -> R) -> R {
        f(&self.lock())
    }

    /// Waits until the slowest task reached `time` or `seqno`.
    ///
    /// The condition is rechecked on every report and at least every `poll_interval`. An empty
    /// guard never blocks.
    pub async fn wait_min_time(
        &self,
        time: DateTime<Utc>,
        seqno: Seqno,
        poll_interval: Duration,
        shutdown_rx: &mut ShutdownRx,
    ) -> ShutdownResult<(), ()> {
        loop {
            let reported = self.inner.reported.notified();
            tokio::pin!(reported);
            reported.as_mut().enable();

            let reached = self.with(|guard| match (guard.low_time(), guard.low_seqno()) {
                (Some(low_time), Some(low_seqno)) => low_time >= time || low_seqno >= seqno,
                _ => true,
            });
            if reached {
                return ShutdownResult::Ok(());
            }

            debug!(%time, seqno, "waiting for the slowest task to catch up");

            tokio::select! {
                biased;

                _ = shutdown_signalled(shutdown_rx) => return ShutdownResult::Shutdown(()),
                _ = tokio::time::timeout(poll_interval, reported) => {}
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, IntervalGuard<D>> {
        // A poisoned guard still holds consistent positions since every update is a single report.
        self.inner
            .guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
