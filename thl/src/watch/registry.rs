use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::debug;

use crate::bail;
use crate::error::{ErrorKind, ThlResult};
use crate::types::TaskId;
use crate::watch::{WatchFuture, WatchPosition, WatchPredicate};

/// Which tasks must match before a watch resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    /// Every task of the stage must reach the position.
    AllTasks,
    /// The first task reaching the position resolves the watch.
    AnyTask,
}

/// Callback run each time a watch matches on a task.
pub trait WatchAction<H>: Send + Sync {
    fn on_match(&self, header: &H, task_id: TaskId) -> ThlResult<()>;
}

impl<H, F> WatchAction<H> for F
where
    F: Fn(&H, TaskId) -> ThlResult<()> + Send + Sync,
{
    fn on_match(&self, header: &H, task_id: TaskId) -> ThlResult<()> {
        self(header, task_id)
    }
}

struct Watch<H> {
    predicate: Box<dyn WatchPredicate<H>>,
    action: Option<Arc<dyn WatchAction<H>>>,
    scope: WatchScope,
    matched: Vec<bool>,
    /// Lowest position among the tasks that matched so far.
    lowest_match: Option<H>,
    tx: Option<oneshot::Sender<H>>,
    cancelled: Arc<AtomicBool>,
}

impl<H: WatchPosition> Watch<H> {
    fn is_abandoned(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
            || self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }

    /// Offers the position reached by `task_id` and returns `true` once the watch resolved.
    fn offer(&mut self, header: &H, task_id: TaskId) -> ThlResult<bool> {
        if self.matched[task_id] || !self.predicate.matches(header) {
            return Ok(false);
        }

        self.matched[task_id] = true;
        if self
            .lowest_match
            .as_ref()
            .is_none_or(|lowest| header.seqno() < lowest.seqno())
        {
            self.lowest_match = Some(header.clone());
        }

        if let Some(action) = &self.action {
            action.on_match(header, task_id)?;
        }

        let resolved = match self.scope {
            WatchScope::AnyTask => true,
            WatchScope::AllTasks => self.matched.iter().all(|matched| *matched),
        };
        if !resolved {
            return Ok(false);
        }

        if let (Some(tx), Some(lowest)) = (self.tx.take(), self.lowest_match.take()) {
            // The caller may have dropped its future already; nothing is waiting then.
            let _ = tx.send(lowest);
        }

        Ok(true)
    }
}

struct RegistryState<H> {
    watches: Vec<Watch<H>>,
    last_positions: Vec<Option<H>>,
    cancelled: bool,
}

/// Pending watches of one stage.
///
/// The registry remembers the last position offered by each task, so a watch registered after
/// its position was already reached resolves immediately.
pub struct WatchRegistry<H> {
    task_count: usize,
    state: Mutex<RegistryState<H>>,
}

impl<H: WatchPosition> WatchRegistry<H> {
    pub fn new(task_count: usize) -> Self {
        Self {
            task_count,
            state: Mutex::new(RegistryState {
                watches: Vec::new(),
                last_positions: vec![None; task_count],
                cancelled: false,
            }),
        }
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// Registers a watch resolving when `predicate` matches within `scope`.
    pub fn watch<P>(&self, predicate: P, scope: WatchScope) -> ThlResult<WatchFuture<H>>
    where
        P: WatchPredicate<H> + 'static,
    {
        self.register(Box::new(predicate), scope, None)
    }

    /// Registers a watch that also runs `action` for every task it matches on.
    pub fn watch_with_action<P, A>(
        &self,
        predicate: P,
        scope: WatchScope,
        action: A,
    ) -> ThlResult<WatchFuture<H>>
    where
        P: WatchPredicate<H> + 'static,
        A: WatchAction<H> + 'static,
    {
        self.register(Box::new(predicate), scope, Some(Arc::new(action)))
    }

    /// Offers the position reached by `task_id` to every pending watch.
    pub fn process(&self, header: &H, task_id: TaskId) -> ThlResult<()> {
        if task_id >= self.task_count {
            bail!(
                ErrorKind::InvalidState,
                "Watch position reported by an unknown task",
                format!("task {task_id} of {}", self.task_count)
            );
        }

        let mut state = self.lock();
        state.last_positions[task_id] = Some(header.clone());

        let mut result = Ok(());
        state.watches.retain_mut(|watch| {
            if watch.is_abandoned() {
                return false;
            }

            match watch.offer(header, task_id) {
                Ok(resolved) => !resolved,
                Err(err) => {
                    if result.is_ok() {
                        result = Err(err);
                    }
                    true
                }
            }
        });

        result
    }

    /// Cancels every pending watch and every watch registered afterwards.
    pub fn cancel_all(&self) {
        let mut state = self.lock();
        state.cancelled = true;

        let cancelled = state.watches.len();
        for watch in state.watches.drain(..) {
            watch.cancelled.store(true, Ordering::Release);
        }

        if cancelled > 0 {
            debug!(cancelled, "cancelled pending watches");
        }
    }

    /// Number of watches still waiting for a position.
    pub fn pending(&self) -> usize {
        self.lock()
            .watches
            .iter()
            .filter(|watch| !watch.is_abandoned())
            .count()
    }

    /// Last position offered by `task_id`.
    pub fn last_position(&self, task_id: TaskId) -> Option<H> {
        self.lock().last_positions.get(task_id).cloned().flatten()
    }

    fn register(
        &self,
        predicate: Box<dyn WatchPredicate<H>>,
        scope: WatchScope,
        action: Option<Arc<dyn WatchAction<H>>>,
    ) -> ThlResult<WatchFuture<H>> {
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let future = WatchFuture::new(rx, cancelled.clone());

        let mut state = self.lock();
        if state.cancelled {
            // Dropping the sender resolves the future as cancelled.
            cancelled.store(true, Ordering::Release);
            return Ok(future);
        }

        let mut watch = Watch {
            predicate,
            action,
            scope,
            matched: vec![false; self.task_count],
            lowest_match: None,
            tx: Some(tx),
            cancelled,
        };

        for (task_id, position) in state.last_positions.iter().enumerate() {
            if let Some(position) = position
                && watch.offer(position, task_id)?
            {
                return Ok(future);
            }
        }

        state.watches.push(watch);

        Ok(future)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<H>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<H> std::fmt::Debug for WatchRegistry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("task_count", &self.task_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::types::{ReplEvent, ReplHeader};
    use crate::watch::SeqnoWatchPredicate;

    fn header(seqno: i64) -> ReplHeader {
        ReplEvent::new(seqno, "db0", "").header
    }

    #[tokio::test]
    async fn any_task_watch_resolves_on_first_match() {
        let registry = WatchRegistry::new(2);
        let mut future = registry
            .watch(SeqnoWatchPredicate::new(5), WatchScope::AnyTask)
            .unwrap();

        registry.process(&header(4), 0).unwrap();
        assert!(!future.is_done());

        registry.process(&header(7), 1).unwrap();

        let matched = future.get_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(matched.seqno, 7);
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn all_tasks_watch_resolves_with_lowest_match() {
        let registry = WatchRegistry::new(3);
        let future = registry
            .watch(SeqnoWatchPredicate::new(10), WatchScope::AllTasks)
            .unwrap();

        registry.process(&header(12), 2).unwrap();
        registry.process(&header(10), 0).unwrap();
        registry.process(&header(11), 0).unwrap();
        assert_eq!(registry.pending(), 1);

        registry.process(&header(15), 1).unwrap();

        assert_eq!(future.await.unwrap().seqno, 10);
    }

    #[tokio::test]
    async fn watch_on_reached_position_resolves_immediately() {
        let registry = WatchRegistry::new(1);
        registry.process(&header(20), 0).unwrap();

        let future = registry
            .watch(SeqnoWatchPredicate::new(20), WatchScope::AllTasks)
            .unwrap();

        assert_eq!(future.await.unwrap().seqno, 20);
    }

    #[tokio::test]
    async fn cancel_all_resolves_pending_and_future_watches_as_cancelled() {
        let registry = WatchRegistry::<ReplHeader>::new(1);
        let pending = registry
            .watch(SeqnoWatchPredicate::new(1), WatchScope::AllTasks)
            .unwrap();

        registry.cancel_all();
        let late = registry
            .watch(SeqnoWatchPredicate::new(1), WatchScope::AllTasks)
            .unwrap();

        assert_eq!(pending.await.unwrap_err().kind(), ErrorKind::WatchCancelled);
        assert_eq!(late.await.unwrap_err().kind(), ErrorKind::WatchCancelled);
    }

    #[tokio::test]
    async fn cancelled_watch_is_dropped_and_times_out() {
        let registry = WatchRegistry::new(1);
        let mut future = registry
            .watch(SeqnoWatchPredicate::new(100), WatchScope::AllTasks)
            .unwrap();

        let err = future
            .get_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WatchTimeout);

        future.cancel();
        registry.process(&header(1), 0).unwrap();

        assert!(future.is_done());
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn actions_run_for_each_matching_task() {
        let registry = WatchRegistry::new(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _future = registry
            .watch_with_action(
                SeqnoWatchPredicate::new(3),
                WatchScope::AllTasks,
                move |_: &ReplHeader, _: TaskId| -> ThlResult<()> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
            )
            .unwrap();

        registry.process(&header(3), 0).unwrap();
        registry.process(&header(4), 0).unwrap();
        registry.process(&header(5), 1).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_task_is_rejected() {
        let registry = WatchRegistry::new(1);

        let err = registry.process(&header(1), 1).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
