use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::QueueError;
use crate::models::task::{Hook, ScheduledTask, TaskArgs, TaskFilter, TaskId, TaskStatus};

/// External at-least-once queue of one-off future tasks.
///
/// There is no recurring primitive: each hook has at most one pending
/// occurrence and the next one is scheduled as a side effect of running it.
pub trait TaskQueue: Send + Sync {
    fn schedule_single(&self, at: DateTime<Utc>, hook: Hook, args: TaskArgs) -> Result<TaskId, QueueError>;

    /// Cancels every pending task matching `(hook, args)`. Returns how many were cancelled.
    fn cancel_all(&self, hook: Hook, args: TaskArgs) -> Result<usize, QueueError>;

    /// Earliest pending run time for `(hook, args)`.
    fn get_next(&self, hook: Hook, args: TaskArgs) -> Result<Option<DateTime<Utc>>, QueueError>;

    fn search(&self, filter: &TaskFilter) -> Result<Vec<ScheduledTask>, QueueError>;

    /// Moves up to `limit` due pending tasks to running and returns them.
    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>, QueueError>;

    fn mark_complete(&self, id: TaskId) -> Result<(), QueueError>;

    fn mark_failed(&self, id: TaskId, reason: &str) -> Result<(), QueueError>;
}

/// Counts of mutating calls, for asserting that reconciliation is idempotent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub scheduled: usize,
    pub cancel_calls: usize,
}

/// Finished tasks kept for `search` when no limit is given.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

#[derive(Debug)]
struct QueueState {
    tasks: Vec<ScheduledTask>,
    stats: QueueStats,
    unavailable: bool,
    history_limit: usize,
}

/// In-process queue. Finished tasks beyond the history limit are dropped, oldest first.
#[derive(Clone)]
pub struct InMemoryTaskQueue {
    state: Arc<Mutex<QueueState>>,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                tasks: Vec::new(),
                stats: QueueStats::default(),
                unavailable: false,
                history_limit,
            })),
        }
    }

    /// Number of tasks held, pending or finished.
    pub fn len(&self) -> usize {
        self.lock().map(|state| state.tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().map(|state| state.stats).unwrap_or_default()
    }

    pub fn pending(&self) -> Vec<ScheduledTask> {
        self.search(&TaskFilter {
            status: Some(TaskStatus::Pending),
            ..TaskFilter::default()
        })
        .unwrap_or_default()
    }

    /// Simulates an outage: every call fails until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        let state = self
            .state
            .lock()
            .map_err(|_| QueueError::Unavailable("task queue lock poisoned".to_string()))?;
        if state.unavailable {
            return Err(QueueError::Unavailable("task queue offline".to_string()));
        }
        Ok(state)
    }

    fn finish(&self, id: TaskId, status: TaskStatus, reason: Option<&str>) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let task = state
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or(QueueError::UnknownTask(id))?;
        task.status = status;
        if let Some(reason) = reason {
            task.last_error = Some(reason.to_string());
        }
        Self::prune(&mut state);
        Ok(())
    }

    fn prune(state: &mut QueueState) {
        let finished = state.tasks.iter().filter(|task| task.status.is_finished()).count();
        let mut excess = finished.saturating_sub(state.history_limit);
        if excess == 0 {
            return;
        }

        state.tasks.retain(|task| {
            if excess > 0 && task.status.is_finished() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn schedule_single(&self, at: DateTime<Utc>, hook: Hook, args: TaskArgs) -> Result<TaskId, QueueError> {
        let mut state = self.lock()?;
        let task = ScheduledTask::new(at, hook, args);
        let id = task.id;
        state.tasks.push(task);
        state.stats.scheduled += 1;
        log::debug!("Scheduled {} for subscription #{} at {}", hook, args.subscription_id, at);
        Ok(id)
    }

    fn cancel_all(&self, hook: Hook, args: TaskArgs) -> Result<usize, QueueError> {
        let mut state = self.lock()?;
        state.stats.cancel_calls += 1;
        let mut cancelled = 0;
        for task in state.tasks.iter_mut() {
            if task.hook == hook && task.args == args && task.status == TaskStatus::Pending {
                task.status = TaskStatus::Cancelled;
                cancelled += 1;
            }
        }
        log::debug!("Cancelled {} {} task(s) for subscription #{}", cancelled, hook, args.subscription_id);
        Self::prune(&mut state);
        Ok(cancelled)
    }

    fn get_next(&self, hook: Hook, args: TaskArgs) -> Result<Option<DateTime<Utc>>, QueueError> {
        let state = self.lock()?;
        Ok(state
            .tasks
            .iter()
            .filter(|task| task.hook == hook && task.args == args && task.status == TaskStatus::Pending)
            .map(|task| task.scheduled_for)
            .min())
    }

    fn search(&self, filter: &TaskFilter) -> Result<Vec<ScheduledTask>, QueueError> {
        let state = self.lock()?;
        Ok(state.tasks.iter().filter(|task| filter.matches(task)).cloned().collect())
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledTask>, QueueError> {
        let mut state = self.lock()?;
        let mut due: Vec<&mut ScheduledTask> = state
            .tasks
            .iter_mut()
            .filter(|task| task.status == TaskStatus::Pending && task.scheduled_for <= now)
            .collect();
        due.sort_by_key(|task| task.scheduled_for);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|task| {
                task.status = TaskStatus::Running;
                task.attempts += 1;
                task.clone()
            })
            .collect())
    }

    fn mark_complete(&self, id: TaskId) -> Result<(), QueueError> {
        self.finish(id, TaskStatus::Complete, None)
    }

    fn mark_failed(&self, id: TaskId, reason: &str) -> Result<(), QueueError> {
        self.finish(id, TaskStatus::Failed, Some(reason))
    }
}
