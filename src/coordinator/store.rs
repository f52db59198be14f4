use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::protocol::{Task, TaskState};

/// Lifecycle record for a tracked task.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub task: Task,
    pub assigned_to: Option<Uuid>,
    pub state: TaskState,
    pub enqueued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Dispatch time, used by the optional watchdog reclaim.
    pub assigned_at: Option<Instant>,
}

impl TaskStatus {
    fn pending(task: Task) -> Self {
        Self {
            task,
            assigned_to: None,
            state: TaskState::Pending,
            enqueued_at: Utc::now(),
            completed_at: None,
            assigned_at: None,
        }
    }
}

/// Queue of unassigned tasks plus the status table keyed by task id.
///
/// Owned exclusively by the assignment engine; every mutation happens inside
/// the engine's single critical section.
#[derive(Debug, Default)]
pub struct TaskStore {
    pending: VecDeque<Task>,
    statuses: HashMap<String, TaskStatus>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the pending queue. A tracked task (non-empty id)
    /// gets a fresh `pending` status entry, overwriting any previous one.
    pub fn enqueue(&mut self, task: Task) {
        if task.is_tracked() {
            self.statuses
                .insert(task.task_id.clone(), TaskStatus::pending(task.clone()));
        }
        self.pending.push_back(task);
    }

    /// Enqueue each task in order.
    pub fn enqueue_batch(&mut self, tasks: Vec<Task>) {
        for task in tasks {
            self.enqueue(task);
        }
    }

    /// Push a task back onto the tail of the queue without touching its
    /// status entry. Used for the failed-install back-edge.
    pub fn requeue(&mut self, task: Task) {
        self.pending.push_back(task);
    }

    /// Remove and return the first pending task satisfying the predicate,
    /// scanning in insertion order. Non-matching tasks stay in place for
    /// other workers; oldest eligible task wins.
    pub fn take_matching<F>(&mut self, pred: F) -> Option<Task>
    where
        F: Fn(&Task, Option<&TaskStatus>) -> bool,
    {
        let idx = self
            .pending
            .iter()
            .position(|t| pred(t, self.statuses.get(&t.task_id)))?;
        self.pending.remove(idx)
    }

    pub fn status(&self, task_id: &str) -> Option<&TaskStatus> {
        self.statuses.get(task_id)
    }

    pub fn status_mut(&mut self, task_id: &str) -> Option<&mut TaskStatus> {
        self.statuses.get_mut(task_id)
    }

    /// Insert a pending status entry without queueing the task. Used when
    /// seeding the static batch so its results can be tracked.
    pub fn track(&mut self, task: Task) {
        if task.is_tracked() {
            self.statuses
                .insert(task.task_id.clone(), TaskStatus::pending(task));
        }
    }

    pub fn remove_status(&mut self, task_id: &str) -> Option<TaskStatus> {
        self.statuses.remove(task_id)
    }

    /// Mark a task as optimistically dispatched to a worker.
    pub fn mark_assigned(&mut self, task_id: &str, worker_id: Uuid) {
        if let Some(status) = self.statuses.get_mut(task_id) {
            status.state = TaskState::Installed;
            status.assigned_to = Some(worker_id);
            status.assigned_at = Some(Instant::now());
        }
    }

    /// Task ids currently assigned to a worker and not yet completed.
    pub fn assigned_to(&self, worker_id: Uuid) -> Vec<String> {
        self.statuses
            .iter()
            .filter(|(_, s)| s.assigned_to == Some(worker_id) && s.state != TaskState::Completed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ids of `installed` tasks whose dispatch is older than `max_age`.
    pub fn stale_installed(&self, max_age: std::time::Duration) -> Vec<String> {
        self.statuses
            .iter()
            .filter(|(_, s)| {
                s.state == TaskState::Installed
                    && s.assigned_at.is_some_and(|at| at.elapsed() >= max_age)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn all_statuses(&self) -> Vec<&TaskStatus> {
        let mut statuses: Vec<&TaskStatus> = self.statuses.values().collect();
        statuses.sort_by_key(|s| s.enqueued_at);
        statuses
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, task_type: &str) -> Task {
        Task::new(id, task_type)
    }

    #[test]
    fn enqueue_tracks_status() {
        let mut store = TaskStore::new();
        store.enqueue(task("t1", "build"));

        assert_eq!(store.pending_len(), 1);
        let status = store.status("t1").unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert!(status.assigned_to.is_none());
    }

    #[test]
    fn untracked_task_has_no_status() {
        let mut store = TaskStore::new();
        store.enqueue(Task {
            task_id: String::new(),
            task_type: "build".to_string(),
            payload: Default::default(),
        });

        assert_eq!(store.pending_len(), 1);
        assert!(store.status("").is_none());
    }

    #[test]
    fn take_matching_is_fifo_among_eligible() {
        let mut store = TaskStore::new();
        store.enqueue(task("a", "x"));
        store.enqueue(task("b", "y"));
        store.enqueue(task("c", "x"));

        let first = store.take_matching(|t, _| t.task_type == "x").unwrap();
        assert_eq!(first.task_id, "a");
        let second = store.take_matching(|t, _| t.task_type == "x").unwrap();
        assert_eq!(second.task_id, "c");

        // The non-matching task stayed in place.
        assert_eq!(store.pending_len(), 1);
        assert!(store.take_matching(|t, _| t.task_type == "x").is_none());
    }

    #[test]
    fn enqueue_overwrites_status_by_id() {
        let mut store = TaskStore::new();
        store.enqueue(task("t1", "build"));
        store.mark_assigned("t1", Uuid::new_v4());
        assert_eq!(store.status("t1").unwrap().state, TaskState::Installed);

        store.enqueue(task("t1", "build"));
        assert_eq!(store.status("t1").unwrap().state, TaskState::Pending);
        assert!(store.status("t1").unwrap().assigned_to.is_none());
    }

    #[test]
    fn assigned_to_skips_completed() {
        let mut store = TaskStore::new();
        let worker = Uuid::new_v4();
        store.enqueue(task("t1", "build"));
        store.enqueue(task("t2", "build"));
        store.mark_assigned("t1", worker);
        store.mark_assigned("t2", worker);
        store.status_mut("t2").unwrap().state = TaskState::Completed;

        assert_eq!(store.assigned_to(worker), vec!["t1".to_string()]);
    }

    #[test]
    fn stale_installed_respects_age() {
        let mut store = TaskStore::new();
        store.enqueue(task("t1", "build"));
        store.mark_assigned("t1", Uuid::new_v4());

        assert_eq!(store.stale_installed(std::time::Duration::ZERO).len(), 1);
        assert!(store
            .stale_installed(std::time::Duration::from_secs(3600))
            .is_empty());
    }
}
