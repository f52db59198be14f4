//! The task-assignment and worker-lifecycle state machine.
//!
//! Per tracked task: `pending -> installed -> {completed | failed}`, with
//! `failed -> pending` (re-queue) as the only back-edge, always taken by the
//! coordinator. All shared state (queue, status table, registry, handled-set)
//! lives behind a single mutex: every read-queue/mutate/write-status sequence
//! is one global critical section, so no two workers can be handed the same
//! task. Per-connection ordering comes from the connection loop in
//! [`super`], which feeds events to [`AssignmentEngine::handle_event`] one at
//! a time in arrival order.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::coordinator::registry::WorkerRegistry;
use crate::coordinator::store::{TaskStatus, TaskStore};
use crate::error::Result;
use crate::protocol::{
    CoordinatorEvent, InstallStatus, Task, TaskResult, TaskState, WorkerEvent,
};

/// Collaborator that produces tasks when the pending queue runs dry.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn produce(&self) -> Result<Vec<Task>>;
}

/// Callback invoked with deduplicated task results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn handle_results(&self, results: Vec<TaskResult>);
}

/// Default sink: log each result and move on.
pub struct LoggingSink;

#[async_trait]
impl ResultSink for LoggingSink {
    async fn handle_results(&self, results: Vec<TaskResult>) {
        for result in results {
            tracing::info!(task_id = %result.task_id, result = %result.result, "Task result");
        }
    }
}

struct Shared {
    store: TaskStore,
    registry: WorkerRegistry,
    /// Task ids whose results were already delivered to the sink.
    handled: HashSet<String>,
    /// Static batch served through the basic `requestTasks` protocol.
    batch: VecDeque<Task>,
}

pub struct AssignmentEngine {
    shared: Mutex<Shared>,
    source: Option<Arc<dyn TaskSource>>,
    sink: Arc<dyn ResultSink>,
}

impl AssignmentEngine {
    pub fn new(sink: Arc<dyn ResultSink>, source: Option<Arc<dyn TaskSource>>) -> Self {
        Self {
            shared: Mutex::new(Shared {
                store: TaskStore::new(),
                registry: WorkerRegistry::new(),
                handled: HashSet::new(),
                batch: VecDeque::new(),
            }),
            source,
            sink,
        }
    }

    /// Enqueue one task for dynamic assignment.
    pub async fn enqueue(&self, task: Task) {
        let mut shared = self.shared.lock().await;
        tracing::info!(task_id = %task.task_id, task_type = %task.task_type, "Task enqueued");
        shared.store.enqueue(task);
    }

    /// Enqueue tasks in order.
    pub async fn enqueue_batch(&self, tasks: Vec<Task>) {
        let mut shared = self.shared.lock().await;
        for task in tasks {
            tracing::info!(task_id = %task.task_id, task_type = %task.task_type, "Task enqueued");
            shared.store.enqueue(task);
        }
    }

    /// Seed the static batch served through the basic protocol. Tracked ids
    /// get status entries so `taskResults` can mark them completed.
    pub async fn seed_batch(&self, tasks: Vec<Task>) {
        let mut shared = self.shared.lock().await;
        for task in tasks {
            shared.store.track(task.clone());
            shared.batch.push_back(task);
        }
    }

    /// Record a new connection.
    pub async fn connect(&self, worker_id: Uuid) {
        let mut shared = self.shared.lock().await;
        shared.registry.register(worker_id);
    }

    /// Handle one event from a worker connection, returning the replies to
    /// send back on that connection. The caller must invoke this serially
    /// per connection.
    pub async fn handle_event(
        &self,
        worker_id: Uuid,
        event: WorkerEvent,
    ) -> Vec<CoordinatorEvent> {
        let mut shared = self.shared.lock().await;
        match event {
            WorkerEvent::RegisterCapabilities { task_types } => {
                shared.registry.set_capabilities(worker_id, task_types);
                Vec::new()
            }
            WorkerEvent::NotifyReady { task_types } => {
                shared.registry.mark_ready(worker_id, task_types);
                Vec::new()
            }
            WorkerEvent::RequestTask => {
                vec![self.assign_task(&mut shared, worker_id).await]
            }
            WorkerEvent::InstallationStatus {
                task_id,
                status,
                error,
            } => {
                self.apply_installation_status(&mut shared, worker_id, &task_id, status, error);
                Vec::new()
            }
            WorkerEvent::TaskCompleted { task_id, result } => {
                self.apply_completion(&mut shared, worker_id, task_id, result)
                    .await;
                Vec::new()
            }
            WorkerEvent::RequestTasks => {
                if shared.batch.is_empty() {
                    vec![CoordinatorEvent::NoMoreTasks]
                } else {
                    let tasks: Vec<Task> = shared.batch.drain(..).collect();
                    tracing::info!(worker_id = %worker_id, count = tasks.len(), "Batch handed out");
                    vec![CoordinatorEvent::ProvideTasks { tasks }]
                }
            }
            WorkerEvent::TaskResults { results } => {
                for result in &results {
                    if let Some(status) = shared.store.status_mut(&result.task_id) {
                        status.state = TaskState::Completed;
                        status.completed_at = Some(Utc::now());
                    }
                }
                self.deliver(&mut shared, results).await;
                Vec::new()
            }
        }
    }

    /// Disconnect recovery: every non-completed task assigned to this
    /// connection goes back on the queue with a fresh pending status, and
    /// the worker record is deleted.
    pub async fn disconnect(&self, worker_id: Uuid) {
        let mut shared = self.shared.lock().await;
        let orphaned = shared.store.assigned_to(worker_id);
        for task_id in orphaned {
            if let Some(status) = shared.store.remove_status(&task_id) {
                tracing::warn!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    "Worker disconnected mid-task, re-queueing"
                );
                shared.store.enqueue(status.task);
            }
        }
        if shared.registry.remove(worker_id).is_some() {
            tracing::info!(worker_id = %worker_id, "Worker disconnected");
        }
    }

    /// Watchdog sweep: re-queue `installed` tasks whose dispatch is older
    /// than `max_age`. Returns how many tasks were reclaimed.
    pub async fn reclaim_stale(&self, max_age: Duration) -> usize {
        let mut shared = self.shared.lock().await;
        let stale = shared.store.stale_installed(max_age);
        let count = stale.len();
        for task_id in stale {
            if let Some(status) = shared.store.remove_status(&task_id) {
                tracing::warn!(
                    task_id = %task_id,
                    assigned_to = ?status.assigned_to,
                    "Installed task never reported back, re-queueing"
                );
                shared.store.enqueue(status.task);
            }
        }
        count
    }

    pub async fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.shared.lock().await.store.status(task_id).cloned()
    }

    pub async fn all_statuses(&self) -> Vec<TaskStatus> {
        self.shared
            .lock()
            .await
            .store
            .all_statuses()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn worker_count(&self) -> usize {
        self.shared.lock().await.registry.len()
    }

    pub async fn pending_len(&self) -> usize {
        self.shared.lock().await.store.pending_len()
    }

    /// Assignment algorithm for `requestTask`: eligibility check, refill
    /// from the task source if the queue is empty, then FIFO scan for the
    /// first capability-matched assignable task.
    async fn assign_task(&self, shared: &mut Shared, worker_id: Uuid) -> CoordinatorEvent {
        if !shared.registry.is_eligible(worker_id) {
            return CoordinatorEvent::NoTask {
                message: "worker is not ready or has no declared capabilities".to_string(),
            };
        }

        if shared.store.is_empty() {
            self.refill(shared).await;
        }

        let capabilities = match shared.registry.get(worker_id) {
            Some(worker) => worker.task_types.clone(),
            None => {
                return CoordinatorEvent::NoTask {
                    message: "unknown worker connection".to_string(),
                }
            }
        };

        let taken = shared.store.take_matching(|task, status| {
            if !capabilities.contains(&task.task_type) {
                return false;
            }
            // Tracked tasks must be assignable: pending, or failed and
            // re-queued. An `installed` entry in the queue is a stale
            // duplicate and is skipped.
            match status {
                Some(s) => matches!(s.state, TaskState::Pending | TaskState::Failed),
                None => true,
            }
        });

        match taken {
            Some(task) => {
                // Optimistic transition: installed before the worker confirms.
                shared.store.mark_assigned(&task.task_id, worker_id);
                tracing::info!(
                    task_id = %task.task_id,
                    task_type = %task.task_type,
                    worker_id = %worker_id,
                    "Task assigned"
                );
                CoordinatorEvent::AssignTask { task }
            }
            None => CoordinatorEvent::NoTask {
                message: "no queued task matches this worker's capabilities".to_string(),
            },
        }
    }

    /// Ask the task source for more work. Source failure is logged and
    /// treated as zero tasks produced.
    async fn refill(&self, shared: &mut Shared) {
        let Some(source) = &self.source else {
            return;
        };
        match source.produce().await {
            Ok(tasks) => {
                if !tasks.is_empty() {
                    tracing::info!(count = tasks.len(), "Queue refilled from task source");
                    shared.store.enqueue_batch(tasks);
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Task source failed, treating as empty");
            }
        }
    }

    fn apply_installation_status(
        &self,
        shared: &mut Shared,
        worker_id: Uuid,
        task_id: &str,
        status: InstallStatus,
        error: Option<String>,
    ) {
        let Some(entry) = shared.store.status_mut(task_id) else {
            tracing::warn!(task_id = %task_id, worker_id = %worker_id, "Installation report for untracked task");
            return;
        };
        match status {
            InstallStatus::Success => {
                entry.state = TaskState::Installed;
                tracing::debug!(task_id = %task_id, worker_id = %worker_id, "Task installed");
            }
            InstallStatus::Failure => {
                entry.state = TaskState::Failed;
                entry.assigned_to = None;
                entry.assigned_at = None;
                let task = entry.task.clone();
                tracing::warn!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    error = ?error,
                    "Installation failed, re-queueing at tail"
                );
                shared.store.requeue(task);
            }
        }
    }

    async fn apply_completion(
        &self,
        shared: &mut Shared,
        worker_id: Uuid,
        task_id: String,
        result: serde_json::Value,
    ) {
        if let Some(status) = shared.store.status_mut(&task_id) {
            if status.assigned_to.is_some() && status.assigned_to != Some(worker_id) {
                // Late report from a connection the task was taken away
                // from. Apply it anyway, loudly.
                tracing::warn!(
                    task_id = %task_id,
                    reporter = %worker_id,
                    assignee = ?status.assigned_to,
                    "Completion report from a worker that is not the current assignee"
                );
            }
            status.state = TaskState::Completed;
            status.completed_at = Some(Utc::now());
            tracing::info!(task_id = %task_id, worker_id = %worker_id, "Task completed");
        } else {
            tracing::debug!(task_id = %task_id, worker_id = %worker_id, "Completion for untracked task");
        }
        self.deliver(shared, vec![TaskResult { task_id, result }])
            .await;
    }

    /// Hand results to the sink, excluding ids already delivered once.
    /// Runs inside the global critical section so the handled-set check and
    /// update are atomic with respect to concurrent reports.
    async fn deliver(&self, shared: &mut Shared, results: Vec<TaskResult>) {
        let fresh: Vec<TaskResult> = results
            .into_iter()
            .filter(|r| !shared.handled.contains(&r.task_id))
            .collect();
        if fresh.is_empty() {
            return;
        }
        let ids: Vec<String> = fresh.iter().map(|r| r.task_id.clone()).collect();
        self.sink.handle_results(fresh).await;
        for id in ids {
            shared.handled.insert(id);
        }
    }
}
