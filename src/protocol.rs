//! Wire contract between coordinator and workers.
//!
//! Every message is a JSON object with an `event` discriminator, sent as a
//! WebSocket text frame. The event names and payload shapes are the
//! interoperability contract: either side can be replaced independently as
//! long as it speaks these messages.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of work. The scheduler only looks at `task_id` and `task_type`;
/// the payload is opaque until it reaches a worker's setup/execute phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Producer-assigned identifier. Must be non-empty for the task to be
    /// tracked in the coordinator's status table.
    #[serde(default)]
    pub task_id: String,
    /// Capability key used for worker matching.
    pub task_type: String,
    #[serde(default)]
    pub payload: TaskPayload,
}

impl Task {
    pub fn new(task_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            payload: TaskPayload::default(),
        }
    }

    pub fn with_payload(mut self, payload: TaskPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Whether this task can be tracked in the status table.
    pub fn is_tracked(&self) -> bool {
        !self.task_id.is_empty()
    }
}

/// Execution payload carried by a task. Opaque to the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    /// Entry point file, relative to the task workspace.
    #[serde(default)]
    pub entry_point: String,
    /// Files to materialize in the workspace: relative path -> content.
    #[serde(default)]
    pub files: HashMap<String, String>,
    /// Environment variables for the execute phase.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Arguments passed after the entry point.
    #[serde(default)]
    pub args: Vec<String>,
    /// Shell commands run during the setup phase (dependency install, build).
    /// Skipped when the workspace's fileset hash is unchanged.
    #[serde(default)]
    pub setup_commands: Vec<String>,
    /// Execution timeout. Falls back to the worker's configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Lifecycle state of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Installed,
    Failed,
    Completed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Installed => write!(f, "installed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Completed => write!(f, "completed"),
        }
    }
}

/// Outcome of a worker's setup phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    Success,
    Failure,
}

/// A completed task's result as submitted by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub result: Value,
}

/// Events emitted by workers, handled by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerEvent {
    /// Replace the worker's declared capability set.
    RegisterCapabilities { task_types: Vec<String> },
    /// Union capabilities into the declared set and mark the worker ready.
    NotifyReady { task_types: Vec<String> },
    /// Pull one task (dynamic protocol).
    RequestTask,
    /// Setup phase report for an assigned task.
    InstallationStatus {
        task_id: String,
        status: InstallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Final report for an assigned task. `result` is opaque and echoed to
    /// the coordinator's result sink.
    TaskCompleted { task_id: String, result: Value },
    /// Pull the remaining batch (basic protocol).
    RequestTasks,
    /// Batch result submission (basic protocol).
    TaskResults { results: Vec<TaskResult> },
}

/// Events emitted by the coordinator, handled by workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CoordinatorEvent {
    /// A task matched the requesting worker's capabilities.
    AssignTask { task: Task },
    /// The worker is not eligible or nothing in the queue matches.
    NoTask { message: String },
    /// The remaining static batch (basic protocol).
    ProvideTasks { tasks: Vec<Task> },
    /// The static batch is exhausted (basic protocol).
    NoMoreTasks,
}
