//! REST boundary: task ingestion and status inspection.
//!
//! Malformed input is rejected here with a client error and never reaches
//! the assignment engine.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::coordinator::engine::AssignmentEngine;
use crate::coordinator::store::TaskStatus;
use crate::protocol::{Task, TaskState};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub task_id: String,
    pub task_type: String,
    pub state: TaskState,
    pub assigned_to: Option<Uuid>,
    pub enqueued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<TaskStatus> for TaskStatusView {
    fn from(status: TaskStatus) -> Self {
        Self {
            task_id: status.task.task_id,
            task_type: status.task.task_type,
            state: status.state,
            assigned_to: status.assigned_to,
            enqueued_at: status.enqueued_at,
            completed_at: status.completed_at,
        }
    }
}

fn validate(task: &Task) -> Option<&'static str> {
    if task.task_id.is_empty() {
        return Some("taskId must be non-empty");
    }
    if task.task_type.is_empty() {
        return Some("taskType must be non-empty");
    }
    None
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskhive-coordinator"
    }))
}

pub async fn add_task(
    State(engine): State<Arc<AssignmentEngine>>,
    Json(task): Json<Task>,
) -> impl IntoResponse {
    if let Some(reason) = validate(&task) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": reason})),
        );
    }

    let task_id = task.task_id.clone();
    engine.enqueue(task).await;
    (
        StatusCode::CREATED,
        Json(serde_json::json!({"taskId": task_id, "status": "queued"})),
    )
}

pub async fn add_tasks(
    State(engine): State<Arc<AssignmentEngine>>,
    Json(tasks): Json<Vec<Task>>,
) -> impl IntoResponse {
    for task in &tasks {
        if let Some(reason) = validate(task) {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": reason})),
            );
        }
    }

    let count = tasks.len();
    engine.enqueue_batch(tasks).await;
    (
        StatusCode::CREATED,
        Json(serde_json::json!({"queued": count})),
    )
}

pub async fn task_status(
    State(engine): State<Arc<AssignmentEngine>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match engine.task_status(&id).await {
        Some(status) => {
            let view = TaskStatusView::from(status);
            (StatusCode::OK, Json(serde_json::json!(view)))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("Task not found: {}", id)})),
        ),
    }
}

pub async fn list_tasks(State(engine): State<Arc<AssignmentEngine>>) -> impl IntoResponse {
    let views: Vec<TaskStatusView> = engine
        .all_statuses()
        .await
        .into_iter()
        .map(TaskStatusView::from)
        .collect();
    Json(views)
}
