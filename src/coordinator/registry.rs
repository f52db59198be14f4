use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Coordinator's view of one connected worker.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: Uuid,
    pub task_types: HashSet<String>,
    pub is_ready: bool,
    pub connected_at: DateTime<Utc>,
}

impl WorkerInfo {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            task_types: HashSet::new(),
            is_ready: false,
            connected_at: Utc::now(),
        }
    }
}

/// Table of connected workers, keyed by connection id.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<Uuid, WorkerInfo>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record for a new connection: empty capabilities, not ready.
    pub fn register(&mut self, id: Uuid) {
        self.workers.insert(id, WorkerInfo::new(id));
        tracing::info!(worker_id = %id, "Worker connected");
    }

    /// Replace the declared capability set.
    pub fn set_capabilities(&mut self, id: Uuid, types: Vec<String>) {
        if let Some(worker) = self.workers.get_mut(&id) {
            worker.task_types = types.into_iter().collect();
        }
    }

    /// Union `types` into the stored set and mark the worker ready.
    pub fn mark_ready(&mut self, id: Uuid, types: Vec<String>) {
        if let Some(worker) = self.workers.get_mut(&id) {
            worker.task_types.extend(types);
            worker.is_ready = true;
            tracing::debug!(
                worker_id = %id,
                task_types = ?worker.task_types,
                "Worker ready"
            );
        }
    }

    pub fn remove(&mut self, id: Uuid) -> Option<WorkerInfo> {
        self.workers.remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<&WorkerInfo> {
        self.workers.get(&id)
    }

    /// A worker is eligible for assignment only when it is ready and has
    /// declared at least one capability.
    pub fn is_eligible(&self, id: Uuid) -> bool {
        self.workers
            .get(&id)
            .map(|w| w.is_ready && !w.task_types.is_empty())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
