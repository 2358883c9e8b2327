//! Worker identity, status and the request type workers consume.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::task::{TaskId, TaskKind};

/// Unique identifier for a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
}

/// Read-only view of a worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub tasks_completed: u64,
    pub current_task: Option<TaskId>,
}

/// Work handed to a worker for one attempt of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    /// 1-based dispatch count, echoed back so stale results can be ignored.
    pub attempt: u32,
}
