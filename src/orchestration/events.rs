//! Lifecycle events published by the coordinator.

use serde::{Deserialize, Serialize};

use crate::core::task::{TaskError, TaskId};
use crate::worker::WorkerId;

/// Capacity of the broadcast channel. Slow subscribers see `Lagged`.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum CoordinatorEvent {
    TaskAdded {
        task_id: TaskId,
    },
    TaskAssigned {
        task_id: TaskId,
        worker_id: WorkerId,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
        success: bool,
        elapsed_ms: u64,
    },
    /// Terminal failure, including tasks abandoned because a dependency failed.
    TaskFailed {
        task_id: TaskId,
        error: TaskError,
    },
    TaskRetried {
        task_id: TaskId,
        retry_count: u32,
        error: TaskError,
    },
    TaskTimedOut {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    WorkerCreated {
        worker_id: WorkerId,
    },
    WorkerError {
        worker_id: WorkerId,
        task_id: Option<TaskId>,
        message: String,
    },
    WorkerExited {
        worker_id: WorkerId,
    },
    WorkerRemoved {
        worker_id: WorkerId,
    },
    Started {
        workers: usize,
    },
    Completed {
        completed: usize,
        failed: usize,
    },
    Stopped,
}

impl CoordinatorEvent {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            CoordinatorEvent::TaskAdded { task_id }
            | CoordinatorEvent::TaskAssigned { task_id, .. }
            | CoordinatorEvent::TaskCompleted { task_id, .. }
            | CoordinatorEvent::TaskFailed { task_id, .. }
            | CoordinatorEvent::TaskRetried { task_id, .. }
            | CoordinatorEvent::TaskTimedOut { task_id, .. } => Some(*task_id),
            CoordinatorEvent::WorkerError { task_id, .. } => *task_id,
            _ => None,
        }
    }

    pub fn worker_id(&self) -> Option<WorkerId> {
        match self {
            CoordinatorEvent::TaskAssigned { worker_id, .. }
            | CoordinatorEvent::TaskCompleted { worker_id, .. }
            | CoordinatorEvent::TaskTimedOut { worker_id, .. }
            | CoordinatorEvent::WorkerCreated { worker_id }
            | CoordinatorEvent::WorkerError { worker_id, .. }
            | CoordinatorEvent::WorkerExited { worker_id }
            | CoordinatorEvent::WorkerRemoved { worker_id } => Some(*worker_id),
            _ => None,
        }
    }
}
