//! Task data model for the coordinator.
//!
//! Tasks are the atomic units of verification work handed to workers. Each
//! task tracks its status, retry budget, timing, and its result or the last
//! error it produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

/// Default number of attempts a task gets before landing in the failed set.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The kind of verification a task performs.
///
/// Each kind maps to exactly one handler in the
/// [`HandlerRegistry`](crate::handlers::HandlerRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Visual,
    Accessibility,
    Interaction,
    Performance,
    Api,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Visual,
        TaskKind::Accessibility,
        TaskKind::Interaction,
        TaskKind::Performance,
        TaskKind::Api,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Visual => "visual",
            TaskKind::Accessibility => "accessibility",
            TaskKind::Interaction => "interaction",
            TaskKind::Performance => "performance",
            TaskKind::Api => "api",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status in its lifecycle.
///
/// `Completed`, `Failed` and `Timeout` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies or on a free worker.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting to be dispatched.
    Ready,
    /// Dispatched to a worker.
    Running,
    Completed,
    Failed,
    /// Retries exhausted and the last attempt hit the dispatch deadline.
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Structured error recorded on a task.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskError {
    #[error("task exceeded its {after_ms}ms deadline")]
    Timeout { after_ms: u64 },

    #[error("{category}: {message}")]
    Execution { message: String, category: String },

    #[error("worker crashed: {message}")]
    WorkerCrash { message: String },

    #[error("dependency {dependency} failed")]
    DependencyFailed { dependency: TaskId },
}

impl TaskError {
    /// Convenience constructor for handler failures.
    pub fn execution(category: &str, message: impl Into<String>) -> Self {
        TaskError::Execution {
            message: message.into(),
            category: category.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }
}

/// Result produced by a handler for a successful attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub kind: TaskKind,
    pub success: bool,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub metrics: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TaskOutput {
    pub fn new(kind: TaskKind, success: bool, metrics: serde_json::Value) -> Self {
        Self {
            kind,
            success,
            execution_time_ms: 0,
            metrics,
            timestamp: Utc::now(),
        }
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// A task submission.
///
/// `D` is the dependency reference type: [`TaskId`] for single submissions
/// and `usize` (batch position) for [`BatchDescriptor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec<D> {
    pub kind: TaskKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "Vec::new")]
    pub dependencies: Vec<D>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

pub type TaskDescriptor = TaskSpec<TaskId>;
pub type BatchDescriptor = TaskSpec<usize>;

impl<D> TaskSpec<D> {
    pub fn new(kind: TaskKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            priority: 0,
            dependencies: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn depends_on(mut self, dependency: D) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

/// A task owned by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub dependencies: HashSet<TaskId>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Number of times the task has been dispatched.
    pub attempts: u32,
    /// Submission order, used as the creation-order tie breaker.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: Option<TaskOutput>,
    pub error: Option<TaskError>,
}

impl Task {
    /// Create a pending task from a resolved descriptor.
    pub fn new(id: TaskId, descriptor: TaskDescriptor, sequence: u64) -> Self {
        Self {
            id,
            kind: descriptor.kind,
            payload: descriptor.payload,
            priority: descriptor.priority,
            dependencies: descriptor.dependencies.into_iter().collect(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: descriptor.max_retries,
            attempts: 0,
            sequence,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
        }
    }

    /// Whether every dependency is in the completed set.
    pub fn dependencies_met(&self, completed: &HashSet<TaskId>) -> bool {
        self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Transition from Pending to Ready.
    pub fn mark_ready(&mut self) {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Ready;
        }
    }

    /// Record a dispatch: status Running, start stamp, attempt counter.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.attempts += 1;
    }

    pub fn complete(&mut self, output: TaskOutput) {
        self.status = TaskStatus::Completed;
        self.ended_at = Some(Utc::now());
        self.result = Some(output);
        self.error = None;
    }

    /// Record a failed attempt.
    ///
    /// Returns `true` when the task goes back to Pending for another try and
    /// `false` when the retry budget is spent and the task is terminal.
    pub fn record_failure(&mut self, error: TaskError) -> bool {
        self.retry_count += 1;
        let retry = self.retry_count < self.max_retries;
        if retry {
            self.status = TaskStatus::Pending;
        } else {
            self.status = if error.is_timeout() {
                TaskStatus::Timeout
            } else {
                TaskStatus::Failed
            };
            self.ended_at = Some(Utc::now());
        }
        self.error = Some(error);
        retry
    }

    /// Fail without consuming retries (used when a dependency failed).
    pub fn abandon(&mut self, error: TaskError) {
        self.status = TaskStatus::Failed;
        self.ended_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock time of the latest attempt, if it has ended.
    pub fn elapsed_ms(&self) -> Option<u64> {
        let start = self.started_at?;
        let end = self.ended_at?;
        Some((end - start).num_milliseconds().max(0) as u64)
    }
}
