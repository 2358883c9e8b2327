//! Orchestration layer for the verification engine.
//!
//! [`TaskCoordinator`] owns the task set and drives a [`WorkerPool`] of
//! async workers, gated by resource samples from [`ResourceMonitor`].
//! Lifecycle changes are published as [`CoordinatorEvent`]s.

pub mod coordinator;
pub mod events;
pub mod monitor;
pub mod pool;

pub use coordinator::{Completion, ExecutionSummary, TaskCoordinator, TaskResults};
pub use events::{CoordinatorEvent, EVENT_CAPACITY};
pub use monitor::{
    adaptive_batch_size, ResourceMetrics, ResourceMonitor, ResourceProbe, ResourceSample,
    StaticProbe, SystemProbe, SAMPLE_CAPACITY,
};
pub use pool::{WorkerMessage, WorkerPool};
