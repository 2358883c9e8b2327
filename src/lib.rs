//! Parallel verification engine.
//!
//! Two subsystems share this crate:
//!
//! - [`orchestration`]: a dependency-aware task coordinator that dispatches
//!   verification tasks to a bounded worker pool with retries, deadlines and
//!   memory-pressure backoff.
//! - [`baseline`]: a lazy baseline image cache with single-flight loads,
//!   a persistent store, predictive preloading and a comparison worker pool
//!   from [`comparison`].

pub mod baseline;
pub mod comparison;
pub mod config;
pub mod core;
pub mod error;
pub mod handlers;
pub mod log;
pub mod orchestration;
pub mod util;
pub mod worker;

pub use baseline::{BaselineCache, CacheMetrics, CacheStatus};
pub use comparison::{CompareOptions, ComparisonReport, Fidelity};
pub use config::{CacheConfig, Config, CoordinatorConfig};
pub use crate::core::{BatchDescriptor, Task, TaskDescriptor, TaskId, TaskKind, TaskStatus};
pub use error::{CacheError, Error, Result};
pub use handlers::{HandlerRegistry, TaskHandler};
pub use orchestration::{CoordinatorEvent, ExecutionSummary, TaskCoordinator};
pub use worker::{TaskRequest, WorkerId};
