//! Core domain models for the verification engine.
//!
//! Tasks, their descriptors and lifecycle, and the dependency graph that
//! validates submissions.

pub mod dag;
pub mod task;

pub use dag::DependencyGraph;
pub use task::{
    BatchDescriptor, Task, TaskDescriptor, TaskError, TaskId, TaskKind, TaskOutput, TaskSpec,
    TaskStatus,
};
