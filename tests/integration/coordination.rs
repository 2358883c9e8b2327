//! Coordinator scheduling integration tests.
//!
//! These tests verify dependency ordering, priority dispatch, the worker
//! bound and the retry budget through the public coordinator API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use verity::core::task::{
    BatchDescriptor, TaskDescriptor, TaskError, TaskKind, TaskOutput, TaskStatus,
};
use verity::handlers::HandlerRegistry;
use verity::orchestration::CoordinatorEvent;
use verity::worker::TaskRequest;
use verity::Error;

use crate::fixtures::{
    coordinator, drain_events, failing_registry, fast_config, named, record_calls,
    recording_registry,
};

/// Test: Single task completes
/// Given one dependency-free task and two workers
/// When the coordinator runs
/// Then the summary reports one completed task
#[tokio::test]
async fn test_single_task_completes() {
    let (registry, log) = recording_registry(Duration::ZERO);
    let coordinator = coordinator(fast_config(2), registry);

    coordinator
        .add_task(TaskDescriptor::new(TaskKind::Api, named("ping")))
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.pending, 0);
    assert_eq!(summary.total_tasks, 1);
    assert_eq!(summary.worker_count, 2);
    assert_eq!(log.len(), 1);
    assert_eq!(coordinator.execution_summary().await.completed, 1);
}

/// Test: Dependent starts after its dependency
/// Given task B depending on task A by batch position
/// When the coordinator runs with spare workers
/// Then B starts only after A has completed
#[tokio::test]
async fn test_dependency_order_respected() {
    let (registry, log) = recording_registry(Duration::from_millis(30));
    let coordinator = coordinator(fast_config(4), registry);

    let ids = coordinator
        .add_tasks(vec![
            BatchDescriptor::new(TaskKind::Api, named("a")),
            BatchDescriptor::new(TaskKind::Api, named("b")).depends_on(0),
        ])
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.completed, 2);

    let a = coordinator.task(ids[0]).await.unwrap();
    let b = coordinator.task(ids[1]).await.unwrap();
    assert!(b.dependencies.contains(&a.id));
    assert!(b.started_at.unwrap() >= a.ended_at.unwrap());
    assert_eq!(log.names(), vec!["a", "b"]);
}

/// Test: Diamond dependencies
/// Given a root, two branches and a join task
/// When the coordinator runs
/// Then the join runs last and every task completes
#[tokio::test]
async fn test_diamond_dependencies() {
    let (registry, log) = recording_registry(Duration::from_millis(10));
    let coordinator = coordinator(fast_config(3), registry);

    coordinator
        .add_tasks(vec![
            BatchDescriptor::new(TaskKind::Api, named("root")),
            BatchDescriptor::new(TaskKind::Api, named("left")).depends_on(0),
            BatchDescriptor::new(TaskKind::Api, named("right")).depends_on(0),
            BatchDescriptor::new(TaskKind::Api, named("join"))
                .depends_on(1)
                .depends_on(2),
        ])
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.completed, 4);

    let names = log.names();
    assert_eq!(names.first().map(String::as_str), Some("root"));
    assert_eq!(names.last().map(String::as_str), Some("join"));
}

/// Test: Higher priority dispatches first
/// Given one worker and ready tasks of mixed priority
/// When the coordinator runs
/// Then tasks run by descending priority, ties in submission order
#[tokio::test]
async fn test_priority_ordering() {
    let (registry, log) = recording_registry(Duration::from_millis(5));
    let coordinator = coordinator(fast_config(1), registry);

    for (name, priority) in [("low", 0), ("high", 10), ("mid_1", 5), ("mid_2", 5)] {
        coordinator
            .add_task(TaskDescriptor::new(TaskKind::Api, named(name)).with_priority(priority))
            .await
            .unwrap();
    }

    coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(log.names(), vec!["high", "mid_1", "mid_2", "low"]);
}

/// Test: Worker bound holds
/// Given two workers and six slow tasks
/// When the coordinator runs
/// Then no more than two handlers ever run at once
#[tokio::test]
async fn test_concurrency_never_exceeds_workers() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut registry = HandlerRegistry::builtin(None);
    {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        registry.register(TaskKind::Api, move |_request: TaskRequest| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(25)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, TaskError>(TaskOutput::new(TaskKind::Api, true, json!({})))
            }
        });
    }

    let coordinator = coordinator(fast_config(2), registry);
    for i in 0..6 {
        coordinator
            .add_task(TaskDescriptor::new(TaskKind::Api, named(&format!("t{i}"))))
            .await
            .unwrap();
    }

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.completed, 6);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

/// Test: Retry budget is final
/// Given a task whose handler always fails and max_retries of 3
/// When the coordinator runs
/// Then the task fails with retry_count 3 after exactly three attempts
#[tokio::test]
async fn test_retries_exhausted() {
    let (registry, log) = failing_registry();
    let coordinator = coordinator(fast_config(2), registry);
    let mut events = coordinator.subscribe();

    let id = coordinator
        .add_task(TaskDescriptor::new(TaskKind::Api, json!({})).with_max_retries(3))
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 0);

    let results = coordinator.task_results().await;
    assert_eq!(results.failed.len(), 1);
    let task = &results.failed[0];
    assert_eq!(task.id, id);
    assert_eq!(task.retry_count, 3);
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(matches!(
        task.error,
        Some(TaskError::Execution { ref category, .. }) if category == "network"
    ));

    // Give the loop a moment in case anything was wrongly requeued.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.len(), 3);
    assert_eq!(log.attempts(), vec![1, 2, 3]);

    let events = drain_events(&mut events);
    let retried = events
        .iter()
        .filter(|e| matches!(e, CoordinatorEvent::TaskRetried { .. }))
        .count();
    let failed = events
        .iter()
        .filter(|e| matches!(e, CoordinatorEvent::TaskFailed { task_id, .. } if *task_id == id))
        .count();
    assert_eq!(retried, 2);
    assert_eq!(failed, 1);
}

/// Test: Failure cascades to dependents
/// Given a failing root with a chain of two dependents
/// When the root exhausts its retries
/// Then both dependents fail with DependencyFailed and never run
#[tokio::test]
async fn test_failure_cascades_transitively() {
    let (mut registry, failures) = failing_registry();
    let successes = record_calls(&mut registry, TaskKind::Performance, Duration::ZERO);

    let coordinator = coordinator(fast_config(2), registry);
    let ids = coordinator
        .add_tasks(vec![
            BatchDescriptor::new(TaskKind::Api, json!({})).with_max_retries(1),
            BatchDescriptor::new(TaskKind::Performance, named("child")).depends_on(0),
            BatchDescriptor::new(TaskKind::Performance, named("grandchild")).depends_on(1),
        ])
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.failed, 3);
    assert_eq!(failures.len(), 1);
    assert_eq!(successes.len(), 0);

    for dependent in &ids[1..] {
        let task = coordinator.task(*dependent).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert!(matches!(task.error, Some(TaskError::DependencyFailed { .. })));
    }
}

/// Test: Independent work survives a failure
/// Given a failing task and an unrelated task
/// When the coordinator runs
/// Then the unrelated task still completes
#[tokio::test]
async fn test_unrelated_task_unaffected_by_failure() {
    let (mut registry, _failures) = failing_registry();
    let successes = record_calls(&mut registry, TaskKind::Performance, Duration::ZERO);

    let coordinator = coordinator(fast_config(2), registry);
    coordinator
        .add_tasks(vec![
            BatchDescriptor::new(TaskKind::Api, json!({})).with_max_retries(2),
            BatchDescriptor::new(TaskKind::Performance, named("independent")),
        ])
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(successes.names(), vec!["independent"]);
}

/// Test: Invalid batches change nothing
/// Given a batch with a cycle and a batch with a dangling position
/// When they are submitted
/// Then both are rejected and no task is recorded
#[tokio::test]
async fn test_invalid_batches_rejected() {
    let (registry, _log) = recording_registry(Duration::ZERO);
    let coordinator = coordinator(fast_config(1), registry);

    let cycle = coordinator
        .add_tasks(vec![
            BatchDescriptor::new(TaskKind::Api, json!({})).depends_on(1),
            BatchDescriptor::new(TaskKind::Api, json!({})).depends_on(0),
        ])
        .await;
    assert!(matches!(cycle, Err(Error::DependencyCycle(_))));

    let dangling = coordinator
        .add_tasks(vec![BatchDescriptor::new(TaskKind::Api, json!({})).depends_on(5)])
        .await;
    assert!(matches!(
        dangling,
        Err(Error::InvalidBatchReference { index: 0, reference: 5, len: 1 })
    ));

    assert_eq!(coordinator.execution_summary().await.total_tasks, 0);
}

/// Test: Tasks submitted mid-run are picked up
/// Given a running coordinator with one slow task
/// When another task is added before the first finishes
/// Then the run drains only after both complete
#[tokio::test]
async fn test_task_added_while_running() {
    let (registry, log) = recording_registry(Duration::from_millis(50));
    let coordinator = coordinator(fast_config(2), registry);

    coordinator
        .add_task(TaskDescriptor::new(TaskKind::Api, named("first")))
        .await
        .unwrap();
    let completion = coordinator.start().await.unwrap();
    assert!(coordinator.is_running().await);

    coordinator
        .add_task(TaskDescriptor::new(TaskKind::Api, named("second")))
        .await
        .unwrap();

    let summary = completion.wait().await.unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(log.len(), 2);
    assert!(!coordinator.is_running().await);
}
