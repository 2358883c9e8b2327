//! Deadline, crash and resource-pressure recovery tests.
//!
//! These tests verify that the coordinator recovers tasks from hung or
//! crashed workers through the dispatch deadline, and that it backs off
//! under memory pressure.

use std::time::Duration;

use serde_json::json;

use verity::config::CoordinatorConfig;
use verity::core::task::{TaskDescriptor, TaskError, TaskKind, TaskOutput, TaskStatus};
use verity::handlers::HandlerRegistry;
use verity::orchestration::CoordinatorEvent;
use verity::worker::TaskRequest;

use crate::fixtures::{
    coordinator, coordinator_with_probe, drain_events, fast_config, named, recording_registry,
};

fn with_timeout(workers: usize, timeout_ms: u64) -> CoordinatorConfig {
    CoordinatorConfig {
        worker_timeout_ms: timeout_ms,
        ..fast_config(workers)
    }
}

/// API handler that hangs on the first attempt and succeeds afterwards.
fn hangs_once() -> HandlerRegistry {
    let mut registry = HandlerRegistry::builtin(None);
    registry.register(TaskKind::Api, |request: TaskRequest| async move {
        if request.attempt == 1 {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok::<_, TaskError>(TaskOutput::new(TaskKind::Api, true, json!({})))
    });
    registry
}

/// Test: Hung attempt is retried after the deadline
/// Given a handler that hangs on its first attempt
/// When the worker deadline passes
/// Then the task times out once, its worker is recycled and the retry completes
#[tokio::test]
async fn test_deadline_retries_hung_task() {
    let coordinator = coordinator(with_timeout(1, 60), hangs_once());
    let mut events = coordinator.subscribe();

    let id = coordinator
        .add_task(TaskDescriptor::new(TaskKind::Api, json!({})))
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.worker_count, 1);

    let task = coordinator.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.attempts, 2);

    let events = drain_events(&mut events);
    let timed_out = events
        .iter()
        .filter(|e| matches!(e, CoordinatorEvent::TaskTimedOut { task_id, .. } if *task_id == id))
        .count();
    assert_eq!(timed_out, 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::WorkerRemoved { .. })));
}

/// Test: Repeated timeouts end in the Timeout status
/// Given a handler that never finishes and max_retries of 2
/// When every attempt passes its deadline
/// Then the task lands in the failed set with status Timeout
#[tokio::test]
async fn test_timeouts_exhaust_retries() {
    let mut registry = HandlerRegistry::builtin(None);
    registry.register(TaskKind::Api, |_request: TaskRequest| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<_, TaskError>(TaskOutput::new(TaskKind::Api, true, json!({})))
    });
    let coordinator = coordinator(with_timeout(1, 40), registry);

    let id = coordinator
        .add_task(TaskDescriptor::new(TaskKind::Api, json!({})).with_max_retries(2))
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.failed, 1);

    let task = coordinator.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Timeout);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.error, Some(TaskError::Timeout { after_ms: 40 }));
}

/// Test: Crashed worker is replaced and its task recovered
/// Given a handler that panics on its first attempt
/// When the worker dies
/// Then a replacement worker is created and the task completes on retry
#[tokio::test]
async fn test_worker_crash_recovered_by_deadline() {
    let mut registry = HandlerRegistry::builtin(None);
    registry.register(TaskKind::Interaction, |request: TaskRequest| async move {
        if request.attempt == 1 {
            panic!("browser session lost");
        }
        Ok::<_, TaskError>(TaskOutput::new(TaskKind::Interaction, true, json!({})))
    });
    let coordinator = coordinator(with_timeout(2, 100), registry);
    let mut events = coordinator.subscribe();

    let id = coordinator
        .add_task(TaskDescriptor::new(TaskKind::Interaction, json!({})))
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.worker_count, 2);
    assert_eq!(coordinator.task(id).await.unwrap().retry_count, 1);

    let events = drain_events(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        CoordinatorEvent::WorkerError { task_id: Some(t), message, .. }
            if *t == id && message.contains("browser session lost")
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::WorkerExited { .. })));
    let created = events
        .iter()
        .filter(|e| matches!(e, CoordinatorEvent::WorkerCreated { .. }))
        .count();
    assert_eq!(created, 3);
}

/// Test: Memory pressure shrinks the pool and holds dispatch
/// Given three workers and a probe reporting 95% memory use
/// When the scheduler runs
/// Then idle workers are retired down to one and nothing is dispatched
/// until pressure drops
#[tokio::test]
async fn test_memory_pressure_scales_down() {
    let (registry, log) = recording_registry(Duration::ZERO);
    let config = CoordinatorConfig {
        adaptive_scaling: true,
        ..fast_config(3)
    };
    let (coordinator, probe) = coordinator_with_probe(config, registry);
    probe.set_memory(0.95);
    let mut events = coordinator.subscribe();

    for name in ["a", "b"] {
        coordinator
            .add_task(TaskDescriptor::new(TaskKind::Api, named(name)))
            .await
            .unwrap();
    }
    let completion = coordinator.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(log.len(), 0);
    assert_eq!(coordinator.worker_status().await.len(), 1);

    probe.set_memory(0.2);
    let summary = completion.wait().await.unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.worker_count, 1);
    assert!(summary.resource_metrics.peak_memory > 0.9);

    let removed = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, CoordinatorEvent::WorkerRemoved { .. }))
        .count();
    assert_eq!(removed, 2);
}

/// Test: Pressure is ignored without adaptive scaling
/// Given adaptive scaling disabled and a probe reporting 95% memory use
/// When the coordinator runs
/// Then every worker is kept and tasks complete
#[tokio::test]
async fn test_pressure_ignored_without_adaptive_scaling() {
    let (registry, log) = recording_registry(Duration::ZERO);
    let (coordinator, probe) = coordinator_with_probe(fast_config(3), registry);
    probe.set_memory(0.95);

    coordinator
        .add_task(TaskDescriptor::new(TaskKind::Api, named("a")))
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.worker_count, 3);
    assert_eq!(log.len(), 1);
}

/// Test: Stop returns running work to pending
/// Given a task running on a slow handler
/// When the coordinator is stopped
/// Then workers are gone, the task is pending with no retry consumed,
/// and a later run completes it
#[tokio::test]
async fn test_stop_and_restart() {
    let coordinator = coordinator(with_timeout(1, 2_000), hangs_once());
    let mut events = coordinator.subscribe();

    let id = coordinator
        .add_task(TaskDescriptor::new(TaskKind::Api, json!({})))
        .await
        .unwrap();
    let completion = coordinator.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coordinator.task(id).await.unwrap().status, TaskStatus::Running);

    coordinator.stop().await;
    let summary = completion.wait().await.unwrap();
    assert_eq!(summary.pending, 1);
    assert_eq!(summary.worker_count, 0);
    assert!(!coordinator.is_running().await);
    assert!(coordinator.worker_status().await.is_empty());

    let task = coordinator.task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
    assert!(drain_events(&mut events)
        .iter()
        .any(|e| matches!(e, CoordinatorEvent::Stopped)));

    // Second attempt no longer hangs.
    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(coordinator.task(id).await.unwrap().attempts, 2);
}
