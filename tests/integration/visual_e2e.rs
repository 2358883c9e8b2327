//! End-to-end tests running visual tasks through the coordinator.
//!
//! Baselines and screenshots are real files in a temporary directory, read
//! by the default filesystem source.

use std::path::Path;

use serde_json::json;
use tempfile::TempDir;

use verity::baseline::BaselineCache;
use verity::config::CacheConfig;
use verity::core::task::{BatchDescriptor, TaskError, TaskKind, TaskStatus};
use verity::handlers::HandlerRegistry;

use crate::fixtures::{coordinator, fast_config};

struct Screenshots {
    dir: TempDir,
}

impl Screenshots {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> String {
        let path = self.dir.path().join(name);
        std::fs::write(&path, bytes).expect("Failed to write screenshot");
        path.to_string_lossy().into_owned()
    }

    fn cache_dir(&self) -> &Path {
        self.dir.path()
    }
}

fn visual(baseline_id: &str, baseline: &str, current: &str) -> BatchDescriptor {
    BatchDescriptor::new(
        TaskKind::Visual,
        json!({
            "baseline_id": baseline_id,
            "baseline_path": baseline,
            "current_path": current,
        }),
    )
}

/// Test: Mixed verification plan
/// Given visual, accessibility and API tasks where the API check depends on
/// the visual one
/// When the plan runs with a baseline cache
/// Then each task reports its own pass or fail outcome
#[tokio::test]
async fn test_mixed_plan_with_visual_checks() {
    let shots = Screenshots::new();
    let baseline = shots.write("home_1.png", &[7u8; 64]);
    let same = shots.write("home_now.png", &[7u8; 64]);
    let changed = shots.write("home_changed.png", &[9u8; 64]);

    let cache = BaselineCache::new(CacheConfig {
        cache_dir: Some(shots.cache_dir().join("store")),
        preload_distance: 0,
        ..Default::default()
    })
    .unwrap();
    let registry = HandlerRegistry::builtin(Some(cache.clone()));
    let coordinator = coordinator(fast_config(3), registry);

    let ids = coordinator
        .add_tasks(vec![
            visual("home_1", &baseline, &same),
            visual("home_1", &baseline, &changed),
            BatchDescriptor::new(
                TaskKind::Accessibility,
                json!({ "violations": [{ "rule": "color-contrast" }], "max_violations": 0 }),
            ),
            BatchDescriptor::new(
                TaskKind::Api,
                json!({
                    "expected_status": 200,
                    "status": 200,
                    "latency_ms": 40,
                    "max_latency_ms": 250
                }),
            )
            .depends_on(0),
        ])
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.completed, 4);
    assert_eq!(summary.failed, 0);

    let outcome = |i: usize| {
        let coordinator = coordinator.clone();
        let id = ids[i];
        async move {
            let task = coordinator.task(id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
            task.result.unwrap()
        }
    };

    let matching = outcome(0).await;
    assert!(matching.success);
    assert_eq!(matching.metrics["difference"], 0.0);

    let differing = outcome(1).await;
    assert!(!differing.success);
    assert_eq!(differing.metrics["passed"], false);

    let contrast = outcome(2).await;
    assert!(!contrast.success);
    assert_eq!(contrast.metrics["violations"], 1);

    assert!(outcome(3).await.success);

    // Both visual tasks share one baseline: one load, then a hit or a join.
    let metrics = cache.metrics();
    assert_eq!(metrics.loads, 1);
    assert_eq!(metrics.cache_hits + metrics.shared_loads, 1);
    assert_eq!(metrics.comparisons, 2);
    cache.shutdown();
}

/// Test: Missing baseline fails the visual task
/// Given a visual task whose baseline file does not exist
/// When it runs with one retry
/// Then it fails with a comparison error
#[tokio::test]
async fn test_missing_baseline_fails_task() {
    let shots = Screenshots::new();
    let current = shots.write("cart_now.png", b"cart");
    let missing = shots.cache_dir().join("cart_1.png");

    let cache = BaselineCache::new(CacheConfig {
        cache_dir: Some(shots.cache_dir().join("store")),
        preload_distance: 0,
        ..Default::default()
    })
    .unwrap();
    let coordinator = coordinator(fast_config(1), HandlerRegistry::builtin(Some(cache)));

    let ids = coordinator
        .add_tasks(vec![visual("cart_1", &missing.to_string_lossy(), &current).with_max_retries(1)])
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.failed, 1);

    let task = coordinator.task(ids[0]).await.unwrap();
    assert!(matches!(
        task.error,
        Some(TaskError::Execution { ref category, ref message })
            if category == "comparison" && message.contains("not found")
    ));
}

/// Test: Visual tasks need a cache
/// Given a registry built without a baseline cache
/// When a visual task runs
/// Then it fails with a configuration error
#[tokio::test]
async fn test_visual_without_cache_is_configuration_error() {
    let coordinator = coordinator(fast_config(1), HandlerRegistry::builtin(None));
    let ids = coordinator
        .add_tasks(vec![visual(
            "x_1",
            "/nonexistent/x_1.png",
            "/nonexistent/x_now.png",
        )
        .with_max_retries(1)])
        .await
        .unwrap();

    let summary = coordinator.start().await.unwrap().wait().await.unwrap();
    assert_eq!(summary.failed, 1);
    let task = coordinator.task(ids[0]).await.unwrap();
    assert!(matches!(
        task.error,
        Some(TaskError::Execution { ref category, .. }) if category == "configuration"
    ));
}
