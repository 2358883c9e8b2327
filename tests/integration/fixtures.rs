//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Coordinators with fast ticks and a fixed resource probe
//! - Handler registries whose handlers record their invocations
//! - An in-memory baseline source that counts reads per path
//! - Cache configurations rooted in a temporary directory

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::broadcast;

use verity::baseline::{BaselineCache, BaselineSource};
use verity::config::{CacheConfig, CoordinatorConfig};
use verity::core::task::{TaskError, TaskKind, TaskOutput};
use verity::handlers::HandlerRegistry;
use verity::orchestration::{CoordinatorEvent, StaticProbe, TaskCoordinator};
use verity::worker::TaskRequest;

/// Coordinator settings tuned for tests: short ticks, no adaptive scaling.
pub fn fast_config(workers: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        max_workers: workers,
        worker_timeout_ms: 2_000,
        tick_interval_ms: 10,
        sample_interval_ms: 50,
        adaptive_scaling: false,
        ..Default::default()
    }
}

/// A coordinator over `registry` whose probe reports low pressure.
pub fn coordinator(config: CoordinatorConfig, registry: HandlerRegistry) -> TaskCoordinator {
    coordinator_with_probe(config, registry).0
}

/// Like [`coordinator`], also returning the probe so tests can change it.
pub fn coordinator_with_probe(
    config: CoordinatorConfig,
    registry: HandlerRegistry,
) -> (TaskCoordinator, Arc<StaticProbe>) {
    let probe = Arc::new(StaticProbe::new(0.1, 0.1));
    let coordinator = TaskCoordinator::with_probe(config, registry, probe.clone());
    (coordinator, probe)
}

/// Log of handler invocations, shared with the handler closures.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<(serde_json::Value, u32)>>>,
}

impl CallLog {
    pub fn record(&self, request: &TaskRequest) {
        self.calls
            .lock()
            .unwrap()
            .push((request.payload.clone(), request.attempt));
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// The `"name"` field of every recorded payload, in call order.
    pub fn names(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(payload, _)| payload["name"].as_str().map(str::to_string))
            .collect()
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.calls.lock().unwrap().iter().map(|(_, a)| *a).collect()
    }
}

/// Register a handler for `kind` that succeeds after `delay` and logs each call.
pub fn record_calls(registry: &mut HandlerRegistry, kind: TaskKind, delay: Duration) -> CallLog {
    let log = CallLog::default();
    let calls = log.clone();
    registry.register(kind, move |request: TaskRequest| {
        calls.record(&request);
        async move {
            tokio::time::sleep(delay).await;
            Ok::<_, TaskError>(TaskOutput::new(kind, true, json!({})))
        }
    });
    log
}

/// Register a handler for `kind` that always fails and logs each call.
pub fn fail_calls(registry: &mut HandlerRegistry, kind: TaskKind) -> CallLog {
    let log = CallLog::default();
    let calls = log.clone();
    registry.register(kind, move |request: TaskRequest| {
        calls.record(&request);
        async move { Err::<TaskOutput, _>(TaskError::execution("network", "connection refused")) }
    });
    log
}

/// Built-in registry with a recording API handler.
pub fn recording_registry(delay: Duration) -> (HandlerRegistry, CallLog) {
    let mut registry = HandlerRegistry::builtin(None);
    let log = record_calls(&mut registry, TaskKind::Api, delay);
    (registry, log)
}

/// Built-in registry with an API handler that always fails.
pub fn failing_registry() -> (HandlerRegistry, CallLog) {
    let mut registry = HandlerRegistry::builtin(None);
    let log = fail_calls(&mut registry, TaskKind::Api);
    (registry, log)
}

/// Payload naming a task so [`CallLog::names`] can report dispatch order.
pub fn named(name: &str) -> serde_json::Value {
    json!({ "name": name })
}

/// Drain every event currently buffered on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// In-memory baseline source counting reads per path.
#[derive(Default)]
pub struct CountingSource {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    reads: Mutex<HashMap<PathBuf, usize>>,
    total: AtomicUsize,
    delay: Duration,
}

impl CountingSource {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn insert(&self, path: impl Into<PathBuf>, bytes: &[u8]) {
        self.files.lock().unwrap().insert(path.into(), bytes.to_vec());
    }

    pub fn reads_of(&self, path: impl AsRef<Path>) -> usize {
        self.reads
            .lock()
            .unwrap()
            .get(path.as_ref())
            .copied()
            .unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl BaselineSource for CountingSource {
    fn read(&self, path: &Path) -> BoxFuture<'static, io::Result<Vec<u8>>> {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self
            .reads
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default() += 1;
        let found = self.files.lock().unwrap().get(path).cloned();
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            found.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such baseline"))
        })
    }
}

/// A temporary persistent store and cache settings pointing at it.
pub struct TestCacheDir {
    pub temp_dir: TempDir,
}

impl TestCacheDir {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Defaults with the persistent store in the temp dir and preloading off.
    pub fn config(&self) -> CacheConfig {
        CacheConfig {
            cache_dir: Some(self.path().join("baselines")),
            preload_distance: 0,
            preload_interval_ms: 10,
            ..Default::default()
        }
    }

    pub fn cache(&self, config: CacheConfig, source: Arc<CountingSource>) -> BaselineCache {
        BaselineCache::builder(config)
            .source(source)
            .build()
            .expect("Failed to build cache")
    }
}

/// Poll `condition` every 10ms until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
