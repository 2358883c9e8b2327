//! Lazy baseline cache.
//!
//! Baselines are resolved memory first, then from the persistent store, then
//! from their source. Concurrent requests for the same id share one load.
//! Successful demand loads queue the next ids of the sequence for
//! background preloading. Comparisons run either on the dedicated
//! [`ComparisonPool`] or on the blocking thread pool of the runtime.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::baseline::memory::MemoryCache;
use crate::baseline::sequence::{BaselineSequence, NumericSuffixSequence};
use crate::baseline::store::{BaselineSource, DiskStore, FsSource};
use crate::comparison::{
    run_comparison, ByteDiffComparator, CompareOptions, ComparisonMethod, ComparisonPool,
    ComparisonPoolStats, ComparisonReport, Fidelity, ImageComparator,
};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::util::blocking_with_timeout;
use crate::{Error, Result};

type LoadResult = std::result::Result<Arc<Vec<u8>>, CacheError>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Demand,
    Preload,
}

enum Lookup {
    Hit(Arc<Vec<u8>>),
    Load(SharedLoad),
}

#[derive(Debug, Default)]
struct PreloadQueue {
    queue: VecDeque<(String, PathBuf)>,
    active: usize,
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicU64,
    cache_hits: AtomicU64,
    persistent_hits: AtomicU64,
    shared_loads: AtomicU64,
    preloads: AtomicU64,
    load_errors: AtomicU64,
    load_micros: AtomicU64,
    comparisons: AtomicU64,
    comparison_micros: AtomicU64,
}

fn add_elapsed(counter: &AtomicU64, started: Instant) {
    counter.fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
}

fn micros_to_ms(micros: u64) -> f64 {
    micros as f64 / 1000.0
}

fn average(total_ms: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total_ms / count as f64
    }
}

/// Cumulative cache counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Demand loads that missed memory (persistent or source reads).
    pub loads: u64,
    pub cache_hits: u64,
    pub persistent_hits: u64,
    /// Requests that joined a load already in flight.
    pub shared_loads: u64,
    pub preloads: u64,
    pub load_errors: u64,
    pub total_load_time_ms: f64,
    pub average_load_time_ms: f64,
    pub comparisons: u64,
    pub total_comparison_time_ms: f64,
    pub average_comparison_time_ms: f64,
    pub comparison_pool: Option<ComparisonPoolStats>,
}

/// Point-in-time cache occupancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub entries: usize,
    pub size_bytes: u64,
    pub max_size_bytes: u64,
    pub utilization: f64,
    pub preload_queue: usize,
    pub active_preloads: usize,
    pub inflight_loads: usize,
    pub lazy_loading: bool,
    pub worker_pool: bool,
    pub cache_dir: PathBuf,
}

struct CacheInner {
    config: CacheConfig,
    memory: Mutex<MemoryCache>,
    inflight: Mutex<HashMap<String, SharedLoad>>,
    preload: Mutex<PreloadQueue>,
    store: DiskStore,
    source: Arc<dyn BaselineSource>,
    sequence: Arc<dyn BaselineSequence>,
    comparator: Arc<dyn ImageComparator>,
    pool: Option<ComparisonPool>,
    counters: Counters,
    cancel: CancellationToken,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to the baseline cache. Cheap to clone.
#[derive(Clone)]
pub struct BaselineCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for BaselineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaselineCache")
            .field("cache_dir", &self.inner.store.dir())
            .field("worker_pool", &self.inner.pool.is_some())
            .finish()
    }
}

pub struct BaselineCacheBuilder {
    config: CacheConfig,
    source: Arc<dyn BaselineSource>,
    sequence: Arc<dyn BaselineSequence>,
    comparator: Arc<dyn ImageComparator>,
}

impl BaselineCacheBuilder {
    pub fn source(mut self, source: Arc<dyn BaselineSource>) -> Self {
        self.source = source;
        self
    }

    pub fn sequence(mut self, sequence: Arc<dyn BaselineSequence>) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn comparator(mut self, comparator: Arc<dyn ImageComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Build the cache and start its background maintenance.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<BaselineCache> {
        let config = self.config;
        let store = DiskStore::new(config.resolved_cache_dir()?);

        let pool = if config.use_worker_pool {
            Some(ComparisonPool::new(
                config.comparison.max_workers,
                config.comparison.timeout(),
                Arc::clone(&self.comparator),
            )?)
        } else {
            None
        };

        let inner = Arc::new(CacheInner {
            memory: Mutex::new(MemoryCache::new(config.max_cache_size)),
            inflight: Mutex::new(HashMap::new()),
            preload: Mutex::new(PreloadQueue::default()),
            store,
            source: self.source,
            sequence: self.sequence,
            comparator: self.comparator,
            pool,
            counters: Counters::default(),
            cancel: CancellationToken::new(),
            config,
        });

        tokio::spawn(maintenance(
            Arc::downgrade(&inner),
            inner.cancel.clone(),
            inner.config.preload_interval(),
            inner.config.sweep_interval(),
            inner.config.max_entry_age(),
        ));

        info!(
            cache_dir = %inner.store.dir().display(),
            max_cache_size = inner.config.max_cache_size,
            worker_pool = inner.pool.is_some(),
            "Baseline cache started"
        );

        Ok(BaselineCache { inner })
    }
}

impl BaselineCache {
    pub fn builder(config: CacheConfig) -> BaselineCacheBuilder {
        BaselineCacheBuilder {
            config,
            source: Arc::new(FsSource),
            sequence: Arc::new(NumericSuffixSequence),
            comparator: Arc::new(ByteDiffComparator::default()),
        }
    }

    /// Cache reading from the filesystem with the default comparator.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Options carrying the configured comparison threshold.
    pub fn default_options(&self) -> CompareOptions {
        CompareOptions::with_threshold(self.inner.config.comparison_threshold)
    }

    /// Resolve the bytes of baseline `id`, reading `path` on a full miss.
    pub async fn load_baseline(&self, id: &str, path: impl AsRef<Path>) -> LoadResult {
        match lookup(&self.inner, id, path.as_ref(), Origin::Demand) {
            Lookup::Hit(data) => Ok(data),
            Lookup::Load(load) => load.await,
        }
    }

    /// Compare `current` against baseline `id`.
    ///
    /// In progressive mode a quick pass runs first and is returned as is
    /// when its difference exceeds twice the threshold.
    pub async fn compare_images(
        &self,
        id: &str,
        path: impl AsRef<Path>,
        current: Vec<u8>,
        options: CompareOptions,
    ) -> Result<ComparisonReport> {
        let started = Instant::now();
        let baseline = self.load_baseline(id, path).await?;
        let current = Arc::new(current);

        let report = if self.inner.config.progressive {
            let mut quick = self
                .run_comparison(
                    Arc::clone(&baseline),
                    Arc::clone(&current),
                    options.at(Fidelity::Quick),
                )
                .await?;
            if quick.difference > 2.0 * options.threshold {
                debug!(id, difference = quick.difference, "Quick pass conclusive");
                quick.details.short_circuited = true;
                quick
            } else {
                self.run_comparison(baseline, current, options.at(Fidelity::Full))
                    .await?
            }
        } else {
            self.run_comparison(baseline, current, options.at(Fidelity::Full))
                .await?
        };

        self.inner.counters.comparisons.fetch_add(1, Ordering::Relaxed);
        add_elapsed(&self.inner.counters.comparison_micros, started);
        debug!(
            id,
            difference = report.difference,
            passed = report.passed,
            method = ?report.method,
            "Comparison finished"
        );
        Ok(report)
    }

    async fn run_comparison(
        &self,
        baseline: Arc<Vec<u8>>,
        current: Arc<Vec<u8>>,
        options: CompareOptions,
    ) -> Result<ComparisonReport> {
        if let Some(pool) = &self.inner.pool {
            return Ok(pool.compare(baseline, current, options).await?);
        }

        let comparator = Arc::clone(&self.inner.comparator);
        let limit = self.inner.config.comparison.timeout();
        blocking_with_timeout(limit, move || {
            Ok(run_comparison(
                comparator.as_ref(),
                &baseline,
                &current,
                &options,
                ComparisonMethod::InProcess,
            ))
        })
        .await
        .map_err(|e| match e {
            Error::Timeout(after) => CacheError::ComparisonTimeout(after).into(),
            other => other,
        })
    }

    /// Drop every cached baseline, in memory and on disk, and forget queued
    /// preloads. Loads already running are left to finish.
    pub async fn clear_cache(&self) -> Result<()> {
        lock(&self.inner.memory).clear();
        lock(&self.inner.preload).queue.clear();
        let removed = self
            .inner
            .store
            .clear()
            .await
            .map_err(|e| CacheError::Persist(e.to_string()))?;
        info!(removed, "Baseline cache cleared");
        Ok(())
    }

    pub fn metrics(&self) -> CacheMetrics {
        let c = &self.inner.counters;
        let loads = c.loads.load(Ordering::Relaxed);
        let comparisons = c.comparisons.load(Ordering::Relaxed);
        let total_load_time_ms = micros_to_ms(c.load_micros.load(Ordering::Relaxed));
        let total_comparison_time_ms = micros_to_ms(c.comparison_micros.load(Ordering::Relaxed));

        CacheMetrics {
            loads,
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            persistent_hits: c.persistent_hits.load(Ordering::Relaxed),
            shared_loads: c.shared_loads.load(Ordering::Relaxed),
            preloads: c.preloads.load(Ordering::Relaxed),
            load_errors: c.load_errors.load(Ordering::Relaxed),
            total_load_time_ms,
            average_load_time_ms: average(total_load_time_ms, loads),
            comparisons,
            total_comparison_time_ms,
            average_comparison_time_ms: average(total_comparison_time_ms, comparisons),
            comparison_pool: self.inner.pool.as_ref().map(ComparisonPool::stats),
        }
    }

    pub fn status(&self) -> CacheStatus {
        let (entries, size_bytes, max_size_bytes) = {
            let memory = lock(&self.inner.memory);
            (memory.len(), memory.total_size(), memory.max_size())
        };
        let (preload_queue, active_preloads) = {
            let preload = lock(&self.inner.preload);
            (preload.queue.len(), preload.active)
        };

        CacheStatus {
            entries,
            size_bytes,
            max_size_bytes,
            utilization: if max_size_bytes == 0 {
                0.0
            } else {
                size_bytes as f64 / max_size_bytes as f64
            },
            preload_queue,
            active_preloads,
            inflight_loads: lock(&self.inner.inflight).len(),
            lazy_loading: self.inner.config.enable_lazy_loading,
            worker_pool: self.inner.pool.is_some(),
            cache_dir: self.inner.store.dir().to_path_buf(),
        }
    }

    /// Whether `id` is currently held in memory.
    pub fn is_cached(&self, id: &str) -> bool {
        lock(&self.inner.memory).contains(id)
    }

    /// Stop background maintenance and the comparison pool.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        lock(&self.inner.preload).queue.clear();
        if let Some(pool) = &self.inner.pool {
            pool.shutdown();
        }
        debug!("Baseline cache shut down");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Memory hit, join of an in-flight load, or a freshly started load.
///
/// Lock order is inflight before memory.
fn lookup(inner: &Arc<CacheInner>, id: &str, path: &Path, origin: Origin) -> Lookup {
    if let Some(data) = lock(&inner.memory).get(id) {
        inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        return Lookup::Hit(data);
    }

    let mut inflight = lock(&inner.inflight);
    if let Some(data) = lock(&inner.memory).get(id) {
        inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        return Lookup::Hit(data);
    }
    if let Some(existing) = inflight.get(id) {
        inner.counters.shared_loads.fetch_add(1, Ordering::Relaxed);
        return Lookup::Load(existing.clone());
    }

    // The load runs on its own task so it completes and leaves the in-flight
    // map even when every waiter is dropped.
    let handle = tokio::spawn(load_uncached(
        Arc::clone(inner),
        id.to_string(),
        path.to_path_buf(),
        origin,
    ));
    let failed_id = id.to_string();
    let load = async move {
        handle.await.unwrap_or_else(|e| {
            Err(CacheError::Read {
                id: failed_id,
                message: format!("load task failed: {e}"),
            })
        })
    }
    .boxed()
    .shared();
    inflight.insert(id.to_string(), load.clone());
    Lookup::Load(load)
}

async fn load_uncached(
    inner: Arc<CacheInner>,
    id: String,
    path: PathBuf,
    origin: Origin,
) -> LoadResult {
    let started = Instant::now();
    if origin == Origin::Demand {
        inner.counters.loads.fetch_add(1, Ordering::Relaxed);
    }

    let limit = inner.config.load_timeout();
    let result = match timeout(limit, fetch(&inner, &id, &path)).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::LoadTimeout {
            id: id.clone(),
            timeout: limit,
        }),
    };

    match &result {
        Ok(data) => {
            let evicted = lock(&inner.memory).insert(id.clone(), Arc::clone(data));
            if !evicted.is_empty() {
                debug!(count = evicted.len(), "Evicted baselines to stay within size bound");
            }
            debug!(id = %id, bytes = data.len(), ?origin, "Baseline loaded");
        }
        Err(e) if origin == Origin::Demand => {
            inner.counters.load_errors.fetch_add(1, Ordering::Relaxed);
            warn!(id = %id, error = %e, "Baseline load failed");
        }
        // Reported by the preload task.
        Err(_) => {}
    }
    if origin == Origin::Demand {
        add_elapsed(&inner.counters.load_micros, started);
    }
    lock(&inner.inflight).remove(&id);

    if result.is_ok() && origin == Origin::Demand {
        schedule_preloads(&inner, &id, &path);
    }
    result
}

async fn fetch(inner: &CacheInner, id: &str, path: &Path) -> LoadResult {
    if let Some(bytes) = inner.store.read(id).await {
        inner.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
        return Ok(Arc::new(bytes));
    }

    let bytes = inner
        .source
        .read(path)
        .await
        .map_err(|e| CacheError::from_io(id, path, &e))?;

    if let Err(e) = inner.store.write(id, &bytes).await {
        warn!(id, error = %e, "Failed to persist baseline");
    }
    Ok(Arc::new(bytes))
}

fn schedule_preloads(inner: &CacheInner, id: &str, path: &Path) {
    let distance = inner.config.preload_distance;
    if !inner.config.enable_lazy_loading || distance == 0 || inner.cancel.is_cancelled() {
        return;
    }

    let candidates: Vec<(String, PathBuf)> = inner
        .sequence
        .successors(id, path, distance)
        .into_iter()
        .filter(|(next, _)| !lock(&inner.inflight).contains_key(next))
        .filter(|(next, _)| !lock(&inner.memory).contains(next))
        .collect();

    let mut preload = lock(&inner.preload);
    let mut queued = 0;
    for (next, next_path) in candidates {
        if preload.queue.iter().any(|(queued_id, _)| *queued_id == next) {
            continue;
        }
        preload.queue.push_back((next, next_path));
        queued += 1;
    }
    if queued > 0 {
        debug!(id, queued, "Queued baseline preloads");
    }
}

/// Start queued preloads up to the concurrency limit.
fn drain_preloads(inner: &Arc<CacheInner>) {
    let limit = inner.config.max_concurrent_loads.max(1);
    loop {
        let next = {
            let mut preload = lock(&inner.preload);
            if preload.active >= limit {
                None
            } else {
                let job = preload.queue.pop_front();
                if job.is_some() {
                    preload.active += 1;
                }
                job
            }
        };
        let Some((id, path)) = next else {
            break;
        };

        let skip = lock(&inner.inflight).contains_key(&id) || lock(&inner.memory).contains(&id);
        if skip {
            lock(&inner.preload).active -= 1;
            continue;
        }

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let result = match lookup(&inner, &id, &path, Origin::Preload) {
                Lookup::Hit(_) => Ok(()),
                Lookup::Load(load) => load.await.map(|_| ()),
            };
            match result {
                Ok(()) => {
                    inner.counters.preloads.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => debug!(id = %id, error = %e, "Preload dropped"),
            }
            lock(&inner.preload).active -= 1;
        });
    }
}

async fn maintenance(
    cache: Weak<CacheInner>,
    cancel: CancellationToken,
    preload_every: Duration,
    sweep_every: Duration,
    max_age: Duration,
) {
    let mut preload_tick = interval(preload_every);
    preload_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep_tick = interval(sweep_every);
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of an interval completes immediately.
    sweep_tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = preload_tick.tick() => {
                let Some(inner) = cache.upgrade() else { break };
                drain_preloads(&inner);
            }
            _ = sweep_tick.tick() => {
                let Some(inner) = cache.upgrade() else { break };
                let removed = lock(&inner.memory).sweep_expired(max_age, Instant::now());
                if !removed.is_empty() {
                    debug!(count = removed.len(), "Swept expired baselines");
                }
            }
        }
    }
    debug!("Baseline cache maintenance stopped");
}
