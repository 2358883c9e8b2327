//! Dedicated thread pool for comparisons.
//!
//! Comparisons are CPU bound, so they run on plain OS threads rather than
//! on the async runtime. Each thread takes one job at a time from a shared
//! crossbeam queue. A job carries a generated [`ComparisonId`]; the thread
//! resolves the waiting caller registered under that id. Callers give up
//! after the configured timeout and the late result is discarded.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::comparison::executor::{
    run_comparison, CompareOptions, ComparisonMethod, ComparisonReport, ImageComparator,
};
use crate::error::CacheError;

/// Correlates a queued comparison with its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComparisonId(pub Uuid);

impl ComparisonId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ComparisonId {
    fn default() -> Self {
        Self::new()
    }
}

struct Job {
    id: ComparisonId,
    baseline: Arc<Vec<u8>>,
    current: Arc<Vec<u8>>,
    options: CompareOptions,
}

type Pending = Arc<Mutex<HashMap<ComparisonId, oneshot::Sender<ComparisonReport>>>>;

/// Cumulative counters written by pool threads.
#[derive(Debug, Default)]
struct PoolStats {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    total_micros: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonPoolStats {
    pub workers: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub total_time_ms: f64,
    pub average_time_ms: f64,
    pub outstanding: usize,
}

pub struct ComparisonPool {
    jobs: Mutex<Option<Sender<Job>>>,
    pending: Pending,
    stats: Arc<PoolStats>,
    timeout: Duration,
    workers: usize,
}

impl ComparisonPool {
    /// Spawn `workers` comparison threads (at least one).
    pub fn new(
        workers: usize,
        timeout: Duration,
        comparator: Arc<dyn ImageComparator>,
    ) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let stats = Arc::new(PoolStats::default());

        for index in 0..workers {
            let rx = rx.clone();
            let pending = Arc::clone(&pending);
            let stats = Arc::clone(&stats);
            let comparator = Arc::clone(&comparator);
            thread::Builder::new()
                .name(format!("verity-compare-{index}"))
                .spawn(move || worker_loop(index, rx, pending, stats, comparator))?;
        }

        debug!(workers, timeout_ms = timeout.as_millis() as u64, "Comparison pool started");

        Ok(Self {
            jobs: Mutex::new(Some(tx)),
            pending,
            stats,
            timeout,
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queue a comparison and wait for its report.
    ///
    /// # Errors
    /// - [`CacheError::ComparisonTimeout`] if no report arrives in time
    /// - [`CacheError::ComparisonFailed`] if the comparator panicked
    /// - [`CacheError::PoolClosed`] after [`shutdown`](Self::shutdown)
    pub async fn compare(
        &self,
        baseline: Arc<Vec<u8>>,
        current: Arc<Vec<u8>>,
        options: CompareOptions,
    ) -> Result<ComparisonReport, CacheError> {
        let id = ComparisonId::new();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let sent = match lock(&self.jobs).as_ref() {
            Some(jobs) => jobs
                .send(Job {
                    id,
                    baseline,
                    current,
                    options,
                })
                .is_ok(),
            None => false,
        };
        if !sent {
            lock(&self.pending).remove(&id);
            return Err(CacheError::PoolClosed);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(_)) => Err(CacheError::ComparisonFailed(
                "comparison worker dropped the request".to_string(),
            )),
            Err(_) => {
                lock(&self.pending).remove(&id);
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Comparison timed out");
                Err(CacheError::ComparisonTimeout(self.timeout))
            }
        }
    }

    pub fn stats(&self) -> ComparisonPoolStats {
        let completed = self.stats.completed.load(Ordering::Relaxed);
        let total_time_ms = self.stats.total_micros.load(Ordering::Relaxed) as f64 / 1000.0;
        ComparisonPoolStats {
            workers: self.workers,
            completed,
            failed: self.stats.failed.load(Ordering::Relaxed),
            timed_out: self.stats.timed_out.load(Ordering::Relaxed),
            total_time_ms,
            average_time_ms: if completed == 0 {
                0.0
            } else {
                total_time_ms / completed as f64
            },
            outstanding: lock(&self.pending).len(),
        }
    }

    /// Stop accepting work. Threads exit once the queue drains.
    pub fn shutdown(&self) {
        if lock(&self.jobs).take().is_some() {
            debug!("Comparison pool shut down");
        }
    }
}

impl Drop for ComparisonPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    index: usize,
    jobs: Receiver<Job>,
    pending: Pending,
    stats: Arc<PoolStats>,
    comparator: Arc<dyn ImageComparator>,
) {
    while let Ok(job) = jobs.recv() {
        let started = Instant::now();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            run_comparison(
                comparator.as_ref(),
                &job.baseline,
                &job.current,
                &job.options,
                ComparisonMethod::WorkerPool,
            )
        }));
        let reply = lock(&pending).remove(&job.id);

        match outcome {
            Ok(report) => {
                stats.completed.fetch_add(1, Ordering::Relaxed);
                stats
                    .total_micros
                    .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(report);
                    }
                    None => debug!(worker = index, "Discarding late comparison result"),
                }
            }
            Err(_) => {
                // Dropping `reply` wakes the caller with an error.
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(worker = index, "Comparator panicked");
            }
        }
    }
    debug!(worker = index, "Comparison worker exiting");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
