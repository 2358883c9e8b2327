//! Resource sampling for adaptive scheduling.
//!
//! The coordinator records a [`ResourceSample`] on every sample tick and
//! consults a fresh one before each dispatch. Only memory pressure drives
//! scheduling decisions; CPU load is kept for reporting.

use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of samples retained by [`ResourceMonitor`].
pub const SAMPLE_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    /// Used / total memory, `0.0..=1.0`.
    pub memory: f64,
    /// Load average over available cores, clamped to `0.0..=1.0`.
    pub cpu: f64,
}

impl ResourceSample {
    pub fn new(memory: f64, cpu: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            memory: memory.clamp(0.0, 1.0),
            cpu: cpu.clamp(0.0, 1.0),
        }
    }
}

pub trait ResourceProbe: Send + Sync + 'static {
    fn sample(&self) -> ResourceSample;
}

/// Reads `/proc/meminfo` and `/proc/loadavg`.
///
/// Reports zero pressure where those files are unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceSample {
        let memory = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| memory_pressure(&content))
            .unwrap_or(0.0);

        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        let cpu = fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|content| content.split_whitespace().next()?.parse::<f64>().ok())
            .map(|load| load / cores)
            .unwrap_or(0.0);

        ResourceSample::new(memory, cpu)
    }
}

fn meminfo_kb(content: &str, key: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with(key))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

fn memory_pressure(meminfo: &str) -> Option<f64> {
    let total = meminfo_kb(meminfo, "MemTotal:")?;
    let available = meminfo_kb(meminfo, "MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some(total.saturating_sub(available) as f64 / total as f64)
}

/// Probe returning fixed, adjustable values.
#[derive(Debug, Default)]
pub struct StaticProbe {
    memory: AtomicU64,
    cpu: AtomicU64,
}

impl StaticProbe {
    pub fn new(memory: f64, cpu: f64) -> Self {
        Self {
            memory: AtomicU64::new(memory.to_bits()),
            cpu: AtomicU64::new(cpu.to_bits()),
        }
    }

    pub fn set_memory(&self, memory: f64) {
        self.memory.store(memory.to_bits(), Ordering::SeqCst);
    }

    pub fn set_cpu(&self, cpu: f64) {
        self.cpu.store(cpu.to_bits(), Ordering::SeqCst);
    }
}

impl ResourceProbe for StaticProbe {
    fn sample(&self) -> ResourceSample {
        ResourceSample::new(
            f64::from_bits(self.memory.load(Ordering::SeqCst)),
            f64::from_bits(self.cpu.load(Ordering::SeqCst)),
        )
    }
}

/// Aggregates over the retained samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub samples: usize,
    pub latest: Option<ResourceSample>,
    pub average_memory: f64,
    pub average_cpu: f64,
    pub peak_memory: f64,
}

/// Ring buffer of the most recent samples.
#[derive(Debug)]
pub struct ResourceMonitor {
    samples: VecDeque<ResourceSample>,
    capacity: usize,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(SAMPLE_CAPACITY)
    }
}

impl ResourceMonitor {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, sample: ResourceSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&ResourceSample> {
        self.samples.back()
    }

    /// The latest sample, if it is no older than `max_age`.
    pub fn fresh(&self, max_age: Duration) -> Option<&ResourceSample> {
        let latest = self.samples.back()?;
        let age = Utc::now().signed_duration_since(latest.timestamp);
        // A negative age (clock stepped back) counts as fresh.
        age.to_std().map_or(true, |age| age <= max_age).then_some(latest)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn metrics(&self) -> ResourceMetrics {
        let n = self.samples.len();
        let (memory_sum, cpu_sum, peak) = self
            .samples
            .iter()
            .fold((0.0, 0.0, 0.0_f64), |(m, c, p), s| {
                (m + s.memory, c + s.cpu, p.max(s.memory))
            });
        let mean = |sum: f64| if n == 0 { 0.0 } else { sum / n as f64 };

        ResourceMetrics {
            samples: n,
            latest: self.latest().cloned(),
            average_memory: mean(memory_sum),
            average_cpu: mean(cpu_sum),
            peak_memory: peak,
        }
    }
}

/// Shrink the dispatch batch as memory pressure rises.
pub fn adaptive_batch_size(base: usize, memory: f64) -> usize {
    let base = base.max(1);
    if memory > 0.9 {
        1
    } else if memory > 0.8 {
        (base / 3).max(1)
    } else if memory > 0.7 {
        (base / 2).max(1)
    } else {
        base
    }
}
