//! The comparison contract.
//!
//! An [`ImageComparator`] takes a baseline buffer, a current buffer and
//! options and returns a normalized difference. It is treated as opaque by
//! everything above it; [`ByteDiffComparator`] is the default implementation
//! and compares raw bytes position by position.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Default pass/fail threshold on the normalized difference.
pub const DEFAULT_THRESHOLD: f64 = 0.1;

/// Stride used by the quick pass of [`ByteDiffComparator`].
pub const QUICK_STRIDE: usize = 16;

/// How thoroughly to compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fidelity {
    /// Cheap sampled pass used for progressive short-circuiting.
    Quick,
    #[default]
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompareOptions {
    pub threshold: f64,
    #[serde(default)]
    pub fidelity: Fidelity,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            fidelity: Fidelity::Full,
        }
    }
}

impl CompareOptions {
    pub fn with_threshold(threshold: f64) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }

    pub fn at(self, fidelity: Fidelity) -> Self {
        Self { fidelity, ..self }
    }
}

/// Raw output of a comparator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffOutcome {
    /// Normalized to `0.0..=1.0`.
    pub difference: f64,
    pub pixels_compared: u64,
}

pub trait ImageComparator: Send + Sync + 'static {
    fn compare(&self, baseline: &[u8], current: &[u8], options: &CompareOptions) -> DiffOutcome;

    fn name(&self) -> &'static str;
}

/// Position-wise byte comparison.
///
/// Bytes past the end of the shorter buffer count as differing, so a size
/// mismatch always shows up in the score. Four bytes are counted as one
/// pixel for the pixel estimate.
#[derive(Debug, Clone, Copy)]
pub struct ByteDiffComparator {
    pub quick_stride: usize,
}

impl Default for ByteDiffComparator {
    fn default() -> Self {
        Self {
            quick_stride: QUICK_STRIDE,
        }
    }
}

impl ImageComparator for ByteDiffComparator {
    fn compare(&self, baseline: &[u8], current: &[u8], options: &CompareOptions) -> DiffOutcome {
        let len = baseline.len().max(current.len());
        if len == 0 {
            return DiffOutcome {
                difference: 0.0,
                pixels_compared: 0,
            };
        }

        let stride = match options.fidelity {
            Fidelity::Quick => self.quick_stride.max(1),
            Fidelity::Full => 1,
        };

        let mut sampled: u64 = 0;
        let mut differing: u64 = 0;
        for i in (0..len).step_by(stride) {
            sampled += 1;
            if baseline.get(i) != current.get(i) {
                differing += 1;
            }
        }

        DiffOutcome {
            difference: differing as f64 / sampled as f64,
            pixels_compared: sampled.div_ceil(4),
        }
    }

    fn name(&self) -> &'static str {
        "byte_diff"
    }
}

/// Where a comparison ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonMethod {
    InProcess,
    WorkerPool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonDetails {
    pub comparator: String,
    pub fidelity: Fidelity,
    pub threshold: f64,
    pub baseline_size: u64,
    pub current_size: u64,
    /// `current_size - baseline_size`.
    pub size_delta: i64,
    pub execution_time_ms: f64,
    /// Set when a quick progressive pass was conclusive.
    #[serde(default)]
    pub short_circuited: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub difference: f64,
    pub pixels_compared: u64,
    pub method: ComparisonMethod,
    pub passed: bool,
    pub details: ComparisonDetails,
}

/// Run a comparator and wrap its outcome into a report.
pub fn run_comparison(
    comparator: &dyn ImageComparator,
    baseline: &[u8],
    current: &[u8],
    options: &CompareOptions,
    method: ComparisonMethod,
) -> ComparisonReport {
    let started = Instant::now();
    let outcome = comparator.compare(baseline, current, options);
    let execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;

    ComparisonReport {
        difference: outcome.difference,
        pixels_compared: outcome.pixels_compared,
        method,
        passed: outcome.difference <= options.threshold,
        details: ComparisonDetails {
            comparator: comparator.name().to_string(),
            fidelity: options.fidelity,
            threshold: options.threshold,
            baseline_size: baseline.len() as u64,
            current_size: current.len() as u64,
            size_delta: current.len() as i64 - baseline.len() as i64,
            execution_time_ms,
            short_circuited: false,
        },
    }
}
