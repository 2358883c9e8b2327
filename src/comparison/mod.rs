//! Image comparison: the comparator contract and its worker pool.

pub mod executor;
pub mod pool;

pub use executor::{
    run_comparison, ByteDiffComparator, CompareOptions, ComparisonDetails, ComparisonMethod,
    ComparisonReport, DiffOutcome, Fidelity, ImageComparator, DEFAULT_THRESHOLD,
};
pub use pool::{ComparisonId, ComparisonPool, ComparisonPoolStats};
