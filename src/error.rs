use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Unknown dependency: {0}")]
    UnknownDependency(TaskId),

    #[error("Batch entry {index} references position {reference}, batch has {len} entries")]
    InvalidBatchReference {
        index: usize,
        reference: usize,
        len: usize,
    },

    #[error("Dependency cycle detected at task: {0}")]
    DependencyCycle(TaskId),

    #[error("Coordinator is already running")]
    AlreadyRunning,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the baseline cache and the comparison pool.
///
/// Cloneable so a single in-flight load can hand the same outcome to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Baseline {id} not found at {}", path.display())]
    NotFound { id: String, path: PathBuf },

    #[error("Failed to read baseline {id}: {message}")]
    Read { id: String, message: String },

    #[error("Loading baseline {id} timed out after {timeout:?}")]
    LoadTimeout { id: String, timeout: Duration },

    #[error("Comparison timed out after {0:?}")]
    ComparisonTimeout(Duration),

    #[error("Comparison failed: {0}")]
    ComparisonFailed(String),

    #[error("Comparison pool is shut down")]
    PoolClosed,

    #[error("Persistent cache error: {0}")]
    Persist(String),
}

impl CacheError {
    /// Classify an IO failure encountered while reading a baseline.
    pub fn from_io(id: &str, path: &std::path::Path, err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            CacheError::NotFound {
                id: id.to_string(),
                path: path.to_path_buf(),
            }
        } else {
            CacheError::Read {
                id: id.to_string(),
                message: err.to_string(),
            }
        }
    }
}
