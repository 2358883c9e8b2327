use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

/// Upper bound on the default worker count regardless of core count.
pub const MAX_DEFAULT_WORKERS: usize = 8;

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_WORKERS)
}

/// Settings for the task coordinator and its worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub max_workers: usize,
    pub worker_timeout_ms: u64,
    pub batch_size: usize,
    pub memory_threshold: f64,
    /// Reported in summaries; scheduling only consults memory pressure.
    pub cpu_threshold: f64,
    pub adaptive_scaling: bool,
    /// Scheduling cadence. Inbound worker messages also wake the loop.
    pub tick_interval_ms: u64,
    pub sample_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            worker_timeout_ms: 30_000,
            batch_size: 5,
            memory_threshold: 0.8,
            cpu_threshold: 0.7,
            adaptive_scaling: true,
            tick_interval_ms: 100,
            sample_interval_ms: 1_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

/// Settings for the baseline cache and its comparison pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enable_lazy_loading: bool,
    pub preload_distance: usize,
    pub max_concurrent_loads: usize,
    pub load_timeout_ms: u64,
    /// Aggregate byte bound for the memory cache.
    pub max_cache_size: u64,
    pub comparison_threshold: f64,
    /// Persistent cache location. `None` resolves to `~/.verity/baselines`.
    pub cache_dir: Option<PathBuf>,
    pub use_worker_pool: bool,
    pub progressive: bool,
    pub preload_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub max_entry_age_secs: u64,
    pub comparison: ComparisonConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable_lazy_loading: true,
            preload_distance: 3,
            max_concurrent_loads: 2,
            load_timeout_ms: 5_000,
            max_cache_size: 50 * 1024 * 1024,
            comparison_threshold: 0.1,
            cache_dir: None,
            use_worker_pool: true,
            progressive: false,
            preload_interval_ms: 100,
            sweep_interval_ms: 60_000,
            max_entry_age_secs: 24 * 60 * 60,
            comparison: ComparisonConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn preload_interval(&self) -> Duration {
        Duration::from_millis(self.preload_interval_ms.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn max_entry_age(&self) -> Duration {
        Duration::from_secs(self.max_entry_age_secs)
    }

    pub fn resolved_cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(expand_tilde(&dir.to_string_lossy())),
            None => Ok(Config::verity_dir()?.join("baselines")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    pub max_workers: usize,
    pub timeout_ms: u64,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            timeout_ms: 5_000,
        }
    }
}

impl ComparisonConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    pub fn verity_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".verity"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::verity_dir()?.join("verity.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            max_workers = config.coordinator.max_workers,
            max_cache_size = config.cache.max_cache_size,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::verity_dir()?;
        if !dir.exists() {
            debug!(dir = %dir.display(), "Creating verity directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
