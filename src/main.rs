use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use verity::baseline::BaselineCache;
use verity::comparison::CompareOptions;
use verity::config::Config;
use verity::core::BatchDescriptor;
use verity::handlers::HandlerRegistry;
use verity::orchestration::TaskCoordinator;
use verity::util::blocking;
use verity::Result;

/// Verity - parallel verification runner with a lazy baseline cache
#[derive(Parser, Debug)]
#[command(name = "verity")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    VERITY_DEBUG=1     Enable debug logging (alternative to --debug)\n    VERITY_LOG=<filter>  Tracing filter directive (overrides both)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.verity/verity.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file to use instead of ~/.verity/verity.toml
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a plan: a JSON array of tasks whose dependencies are array positions
    Run {
        plan: PathBuf,

        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Compare a current image against a cached baseline
    Compare {
        #[arg(long)]
        baseline_id: String,

        #[arg(long)]
        baseline: PathBuf,

        #[arg(long)]
        current: PathBuf,

        /// Maximum tolerated difference ratio
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Delete all persisted baselines
    ClearCache,

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    verity::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if cli.debug {
        info!("Verity starting (debug mode enabled)");
    } else {
        info!("Verity starting");
    }

    match cli.command {
        Command::Run { plan, workers } => run_plan(config, plan, workers),
        Command::Compare {
            baseline_id,
            baseline,
            current,
            threshold,
        } => run_compare(config, baseline_id, baseline, current, threshold),
        Command::ClearCache => run_clear_cache(config),
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Run every task in the plan to completion and print summary and results as JSON.
fn run_plan(mut config: Config, plan: PathBuf, workers: Option<usize>) -> Result<()> {
    if let Some(workers) = workers {
        config.coordinator.max_workers = workers;
    }

    let rt = tokio::runtime::Runtime::new()?;
    let output = rt.block_on(async move {
        let descriptors: Vec<BatchDescriptor> = blocking(move || {
            let text = std::fs::read_to_string(&plan)?;
            Ok(serde_json::from_str(&text)?)
        })
        .await?;

        let cache = BaselineCache::new(config.cache.clone())?;
        let registry = HandlerRegistry::builtin(Some(cache.clone()));
        let coordinator = TaskCoordinator::new(config.coordinator.clone(), registry);

        let ids = coordinator.add_tasks(descriptors).await?;
        info!(tasks = ids.len(), "Plan submitted");

        let summary = coordinator.start().await?.wait().await?;
        let results = coordinator.task_results().await;
        cache.shutdown();

        if summary.failed > 0 {
            warn!(failed = summary.failed, "Plan finished with failures");
        }

        Ok::<_, verity::Error>(serde_json::json!({
            "summary": summary,
            "results": results,
            "cache": cache.metrics(),
        }))
    })?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_compare(
    config: Config,
    baseline_id: String,
    baseline: PathBuf,
    current: PathBuf,
    threshold: Option<f64>,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async move {
        let cache = BaselineCache::new(config.cache)?;
        let current = tokio::fs::read(&current).await?;
        let options = match threshold {
            Some(threshold) => CompareOptions::with_threshold(threshold),
            None => cache.default_options(),
        };
        let report = cache
            .compare_images(&baseline_id, &baseline, current, options)
            .await;
        cache.shutdown();
        report
    })?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed {
        std::process::exit(1);
    }
    Ok(())
}

fn run_clear_cache(config: Config) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let cache = BaselineCache::new(config.cache)?;
        let dir = cache.status().cache_dir;
        cache.clear_cache().await?;
        cache.shutdown();
        println!("Cleared baselines in {}", dir.display());
        Ok::<_, verity::Error>(())
    })
}
