//! Runtime configuration for stream-read-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Cache budgets use the option names `TotalCacheSize`, `TargetBurstCacheSize`
//! and `CorrelatedReferenceTimeoutInSeconds`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::cache::read_cache::{validate_budgets, CacheError};

/// Command-line arguments for the workload simulator.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "read-cache-sim",
    about = "Replay a hot-set plus sequential-scan workload against the read cache"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Override TotalCacheSize (bytes).
    #[arg(long)]
    pub total_cache_size: Option<u64>,

    /// Override TargetBurstCacheSize (bytes).
    #[arg(long)]
    pub burst_cache_size: Option<u64>,

    /// Override CorrelatedReferenceTimeoutInSeconds.
    #[arg(long)]
    pub correlated_timeout: Option<u32>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Apply command-line overrides on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(total) = self.total_cache_size {
            config.cache.total_cache_size = total;
        }
        if let Some(burst) = self.burst_cache_size {
            config.cache.target_burst_cache_size = burst;
        }
        if let Some(timeout) = self.correlated_timeout {
            config.cache.correlated_reference_timeout_in_seconds = timeout;
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Read cache budgets.
    pub cache: CacheConfig,

    /// Simulated workload shape.
    pub workload: WorkloadConfig,
}

/// Read cache budgets and reference tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CacheConfig {
    /// Upper bound on cached bytes.
    pub total_cache_size: u64,

    /// Upper bound on bytes held by ranges referenced only once.
    pub target_burst_cache_size: u64,

    /// References closer together than this count once (0 = off).
    pub correlated_reference_timeout_in_seconds: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            total_cache_size: 256 * 1024 * 1024, // 256 MB
            target_burst_cache_size: 64 * 1024 * 1024, // 64 MB
            correlated_reference_timeout_in_seconds: 0,
        }
    }
}

impl CacheConfig {
    /// Reject a burst budget larger than the total budget.
    pub fn validate(&self) -> Result<(), CacheError> {
        validate_budgets(self.total_cache_size, self.target_burst_cache_size)
    }

    pub fn correlation_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.correlated_reference_timeout_in_seconds))
    }
}

/// Shape of the simulated workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Bytes per cached block.
    pub block_size: u64,

    /// Blocks re-read every round.
    pub hot_blocks: u64,

    /// Fresh blocks read once per round.
    pub scan_blocks: u64,

    /// Number of rounds.
    pub rounds: u32,

    /// Hot blocks watched with eviction subscriptions.
    pub subscriptions: usize,

    /// Simulated time between two reads.
    pub read_interval_ms: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            hot_blocks: 256,
            scan_blocks: 4096,
            rounds: 8,
            subscriptions: 16,
            read_interval_ms: 2,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
