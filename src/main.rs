//! read-cache-sim: replay a synthetic read workload against the read cache.
//!
//! Each round re-reads a hot set of blocks from one stream and sweeps a long
//! sequential scan through another. The scan blocks are referenced once, so
//! the burst budget keeps them from pushing the hot set out. A few hot blocks
//! carry eviction subscriptions whose outcomes are reported at the end.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info};

use stream_read_cache::config::{Cli, Config, WorkloadConfig};
use stream_read_cache::{
    CacheSize, CacheStats, CacheUsage, EvictionOutcome, ManualClock, ReadCache, Registration,
    StreamId,
};

#[derive(Debug, Default, Serialize)]
struct SubscriptionReport {
    evicted: usize,
    not_found: usize,
    cancelled: usize,
}

#[derive(Debug, Serialize)]
struct Report {
    size: CacheSize,
    usage_before_shutdown: CacheUsage,
    hit_rate: f64,
    stats: CacheStats,
    subscriptions: SubscriptionReport,
}

fn block(workload: &WorkloadConfig, fill: u8) -> anyhow::Result<Bytes> {
    let len = usize::try_from(workload.block_size)?;
    Ok(Bytes::from(vec![fill; len]))
}

/// Read one block, caching it on a miss.
fn read_block(
    cache: &ReadCache,
    workload: &WorkloadConfig,
    stream: StreamId,
    index: u64,
) -> anyhow::Result<bool> {
    let offset = index * workload.block_size;
    if cache.query(stream, offset).is_some() {
        return Ok(true);
    }
    cache.add(stream, offset, block(workload, index as u8)?)?;
    Ok(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "stream_read_cache=debug,read_cache_sim=debug"
    } else {
        "stream_read_cache=info,read_cache_sim=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("read-cache-sim v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    cli.apply_overrides(&mut config);
    config.cache.validate()?;
    let workload = config.workload.clone();

    info!(
        block_size = workload.block_size,
        hot_blocks = workload.hot_blocks,
        scan_blocks = workload.scan_blocks,
        rounds = workload.rounds,
        "Workload loaded"
    );

    let clock = ManualClock::new();
    let cache = Arc::new(ReadCache::with_clock(
        config.cache.clone(),
        Arc::new(clock.clone()),
    )?);
    let interval = Duration::from_millis(workload.read_interval_ms);

    let hot = StreamId::random();
    let scan = StreamId::random();

    // Warm the hot set.
    for index in 0..workload.hot_blocks {
        read_block(&cache, &workload, hot, index)?;
        clock.advance(interval);
    }

    // Watch the first few hot blocks.
    let mut watchers = Vec::new();
    let mut report = SubscriptionReport::default();
    for index in 0..workload.hot_blocks.min(workload.subscriptions as u64) {
        let mut subscription = cache.allocate_register_for_eviction();
        match cache.register_for_eviction(&mut subscription, hot, index * workload.block_size)? {
            Registration::Armed => {
                watchers.push(tokio::spawn(async move { subscription.completed().await }));
            }
            Registration::NotFound => report.not_found += 1,
        }
    }
    debug!(armed = watchers.len(), "Eviction subscriptions registered");

    let mut scan_cursor = 0u64;
    for round in 0..workload.rounds {
        let mut hot_hits = 0u64;
        for index in 0..workload.hot_blocks {
            if read_block(&cache, &workload, hot, index)? {
                hot_hits += 1;
            }
            clock.advance(interval);
        }
        for _ in 0..workload.scan_blocks {
            read_block(&cache, &workload, scan, scan_cursor)?;
            scan_cursor += 1;
            clock.advance(interval);
        }

        let usage = cache.query_cache_usage();
        info!(
            round,
            hot_hits,
            total = usage.total,
            burst = usage.burst,
            items = usage.items,
            "Round complete"
        );
    }

    if !cache.verify() {
        anyhow::bail!("read cache structures are inconsistent");
    }

    let size = cache.query_cache_size();
    let usage_before_shutdown = cache.query_cache_usage();
    let dropped = cache.shutdown();
    info!(dropped, "Cache drained");

    for watcher in watchers {
        match watcher.await?? {
            EvictionOutcome::Evicted => report.evicted += 1,
            EvictionOutcome::NotFound => report.not_found += 1,
            EvictionOutcome::Cancelled => report.cancelled += 1,
        }
    }

    let stats = cache.stats();
    let report = Report {
        size,
        usage_before_shutdown,
        hit_rate: stats.hit_rate(),
        stats,
        subscriptions: report,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
