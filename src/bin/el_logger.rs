use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use ellog::core::{LogStore, StoreConfig, SystemClock};
use ellog::logger::{EncoderScale, Logger, LoggerConfig, SimulatedEncoder};
use ellog::Shutdown;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sample the elevation sensor into the angle log", long_about = None)]
struct Args {
    /// Log directory shared with the server
    #[arg(short, long, default_value = "./el_log")]
    dir: PathBuf,

    /// Sampling period in milliseconds
    #[arg(long, default_value_t = 100)]
    period_ms: u64,

    /// Longest wait for the writer lock per attempt, in milliseconds
    #[arg(long, default_value_t = 500)]
    lock_timeout_ms: u64,

    /// Extra append attempts after a lock timeout before dropping a sample
    #[arg(long, default_value_t = 3)]
    lock_retries: u32,

    /// How often the calibration switch is re-read, in milliseconds
    #[arg(long, default_value_t = 1000)]
    calibration_refresh_ms: u64,

    /// Encoder count at zero degrees
    #[arg(long, default_value_t = 7062)]
    zero_count: i64,

    /// Encoder counts per degree
    #[arg(long, default_value_t = 900.0)]
    counts_per_degree: f64,

    /// Samples between simulated Z pulses
    #[arg(long, default_value_t = 50)]
    index_every: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let shutdown = Shutdown::install().context("Failed to install signal handlers")?;
    let store = LogStore::open_with_config(
        &args.dir,
        StoreConfig {
            lock_timeout: Duration::from_millis(args.lock_timeout_ms),
            ..StoreConfig::default()
        },
    )
    .with_context(|| format!("Failed to open log directory {}", args.dir.display()))?;

    let scale = EncoderScale {
        zero_count: args.zero_count,
        counts_per_degree: args.counts_per_degree,
    };
    // No hardware driver is bundled; the simulated encoder stands in for it.
    let source = SimulatedEncoder::new(scale, args.index_every);
    let config = LoggerConfig {
        sample_period: Duration::from_millis(args.period_ms),
        lock_retries: args.lock_retries,
        calibration_refresh: Duration::from_millis(args.calibration_refresh_ms),
        ..LoggerConfig::default()
    };
    let mut logger =
        Logger::new(store, source, SystemClock, config).context("Failed to start logger")?;

    info!("Starting elevation logger (pid {})", std::process::id());
    logger.run(&shutdown);
    Ok(())
}
