use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use ellog::{Server, ServerConfig, Shutdown};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the latest logged elevation angle", long_about = None)]
struct Args {
    /// Log directory written by the logger
    #[arg(short, long, default_value = "./el_log")]
    dir: PathBuf,

    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9876")]
    bind: SocketAddr,

    /// Log poll interval in milliseconds; bounds cache staleness
    #[arg(long, default_value_t = 200)]
    poll_ms: u64,

    /// Number of recent records kept for `e#recent?`
    #[arg(long, default_value_t = 64)]
    recent: usize,

    /// Seconds before an idle connection is closed
    #[arg(long, default_value_t = 30)]
    idle_timeout_s: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let shutdown = Shutdown::install().context("Failed to install signal handlers")?;
    let config = ServerConfig {
        bind: args.bind,
        poll_interval: Duration::from_millis(args.poll_ms),
        recent_capacity: args.recent,
        idle_timeout: Duration::from_secs(args.idle_timeout_s),
    };
    let server = Server::bind(&args.dir, config)
        .with_context(|| format!("Failed to start server on {}", args.bind))?;
    server.run(&shutdown)?;
    Ok(())
}
