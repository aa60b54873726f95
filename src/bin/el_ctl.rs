use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use ellog::core::{lock_owner_alive, ClearOutcome, LockStatus, LogStore, WriterLockInfo};
use ellog::logger::{disable_z_reset, enable_z_reset, load_calibration};

#[derive(Parser)]
#[command(name = "el-ctl", version, about = "Elevation log maintenance")]
struct Cli {
    /// Log directory
    #[arg(short, long, global = true, default_value = "./el_log")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Z-reset detection switch read by running loggers
    Calibration {
        #[command(subcommand)]
        action: CalibrationAction,
    },
    /// Writer lock maintenance
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Print committed records
    Dump {
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Summarize the log directory
    Inspect,
}

#[derive(Subcommand)]
enum CalibrationAction {
    Enable,
    Disable,
    Status,
}

#[derive(Subcommand)]
enum LockAction {
    Status,
    /// Remove a lock left behind by a dead writer
    ClearStale {
        /// Also remove an unlocked sentinel younger than the staleness threshold
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Calibration { action } => cmd_calibration(&cli.dir, action, &mut out)?,
        Commands::Lock { action } => cmd_lock(&cli.dir, action, &mut out)?,
        Commands::Dump { limit } => cmd_dump(&cli.dir, limit, &mut out)?,
        Commands::Inspect => cmd_inspect(&cli.dir, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn cmd_calibration(
    dir: &Path,
    action: CalibrationAction,
    out: &mut dyn Write,
) -> Result<(), Box<dyn Error>> {
    let state = match action {
        CalibrationAction::Enable => Some(enable_z_reset(dir)?),
        CalibrationAction::Disable => Some(disable_z_reset(dir)?),
        CalibrationAction::Status => load_calibration(dir)?,
    };
    match state {
        Some(state) => writeln!(
            out,
            "z_reset_enabled={} updated_ns={}",
            state.z_reset_enabled, state.updated_ns
        )?,
        None => writeln!(out, "z_reset_enabled=false (never set)")?,
    }
    Ok(())
}

fn cmd_lock(dir: &Path, action: LockAction, out: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    let store = LogStore::open(dir)?;
    match action {
        LockAction::Status => write_lock_status(store.lock_status()?, out)?,
        LockAction::ClearStale { force } => match store.clear_stale_lock(force)? {
            ClearOutcome::NothingToClear => writeln!(out, "lock none")?,
            ClearOutcome::Removed(info) => {
                writeln!(out, "removed pid={} acquired_ns={}", info.pid, info.acquired_ns)?
            }
        },
    }
    Ok(())
}

fn cmd_dump(dir: &Path, limit: Option<usize>, out: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    let store = LogStore::open(dir)?;
    let records = store.read_all()?;
    let skip = limit.map_or(0, |limit| records.len().saturating_sub(limit));
    for record in &records[skip..] {
        writeln!(
            out,
            "{} {} {:.6} {}",
            record.timestamp_ns,
            record.utc_string(),
            record.angle,
            if record.calibrated { "calibrated" } else { "uncalibrated" }
        )?;
    }
    Ok(())
}

fn cmd_inspect(dir: &Path, out: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    let store = LogStore::open(dir)?;
    let chunk = store.tail_from(0)?;
    let len = store.len()?;
    writeln!(out, "log={}", store.log_path().display())?;
    writeln!(
        out,
        "records={} committed_bytes={} torn_bytes={} skipped_lines={}",
        chunk.records.len(),
        chunk.next_offset,
        len.saturating_sub(chunk.next_offset),
        chunk.skipped
    )?;
    if let Some(last) = chunk.records.last() {
        writeln!(out, "latest {last}")?;
    }
    match load_calibration(dir)? {
        Some(state) => writeln!(out, "z_reset_enabled={}", state.z_reset_enabled)?,
        None => writeln!(out, "z_reset_enabled=false (never set)")?,
    }
    write_lock_status(store.lock_status()?, out)?;
    Ok(())
}

fn write_lock_status(status: LockStatus, out: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    match status {
        LockStatus::Free => writeln!(out, "lock none")?,
        LockStatus::Held(info) => write_lock_line("held", &info, out)?,
        LockStatus::Pending(info) => write_lock_line("pending", &info, out)?,
        LockStatus::Stale(info) => write_lock_line("stale", &info, out)?,
    }
    Ok(())
}

fn write_lock_line(
    state: &str,
    info: &WriterLockInfo,
    out: &mut dyn Write,
) -> Result<(), Box<dyn Error>> {
    let alive = lock_owner_alive(info)?;
    writeln!(
        out,
        "lock {state} pid={} start_time={} acquired_ns={} alive={}",
        info.pid, info.start_time, info.acquired_ns, alive
    )?;
    Ok(())
}
