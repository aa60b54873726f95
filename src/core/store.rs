//! Append-only angle log.
//!
//! A store is a directory:
//! ```text
//! {dir}/
//!   angles.log         ← one terminated line per record
//!   writer.lock        ← present while a writer is appending
//!   calibration.json   ← Z-reset detection switch
//! ```
//!
//! Writers serialize on `writer.lock` for every append. Readers never touch
//! the lock: they only trust bytes up to the last record terminator.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;

use crate::core::record::{scan_complete, AngleRecord, RECORD_TERMINATOR};
use crate::core::writer_lock::{self, ClearOutcome, LockStatus, WriterLock};
use crate::core::{Error, Result};

pub const LOG_FILE: &str = "angles.log";
pub const WRITER_LOCK_FILE: &str = "writer.lock";
pub const CALIBRATION_FILE: &str = "calibration.json";

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 500;
const DEFAULT_LOCK_POLL_MS: u64 = 5;
const REPAIR_CHUNK: u64 = 4096;

#[derive(Clone, Copy, Debug)]
pub struct StoreConfig {
    /// Upper bound on waiting for the writer lock in one `append`.
    pub lock_timeout: Duration,
    pub lock_poll: Duration,
    /// `fsync` after every record. Disabling trades durability for throughput.
    pub sync_each_append: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            lock_poll: Duration::from_millis(DEFAULT_LOCK_POLL_MS),
            sync_each_append: true,
        }
    }
}

/// Records decoded from a byte range of the log.
#[derive(Debug, Default)]
pub struct TailChunk {
    pub records: Vec<AngleRecord>,
    /// Offset just past the last complete record read.
    pub next_offset: u64,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct LogStore {
    dir: PathBuf,
    log_path: PathBuf,
    lock_path: PathBuf,
    config: StoreConfig,
}

impl LogStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(dir, StoreConfig::default())
    }

    pub fn open_with_config(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if config.lock_timeout.is_zero() {
            return Err(Error::Config("lock timeout must be non-zero".into()));
        }
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join(LOG_FILE),
            lock_path: dir.join(WRITER_LOCK_FILE),
            dir,
            config,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Appends one record under the writer lock.
    ///
    /// # Errors
    ///
    /// - `Error::LockTimeout`: another writer kept the lock past `lock_timeout`
    /// - `Error::WriteFailure`: the log file could not be written or synced
    pub fn append(&self, record: &AngleRecord) -> Result<()> {
        self.append_with(|| *record).map(|_| ())
    }

    /// Like [`append`](Self::append), but builds the record only once the
    /// lock is held. Timestamps taken inside `make` therefore follow file
    /// order across competing writers.
    pub fn append_with<F>(&self, make: F) -> Result<AngleRecord>
    where
        F: FnOnce() -> AngleRecord,
    {
        let _lock = WriterLock::acquire(
            &self.lock_path,
            self.config.lock_timeout,
            self.config.lock_poll,
        )?;
        let record = make();
        self.append_locked(&record).map_err(|err| match err {
            Error::Io(io) => Error::WriteFailure(io),
            other => other,
        })?;
        Ok(record)
    }

    fn append_locked(&self, record: &AngleRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.log_path)?;
        repair_torn_tail(&file, &self.log_path)?;
        file.write_all(record.encode_line().as_bytes())?;
        if self.config.sync_each_append {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Every committed record, oldest first.
    pub fn read_all(&self) -> Result<Vec<AngleRecord>> {
        Ok(self.tail_from(0)?.records)
    }

    /// Committed records starting at byte `offset`, which must lie on a
    /// record boundary (0 or a previous `next_offset`). A missing log reads
    /// as empty.
    pub fn tail_from(&self, offset: u64) -> Result<TailChunk> {
        let mut file = match File::open(&self.log_path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TailChunk {
                    next_offset: offset,
                    ..TailChunk::default()
                })
            }
            Err(err) => return Err(Error::Io(err)),
        };
        read_chunk(&mut file, offset)
    }

    /// Current size of the log in bytes, including any unterminated tail.
    pub fn len(&self) -> Result<u64> {
        match std::fs::metadata(&self.log_path) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(Error::Io(err)),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn lock_status(&self) -> Result<LockStatus> {
        writer_lock::inspect(&self.lock_path)
    }

    pub fn clear_stale_lock(&self, force: bool) -> Result<ClearOutcome> {
        writer_lock::clear_stale(&self.lock_path, force)
    }
}

pub(crate) fn read_chunk(file: &mut File, offset: u64) -> Result<TailChunk> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let scan = scan_complete(&buf);
    Ok(TailChunk {
        records: scan.records,
        next_offset: offset + scan.consumed as u64,
        skipped: scan.skipped,
    })
}

/// Truncates a fragment left by a writer that died mid-line. Only called
/// while holding the writer lock, so the fragment cannot still be growing.
fn repair_torn_tail(file: &File, path: &Path) -> Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.read_exact_at(&mut last, len - 1)?;
    if last[0] == RECORD_TERMINATOR {
        return Ok(());
    }

    let mut end = len;
    let keep = loop {
        let start = end.saturating_sub(REPAIR_CHUNK);
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact_at(&mut buf, start)?;
        if let Some(pos) = buf.iter().rposition(|&b| b == RECORD_TERMINATOR) {
            break start + pos as u64 + 1;
        }
        if start == 0 {
            break 0;
        }
        end = start;
    };
    warn!(
        "discarding {} byte torn record at end of {}",
        len - keep,
        path.display()
    );
    file.set_len(keep)?;
    Ok(())
}
