//! Sentinel lock file guarding the log against concurrent writers.
//!
//! The sentinel's presence means "writer in progress". Mutual exclusion is an
//! advisory `flock` on the sentinel; the kernel drops it when the holder dies,
//! so a sentinel left behind by a killed writer is stale but never wedges the
//! next writer. Holders always verify that the path still names the inode
//! they locked, because a releasing writer unlinks the sentinel before it
//! closes the descriptor.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, warn};

use crate::core::clock::now_ns;
use crate::core::{Error, Result};

/// Unlocked sentinels younger than this are treated as in progress.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriterLockInfo {
    pub pid: u32,
    pub start_time: u64,
    pub acquired_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// No sentinel on disk.
    Free,
    /// A live process holds the flock.
    Held(WriterLockInfo),
    /// Sentinel present without a flock holder, but its owner is alive and it
    /// is younger than `STALE_AFTER`. Usually a writer between open and flock.
    Pending(WriterLockInfo),
    /// Sentinel left behind by a writer that is gone.
    Stale(WriterLockInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    NothingToClear,
    Removed(WriterLockInfo),
}

/// Scoped ownership of the writer lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
    file: File,
    dev: u64,
    ino: u64,
}

impl WriterLock {
    /// Polls for the lock every `poll` until `timeout` has elapsed.
    pub fn acquire(path: &Path, timeout: Duration, poll: Duration) -> Result<Self> {
        let started = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(Error::LockTimeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            thread::sleep(poll.min(timeout - waited));
        }
    }

    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        if !try_lock(&file)? {
            return Ok(None);
        }
        let held = file.metadata()?;
        if !same_file(path, &held)? {
            debug!("writer lock {} replaced while waiting", path.display());
            return Ok(None);
        }
        if held.len() > 0 {
            let previous = read_lock_record(&file)?;
            warn!(
                "recovered stale writer lock {} left by pid {}",
                path.display(),
                previous.pid
            );
        }
        write_lock_record(&file)?;
        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
            dev: held.dev(),
            ino: held.ino(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> Result<WriterLockInfo> {
        read_lock_record(&self.file)
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        // Unlink first; the flock goes away when `file` closes after this body.
        match fs::metadata(&self.path) {
            Ok(meta) if meta.dev() == self.dev && meta.ino() == self.ino => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!("failed to remove writer lock {}: {err}", self.path.display());
                }
            }
            Ok(_) => warn!("writer lock {} was replaced while held", self.path.display()),
            Err(err) => warn!("writer lock {} vanished while held: {err}", self.path.display()),
        }
    }
}

/// Reads the owner record of a sentinel, `None` when there is no sentinel.
pub fn read_lock_info(path: &Path) -> Result<Option<WriterLockInfo>> {
    match File::open(path) {
        Ok(file) => Ok(Some(read_lock_record(&file)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::Io(err)),
    }
}

/// Classifies the sentinel at `path` without disturbing a live holder.
pub fn inspect(path: &Path) -> Result<LockStatus> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(LockStatus::Free),
        Err(err) => return Err(Error::Io(err)),
    };
    let info = read_lock_record(&file)?;
    if !try_lock(&file)? {
        return Ok(LockStatus::Held(info));
    }
    let status = classify_unlocked(&file, info)?;
    unlock(&file)?;
    Ok(status)
}

/// Removes a stale sentinel. `force` also removes a `Pending` one; a
/// sentinel whose flock is held is never removed.
pub fn clear_stale(path: &Path, force: bool) -> Result<ClearOutcome> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ClearOutcome::NothingToClear)
        }
        Err(err) => return Err(Error::Io(err)),
    };
    let info = read_lock_record(&file)?;
    if !try_lock(&file)? {
        return Err(Error::LockHeld { pid: info.pid });
    }
    if !same_file(path, &file.metadata()?)? {
        return Ok(ClearOutcome::NothingToClear);
    }
    let removable = match classify_unlocked(&file, info)? {
        LockStatus::Stale(_) => true,
        LockStatus::Pending(_) => force,
        LockStatus::Free | LockStatus::Held(_) => false,
    };
    if !removable {
        unlock(&file)?;
        return Err(Error::LockHeld { pid: info.pid });
    }
    // Still holding the flock, so no writer can be inside this inode.
    fs::remove_file(path)?;
    warn!(
        "removed stale writer lock {} (pid {})",
        path.display(),
        info.pid
    );
    Ok(ClearOutcome::Removed(info))
}

fn classify_unlocked(file: &File, info: WriterLockInfo) -> Result<LockStatus> {
    let age = lock_age(file, &info)?;
    if !lock_owner_alive(&info)? || age >= STALE_AFTER {
        Ok(LockStatus::Stale(info))
    } else {
        Ok(LockStatus::Pending(info))
    }
}

fn lock_age(file: &File, info: &WriterLockInfo) -> Result<Duration> {
    if info.acquired_ns != 0 {
        return Ok(Duration::from_nanos(now_ns().saturating_sub(info.acquired_ns)));
    }
    let modified = file.metadata()?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}

fn same_file(path: &Path, held: &fs::Metadata) -> Result<bool> {
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(Error::Io(err)),
    }
}

fn try_lock(file: &File) -> Result<bool> {
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(Error::Io(err))
}

fn unlock(file: &File) -> Result<()> {
    let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if res == 0 {
        return Ok(());
    }
    Err(Error::Io(std::io::Error::last_os_error()))
}

fn write_lock_record(file: &File) -> Result<()> {
    let (pid, start_time) = lock_identity()?;
    let acquired_ns = now_ns();
    let record = format!("{pid} {start_time} {acquired_ns}\n");
    let mut handle = file.try_clone()?;
    handle.set_len(0)?;
    handle.seek(SeekFrom::Start(0))?;
    handle.write_all(record.as_bytes())?;
    handle.sync_all()?;
    Ok(())
}

fn read_lock_record(file: &File) -> Result<WriterLockInfo> {
    let mut contents = String::new();
    let mut clone = file.try_clone()?;
    clone.seek(SeekFrom::Start(0))?;
    clone.read_to_string(&mut contents)?;
    let mut parts = contents.split_whitespace();
    let mut next = || parts.next().and_then(|p| p.parse::<u64>().ok()).unwrap_or(0);
    let pid = u32::try_from(next()).unwrap_or(0);
    let start_time = next();
    let acquired_ns = next();
    Ok(WriterLockInfo {
        pid,
        start_time,
        acquired_ns,
    })
}

#[cfg(target_os = "linux")]
pub fn lock_owner_alive(info: &WriterLockInfo) -> Result<bool> {
    if info.pid == 0 {
        return Ok(false);
    }
    match proc_start_time(info.pid) {
        Ok(start) => Ok(start == info.start_time),
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(target_os = "linux")]
fn lock_identity() -> Result<(u32, u64)> {
    let pid = std::process::id();
    let start_time = proc_start_time(pid)?;
    Ok((pid, start_time))
}

#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Result<u64> {
    let path = format!("/proc/{pid}/stat");
    let mut contents = String::new();
    File::open(&path)?.read_to_string(&mut contents)?;
    let end = contents.rfind(')').ok_or(Error::Corrupt("stat parse"))?;
    let after = &contents[end + 1..];
    let mut fields = after.split_whitespace();
    for _ in 0..20 {
        fields.next();
    }
    let start = fields
        .next()
        .ok_or(Error::Corrupt("stat missing starttime"))?;
    start
        .parse::<u64>()
        .map_err(|_| Error::Corrupt("stat starttime invalid"))
}

// Without /proc the age rule alone decides staleness.
#[cfg(not(target_os = "linux"))]
pub fn lock_owner_alive(info: &WriterLockInfo) -> Result<bool> {
    Ok(info.pid != 0)
}

#[cfg(not(target_os = "linux"))]
fn lock_identity() -> Result<(u32, u64)> {
    Ok((std::process::id(), 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn guard_removes_sentinel_on_drop() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("writer.lock");
        let lock = WriterLock::try_acquire(&path)
            .expect("acquire")
            .expect("lock free");
        let info = lock.info().expect("info");
        assert_eq!(info.pid, std::process::id());
        assert!(path.exists());
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_times_out_while_held() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("writer.lock");
        let _held = WriterLock::try_acquire(&path)
            .expect("acquire")
            .expect("lock free");
        let err = WriterLock::acquire(&path, Duration::from_millis(30), Duration::from_millis(5))
            .expect_err("must time out");
        assert!(matches!(err, Error::LockTimeout { .. }));
        assert!(matches!(inspect(&path).expect("inspect"), LockStatus::Held(_)));
    }

    #[test]
    fn dead_owner_sentinel_is_stale() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("writer.lock");
        fs::write(&path, "0 0 1\n").expect("write sentinel");
        assert!(matches!(inspect(&path).expect("inspect"), LockStatus::Stale(_)));
        let outcome = clear_stale(&path, false).expect("clear");
        assert!(matches!(outcome, ClearOutcome::Removed(_)));
        assert!(!path.exists());
        assert_eq!(clear_stale(&path, false).expect("clear again"), ClearOutcome::NothingToClear);
    }

    #[test]
    fn clear_refuses_held_lock() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("writer.lock");
        let _held = WriterLock::try_acquire(&path)
            .expect("acquire")
            .expect("lock free");
        assert!(matches!(
            clear_stale(&path, true),
            Err(Error::LockHeld { .. })
        ));
        assert!(path.exists());
    }
}
