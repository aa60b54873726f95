use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why the tail reader could not make progress on this poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailFault {
    /// The log file is not present at its path.
    Missing,
    /// The log file exists but could not be read.
    Unreadable,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("writer lock {} not acquired within {waited:?}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("writer lock held by live process {pid}")]
    LockHeld { pid: u32 },
    #[error("log write failed: {0}")]
    WriteFailure(#[source] std::io::Error),
    #[error("log tail failed: {0:?}")]
    TailFailure(TailFault),
    #[error("server unavailable: {0}")]
    ServerUnavailable(#[source] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Transient failures that a caller may retry on a later cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::LockTimeout { .. } | Error::TailFailure(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
