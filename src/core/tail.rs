use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::core::record::AngleRecord;
use crate::core::store::read_chunk;
use crate::core::{Error, Result, TailFault};

/// Identity of the file being tailed; a change means it was replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

/// Resumable tail state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TailPosition {
    pub offset: u64,
    pub identity: Option<FileIdentity>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailReset {
    /// Path now names a different file.
    Replaced,
    /// File shrank below the committed offset.
    Truncated,
}

/// Records that became complete since the previous poll.
#[derive(Debug, Default)]
pub struct TailBatch {
    pub records: Vec<AngleRecord>,
    pub reset: Option<TailReset>,
    pub skipped: usize,
}

impl TailBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl IntoIterator for TailBatch {
    type Item = AngleRecord;
    type IntoIter = std::vec::IntoIter<AngleRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Poll-based follower of a growing log file.
///
/// Each `poll` yields a finite batch; over the life of the follower the
/// sequence is unbounded. The offset only ever advances past terminated
/// records, so a record still being written is picked up whole on a later
/// poll.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    position: TailPosition,
}

impl LogTail {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::resume(path, TailPosition::default())
    }

    pub fn resume(path: impl AsRef<Path>, position: TailPosition) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            position,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> TailPosition {
        self.position
    }

    /// # Errors
    ///
    /// `Error::TailFailure` when the file is missing or unreadable. The
    /// position is kept, so polling again after the file reappears resumes.
    pub fn poll(&mut self) -> Result<TailBatch> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::TailFailure(TailFault::Missing))
            }
            Err(err) => {
                warn!("cannot open {}: {err}", self.path.display());
                return Err(Error::TailFailure(TailFault::Unreadable));
            }
        };
        let meta = file
            .metadata()
            .map_err(|_| Error::TailFailure(TailFault::Unreadable))?;
        let identity = FileIdentity {
            dev: meta.dev(),
            ino: meta.ino(),
        };

        let mut reset = None;
        match self.position.identity {
            Some(known) if known != identity => {
                info!("{} was replaced; tailing from start", self.path.display());
                reset = Some(TailReset::Replaced);
                self.position.offset = 0;
            }
            _ if meta.len() < self.position.offset => {
                info!(
                    "{} truncated to {} bytes below offset {}; tailing from start",
                    self.path.display(),
                    meta.len(),
                    self.position.offset
                );
                reset = Some(TailReset::Truncated);
                self.position.offset = 0;
            }
            _ => {}
        }
        self.position.identity = Some(identity);

        if meta.len() == self.position.offset {
            return Ok(TailBatch {
                reset,
                ..TailBatch::default()
            });
        }
        let chunk = read_chunk(&mut file, self.position.offset)
            .map_err(|_| Error::TailFailure(TailFault::Unreadable))?;
        self.position.offset = chunk.next_offset;
        Ok(TailBatch {
            records: chunk.records,
            reset,
            skipped: chunk.skipped,
        })
    }
}
