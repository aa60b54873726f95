//! Storage primitives shared by the logger, server and maintenance tools.

pub mod clock;
pub mod error;
pub mod record;
pub mod store;
pub mod tail;
pub mod writer_lock;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result, TailFault};
pub use record::AngleRecord;
pub use store::{LogStore, StoreConfig, TailChunk};
pub use tail::{LogTail, TailBatch, TailPosition, TailReset};
pub use writer_lock::{
    lock_owner_alive, read_lock_info, ClearOutcome, LockStatus, WriterLock, WriterLockInfo,
};
