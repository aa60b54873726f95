use std::collections::VecDeque;

use crate::core::{AngleRecord, TailBatch};
use crate::protocol::ServerStatus;

/// The server's in-memory view of the log: the latest record plus a short
/// ring of recent ones. Only the tail thread mutates it.
#[derive(Debug)]
pub struct ServerCache {
    recent: VecDeque<AngleRecord>,
    capacity: usize,
    status: ServerStatus,
}

impl ServerCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            recent: VecDeque::with_capacity(capacity),
            capacity,
            status: ServerStatus::default(),
        }
    }

    pub fn latest(&self) -> Option<AngleRecord> {
        self.recent.back().copied()
    }

    /// Up to `count` most recent records, oldest first.
    pub fn recent(&self, count: usize) -> Vec<AngleRecord> {
        let skip = self.recent.len().saturating_sub(count);
        self.recent.iter().skip(skip).copied().collect()
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    /// Folds a tail batch in; `offset` is the tail position after the batch.
    /// A batch carrying a reset replays the log from its start, so the ring
    /// and the per-file counters start over.
    pub fn publish(&mut self, batch: TailBatch, offset: u64) {
        if batch.reset.is_some() {
            self.status.resets += 1;
            self.status.observed = 0;
            self.status.skipped = 0;
            self.status.latest_ns = None;
            self.recent.clear();
        }
        self.status.skipped += batch.skipped as u64;
        self.status.offset = offset;
        for record in batch {
            if self.recent.len() == self.capacity {
                self.recent.pop_front();
            }
            self.recent.push_back(record);
            self.status.observed += 1;
            self.status.latest_ns = Some(record.timestamp_ns);
        }
    }

    pub fn record_tail_failure(&mut self) {
        self.status.tail_failures += 1;
    }
}
