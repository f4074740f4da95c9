//! Partitioning of the record index space across loading workers.
use std::ops::Range;

/// A worker-exclusive contiguous range `[start, end)` of record indices.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ShardRange {
    pub start: usize,
    pub end: usize,
}

impl ShardRange {
    /// # Panics
    /// If `start > end`.
    pub fn new(start: usize, end: usize) -> Self {
        assert!(start <= end, "invalid shard range {}..{}", start, end);
        Self { start, end }
    }

    /// The shard covering all `len` records.
    pub const fn full(len: usize) -> Self {
        Self { start: 0, end: len }
    }

    /// The shard of `len` records owned by worker `worker_id` out of `num_workers`.
    ///
    /// Each worker owns `ceil(len / num_workers)` consecutive indices except at the end of the
    /// index space, where the final shards are truncated (possibly to empty).
    ///
    /// # Panics
    /// If `num_workers` is zero or `worker_id >= num_workers`.
    pub fn for_worker(len: usize, num_workers: usize, worker_id: usize) -> Self {
        assert!(num_workers > 0, "at least one worker is required");
        assert!(
            worker_id < num_workers,
            "worker {} out of range for {} workers",
            worker_id,
            num_workers
        );
        let per_worker = (len + num_workers - 1) / num_workers;
        let start = per_worker.saturating_mul(worker_id).min(len);
        let end = start.saturating_add(per_worker).min(len);
        Self { start, end }
    }

    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The record indices in this shard, in order.
    pub const fn indices(&self) -> Range<usize> {
        self.start..self.end
    }
}
