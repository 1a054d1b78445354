use std::{
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Identifies one worker thread of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerHandle {
    /// Index of the worker thread within its process.
    pub index: usize,
    /// Index of the input partition the worker reads from.
    pub data_shard: usize,
    /// Rank of the process the worker lives in.
    pub rank: usize,
}

impl WorkerHandle {
    /// The slot of this worker in a scratch array holding `len` elements per worker.
    pub fn scratch_range(&self, len: usize) -> Range<usize> {
        let start = self.index * len;
        start..start + len
    }
}

/// Hands out unique worker and data shard indices, never reused within a run.
#[derive(Debug, Default)]
pub struct WorkerAllocator {
    worker_idx: AtomicUsize,
    data_shard_idx: AtomicUsize,
}

impl WorkerAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_worker_index(&self) -> usize {
        self.worker_idx.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_data_shard_index(&self) -> usize {
        self.data_shard_idx.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates both indices for a newly spawned worker.
    ///
    /// # Arguments
    /// * `rank` - The rank of this process.
    pub fn register(&self, rank: usize) -> WorkerHandle {
        WorkerHandle {
            index: self.next_worker_index(),
            data_shard: self.next_data_shard_index(),
            rank,
        }
    }
}
