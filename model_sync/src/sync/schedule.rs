use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use tokio::sync::Notify;

/// Decides when a cross-process exchange is due, counting processed samples.
///
/// Workers report samples from their own threads and never wait on the exchange. The exchange
/// driver waits on `due` from the async runtime. Rounds that become due while an exchange is
/// still running collapse into a single pending one.
#[derive(Debug)]
pub struct MergeSchedule {
    merge_size: NonZeroUsize,
    samples: AtomicUsize,
    closed: AtomicBool,
    notify: Notify,
}

impl MergeSchedule {
    /// Creates a new `MergeSchedule`.
    ///
    /// # Arguments
    /// * `merge_size` - The amount of processed samples between two exchanges.
    pub fn new(merge_size: NonZeroUsize) -> Self {
        Self {
            merge_size,
            samples: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Records `n` processed samples.
    ///
    /// # Returns
    /// `true` if these samples crossed a multiple of the merge size.
    pub fn record(&self, n: usize) -> bool {
        let size = self.merge_size.get();
        let before = self.samples.fetch_add(n, Ordering::AcqRel);
        let due = before / size != (before + n) / size;

        if due {
            self.notify.notify_one();
        }

        due
    }

    pub fn samples(&self) -> usize {
        self.samples.load(Ordering::Acquire)
    }

    /// The amount of exchange rounds a run over `total_samples` goes through.
    pub fn expected_rounds(&self, total_samples: usize) -> usize {
        total_samples / self.merge_size.get()
    }

    /// Waits until an exchange is due or the schedule is closed.
    ///
    /// # Returns
    /// `false` once the schedule is closed.
    pub async fn due(&self) -> bool {
        if self.is_closed() {
            return false;
        }

        self.notify.notified().await;
        !self.is_closed()
    }

    /// Stops the schedule, waking up the exchange driver.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
