//! Statistics sidecar: counters that survive a restart even
//! though the queue's contents do not, so benchmarks are comparable
//! across sessions.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Capacity of the enqueue-timestamp ring buffer: 128 * 1024.
pub const TIMESTAMP_RING_CAPACITY: usize = 128 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    pub total: u64,
    pub queued: u64,
    pub deduplicated: u64,
    pub failed: u64,
    pub finished: u64,
    pub leftover_from_previous_session: u64,
}

/// Mutable counters plus the timestamp ring buffer, behind one lock so a
/// snapshot ([`QueueStatistics`]) is always internally consistent.
pub struct StatisticsSidecar {
    inner: Mutex<Inner>,
}

struct Inner {
    counters: QueueStatistics,
    enqueue_timestamps: VecDeque<DateTime<Utc>>,
}

impl StatisticsSidecar {
    pub fn new(leftover_from_previous_session: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                counters: QueueStatistics {
                    leftover_from_previous_session,
                    ..Default::default()
                },
                enqueue_timestamps: VecDeque::with_capacity(TIMESTAMP_RING_CAPACITY.min(1024)),
            }),
        }
    }

    pub fn record_enqueued(&self, at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.counters.total += 1;
        inner.counters.queued += 1;
        if inner.enqueue_timestamps.len() == TIMESTAMP_RING_CAPACITY {
            inner.enqueue_timestamps.pop_front();
        }
        inner.enqueue_timestamps.push_back(at);
    }

    pub fn record_deduplicated(&self) {
        let mut inner = self.inner.lock();
        inner.counters.deduplicated += 1;
    }

    pub fn record_finished(&self) {
        let mut inner = self.inner.lock();
        inner.counters.queued = inner.counters.queued.saturating_sub(1);
        inner.counters.finished += 1;
    }

    pub fn record_failed(&self) {
        let mut inner = self.inner.lock();
        inner.counters.queued = inner.counters.queued.saturating_sub(1);
        inner.counters.failed += 1;
    }

    pub fn snapshot(&self) -> QueueStatistics {
        self.inner.lock().counters.clone()
    }

    pub fn recent_enqueue_timestamps(&self) -> Vec<DateTime<Utc>> {
        self.inner.lock().enqueue_timestamps.iter().copied().collect()
    }
}
