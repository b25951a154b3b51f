//! FIFO queue: preserves insertion order for deterministic replay.
//! Distinct editions of the same identity are both kept; only an
//! exact (identity, edition) duplicate is rejected.

use super::{IdentityFile, IdentityFileQueue, PolledFile, QueueEventHandler, QueueStatistics};
use crate::capability::Clock;
use crate::ids::Id;
use crate::queue::stats::StatisticsSidecar;
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_SOFT_LIMIT: usize = 4096;

/// `files` keeps the canonical insertion order, the way the teacher's
/// `HashedBlackboard` keeps a `canonical_order` `Vec` alongside its
/// `DashMap` content table; `keys` is the concurrent membership index
/// used to reject an exact duplicate without walking the deque.
pub struct FifoQueue {
    clock: Arc<dyn Clock>,
    files: Mutex<VecDeque<IdentityFile>>,
    keys: DashSet<(Id, u64)>,
    in_flight: AtomicBool,
    soft_limit: usize,
    stats: StatisticsSidecar,
    handlers: RwLock<Vec<Arc<dyn QueueEventHandler>>>,
}

impl FifoQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_soft_limit(clock, DEFAULT_SOFT_LIMIT, 0)
    }

    pub fn with_soft_limit(clock: Arc<dyn Clock>, soft_limit: usize, leftover: u64) -> Self {
        Self {
            clock,
            files: Mutex::new(VecDeque::new()),
            keys: DashSet::new(),
            in_flight: AtomicBool::new(false),
            soft_limit,
            stats: StatisticsSidecar::new(leftover),
            handlers: RwLock::new(Vec::new()),
        }
    }

    fn notify_handlers(&self) {
        for handler in self.handlers.read().iter() {
            handler.trigger_execution();
        }
    }
}

impl IdentityFileQueue for FifoQueue {
    fn add(&self, file: IdentityFile) -> bool {
        let key = (file.identity.clone(), file.edition);
        if !self.keys.insert(key) {
            self.stats.record_deduplicated();
            return false;
        }

        let mut files = self.files.lock();
        let was_empty = files.is_empty();
        files.push_back(file);
        drop(files);
        self.stats.record_enqueued(self.clock.now());
        if was_empty {
            self.notify_handlers();
        }
        true
    }

    fn poll(&self) -> Option<PolledFile<'_>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let front = self.files.lock().pop_front();
        match front {
            Some(file) => {
                self.keys.remove(&(file.identity.clone(), file.edition));
                Some(PolledFile::new(file, self))
            }
            None => {
                self.in_flight.store(false, Ordering::Release);
                None
            }
        }
    }

    fn contains_any_edition_of(&self, identity: &Id) -> bool {
        self.files.lock().iter().any(|f| &f.identity == identity)
    }

    fn size(&self) -> usize {
        self.files.lock().len()
    }

    fn size_soft_limit(&self) -> usize {
        self.soft_limit
    }

    fn register_event_handler(&self, handler: Arc<dyn QueueEventHandler>) {
        let fire_immediately = !self.files.lock().is_empty();
        self.handlers.write().push(handler.clone());
        if fire_immediately {
            handler.trigger_execution();
        }
    }

    fn statistics(&self) -> QueueStatistics {
        self.stats.snapshot()
    }

    fn release_poll_slot(&self) {
        self.stats.record_finished();
        self.in_flight.store(false, Ordering::Release);
    }
}
