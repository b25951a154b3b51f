//! Deduplicating queue: keeps only the latest edition per identity,
//! backed by a [`DashMap`] so concurrent producers don't serialize on a
//! single lock the way they would behind a `Mutex<BTreeMap>`. The
//! default variant; test suites must not depend
//! on order of delivery of editions for the same identity.

use super::{IdentityFile, IdentityFileQueue, PolledFile, QueueEventHandler, QueueStatistics};
use crate::capability::Clock;
use crate::ids::Id;
use crate::queue::stats::StatisticsSidecar;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_SOFT_LIMIT: usize = 4096;

pub struct DedupQueue {
    clock: Arc<dyn Clock>,
    files: DashMap<Id, IdentityFile>,
    in_flight: AtomicBool,
    soft_limit: usize,
    stats: StatisticsSidecar,
    handlers: RwLock<Vec<Arc<dyn QueueEventHandler>>>,
}

impl DedupQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_soft_limit(clock, DEFAULT_SOFT_LIMIT, 0)
    }

    pub fn with_soft_limit(clock: Arc<dyn Clock>, soft_limit: usize, leftover: u64) -> Self {
        Self {
            clock,
            files: DashMap::new(),
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

impl IdentityFileQueue for DedupQueue {
    fn add(&self, file: IdentityFile) -> bool {
        let was_empty = self.files.is_empty();
        let replaced_with_older = self
            .files
            .get(&file.identity)
            .map(|existing| existing.edition >= file.edition)
            .unwrap_or(false);
        if replaced_with_older {
            self.stats.record_deduplicated();
            return false;
        }
        self.files.insert(file.identity.clone(), file);
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
        let key = self.files.iter().next().map(|entry| entry.key().clone());
        match key.and_then(|k| self.files.remove(&k)) {
            Some((_, file)) => Some(PolledFile::new(file, self)),
            None => {
                self.in_flight.store(false, Ordering::Release);
                None
            }
        }
    }

    fn contains_any_edition_of(&self, identity: &Id) -> bool {
        self.files.contains_key(identity)
    }

    fn size(&self) -> usize {
        self.files.len()
    }

    fn size_soft_limit(&self) -> usize {
        self.soft_limit
    }

    fn register_event_handler(&self, handler: Arc<dyn QueueEventHandler>) {
        let fire_immediately = !self.files.is_empty();
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
