//! Identity-file queue (C3): the bounded buffer between the downloader
//! and the importer. Two legal concrete behaviors are implemented behind
//! one trait so the importer stays agnostic to which is configured:
//! [`dedup::DedupQueue`] keeps only the
//! latest edition per identity, [`fifo::FifoQueue`] preserves insertion
//! order for deterministic replay. `DedupQueue` is the default.

pub mod dedup;
pub mod fifo;
pub mod stats;

use crate::ids::Id;
use std::sync::Arc;

pub use dedup::DedupQueue;
pub use fifo::FifoQueue;
pub use stats::QueueStatistics;

/// A downloaded identity document awaiting import.
#[derive(Debug, Clone)]
pub struct IdentityFile {
    pub identity: Id,
    pub edition: u64,
    pub bytes: Vec<u8>,
}

/// A held slot returned from [`IdentityFileQueue::poll`]. Dropping it
/// without calling [`PolledFile::close`] still releases the slot — at
/// most one poll() result may be unclosed at any time, and the
/// `Drop` impl does the release so a panicking importer can't wedge the
/// queue forever.
pub struct PolledFile<'q> {
    file: Option<IdentityFile>,
    queue: &'q dyn IdentityFileQueue,
}

impl<'q> PolledFile<'q> {
    fn new(file: IdentityFile, queue: &'q dyn IdentityFileQueue) -> Self {
        Self {
            file: Some(file),
            queue,
        }
    }

    pub fn file(&self) -> &IdentityFile {
        self.file.as_ref().expect("file taken before drop")
    }

    pub fn close(mut self) {
        self.file.take();
        self.queue.release_poll_slot();
    }
}

impl Drop for PolledFile<'_> {
    fn drop(&mut self) {
        if self.file.is_some() {
            self.queue.release_poll_slot();
        }
    }
}

/// Callback invoked on a transition from empty to non-empty, the
/// `registerEventHandler` hook. Implemented as a plain callback trait rather
/// than a channel so both the synchronous unit tests and the background
/// scheduler's `DelayedJob::trigger_execution` can be wired in directly.
pub trait QueueEventHandler: Send + Sync {
    fn trigger_execution(&self);
}

pub trait IdentityFileQueue: Send + Sync {
    /// Add a file. Never fails due to capacity (soft-limit only); may
    /// return `false` without enqueuing if a file with the same
    /// (identity, edition) key is already present.
    fn add(&self, file: IdentityFile) -> bool;

    /// Returns a single wrapped stream; `None` if empty. The caller must
    /// drop or explicitly close the returned [`PolledFile`] to release
    /// the slot.
    fn poll(&self) -> Option<PolledFile<'_>>;

    fn contains_any_edition_of(&self, identity: &Id) -> bool;

    fn size(&self) -> usize;

    fn size_soft_limit(&self) -> usize;

    fn register_event_handler(&self, handler: Arc<dyn QueueEventHandler>);

    fn statistics(&self) -> QueueStatistics;

    /// Called by [`PolledFile::close`]/`Drop` to release the in-flight
    /// slot. Part of the public trait (rather than a private method) so
    /// `PolledFile` can hold a `&dyn IdentityFileQueue`.
    fn release_poll_slot(&self);
}
