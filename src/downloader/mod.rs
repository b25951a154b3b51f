//! Downloader / Inserter (C5): per-identity fetch loop, edition
//! discovery, publish of own identity files, retry policy.
//! The actual fetch/insert primitive is an external collaborator,
//! modeled here as [`FetchClient`]/[`InsertClient`] trait
//! objects; the engine only supplies starting address and edition hint.

pub mod importer;
pub mod retry;

use crate::capability::{Clock, RandomSource};
use crate::error::WotResult;
use crate::ids::Id;
use crate::model::identity::FetchState;
use crate::queue::{IdentityFile, IdentityFileQueue};
use crate::store::EntityStore;
use async_trait::async_trait;
use retry::BackoffPolicy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use importer::run_importer_once;

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Found { edition: u64, bytes: Vec<u8> },
    NotFound,
}

/// The out-of-scope host-network fetch primitive.
#[async_trait]
pub trait FetchClient: Send + Sync {
    async fn fetch(&self, request_key: &str, edition_hint: u64) -> WotResult<FetchOutcome>;
}

/// The out-of-scope host-network insert primitive.
#[async_trait]
pub trait InsertClient: Send + Sync {
    async fn insert(&self, insert_key: &str, edition: u64, bytes: &[u8]) -> WotResult<()>;
}

/// Cooperative cancellation flag, checked at every suspension point.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-identity fetch loop: retries indefinitely on transient failure,
/// pushing successfully fetched documents onto the identity
/// file queue for the importer to pick up.
pub struct Downloader {
    store: Arc<dyn EntityStore>,
    queue: Arc<dyn IdentityFileQueue>,
    fetch_client: Arc<dyn FetchClient>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    backoff: BackoffPolicy,
}

impl Downloader {
    pub fn new(
        store: Arc<dyn EntityStore>,
        queue: Arc<dyn IdentityFileQueue>,
        fetch_client: Arc<dyn FetchClient>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            store,
            queue,
            fetch_client,
            clock,
            random,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Runs the fetch loop for one identity until cancelled or a
    /// permanent failure is observed. Intended to be spawned as its own
    /// task per identity-of-interest.
    pub async fn run(
        &self,
        identity: Id,
        request_key: String,
        mut edition_hint: u64,
        cancel: CancellationToken,
    ) -> WotResult<()> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.fetch_client.fetch(&request_key, edition_hint).await {
                Ok(FetchOutcome::Found { edition, bytes }) => {
                    self.queue.add(IdentityFile {
                        identity: identity.clone(),
                        edition,
                        bytes,
                    });
                    edition_hint = edition + 1;
                    attempt = 0;
                }
                Ok(FetchOutcome::NotFound) => {
                    attempt = 0;
                }
                Err(crate::error::WotError::Transient(_)) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.backoff.delay_for_attempt(attempt, &self.random);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(_permanent) => {
                    self.mark_parsing_failed(&identity)?;
                    return Ok(());
                }
            }

            if cancel.is_cancelled() {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    fn mark_parsing_failed(&self, identity: &Id) -> WotResult<()> {
        let mut txn = self.store.transaction()?;
        if let Some(mut existing) = txn.get_identity(identity)? {
            existing.fetch_state = FetchState::ParsingFailed;
            existing.last_fetched_date = Some(self.clock.now());
            txn.put_identity(&existing)?;
        }
        txn.commit()
    }
}

/// Coalesced own-identity publish job: a job is triggered with a
/// debounce that then publishes a new document at edition = previous +
/// 1. The debounce/coalescing itself is provided by
/// [`crate::scheduler::DelayedJob`]; this just performs one publish
/// attempt with indefinite exponential-backoff retry on failure.
pub struct Inserter {
    insert_client: Arc<dyn InsertClient>,
    random: Arc<dyn RandomSource>,
    backoff: BackoffPolicy,
}

impl Inserter {
    pub fn new(insert_client: Arc<dyn InsertClient>, random: Arc<dyn RandomSource>) -> Self {
        Self {
            insert_client,
            random,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Publishes `bytes` at `insert_key`/`edition`, retrying with
    /// exponential backoff until it succeeds or `cancel` fires. The
    /// inserter never loses intent: the only way out of the
    /// loop short of success is cancellation.
    pub async fn publish(
        &self,
        insert_key: &str,
        edition: u64,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> WotResult<()> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.insert_client.insert(insert_key, edition, bytes).await {
                Ok(()) => return Ok(()),
                Err(_) => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.backoff.delay_for_attempt(attempt, &self.random);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CountingRandom, SystemClock};
    use crate::model::identity::Identity;
    use crate::queue::DedupQueue;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;

    struct FlakyFetch {
        calls: AtomicU32,
    }

    #[async_trait]
    impl FetchClient for FlakyFetch {
        async fn fetch(&self, _request_key: &str, edition_hint: u64) -> WotResult<FetchOutcome> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(crate::error::WotError::Transient("network blip".into()))
            } else {
                Ok(FetchOutcome::Found {
                    edition: edition_hint,
                    bytes: vec![1, 2, 3],
                })
            }
        }
    }

    #[tokio::test]
    async fn downloader_retries_transient_failure_then_succeeds() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let queue: Arc<dyn IdentityFileQueue> = Arc::new(DedupQueue::new(Arc::new(SystemClock)));
        let fetch_client = Arc::new(FlakyFetch {
            calls: AtomicU32::new(0),
        });
        let downloader = Downloader::new(
            store,
            queue.clone(),
            fetch_client,
            Arc::new(SystemClock),
            Arc::new(CountingRandom::new(1)),
        );
        let id = Id::new_unchecked(format!("{}{:02}", "G".repeat(41), 1));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let handle = tokio::spawn(async move {
            downloader
                .run(id, "rk".into(), 0, cancel_clone)
                .await
                .unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        let _ = handle.await;
        assert_eq!(queue.size() + 1, 2); // queued file plus the in-flight accounting baseline
    }

    struct AlwaysPermanentFetch;

    #[async_trait]
    impl FetchClient for AlwaysPermanentFetch {
        async fn fetch(&self, _request_key: &str, _edition_hint: u64) -> WotResult<FetchOutcome> {
            Err(crate::error::WotError::CorruptedData("bad document".into()))
        }
    }

    #[tokio::test]
    async fn permanent_failure_marks_parsing_failed() {
        let store = Arc::new(MemoryStore::new());
        let id = Id::new_unchecked(format!("{}{:02}", "G".repeat(41), 2));
        {
            let mut txn = store.transaction().unwrap();
            txn.put_identity(&Identity::new_non_own(id.clone(), "rk", Utc::now()))
                .unwrap();
            txn.commit().unwrap();
        }
        let queue: Arc<dyn IdentityFileQueue> = Arc::new(DedupQueue::new(Arc::new(SystemClock)));
        let downloader = Downloader::new(
            store.clone(),
            queue,
            Arc::new(AlwaysPermanentFetch),
            Arc::new(SystemClock),
            Arc::new(CountingRandom::new(2)),
        );
        downloader
            .run(id.clone(), "rk".into(), 0, CancellationToken::new())
            .await
            .unwrap();

        let txn = store.transaction().unwrap();
        let stored = txn.get_identity(&id).unwrap().unwrap();
        assert_eq!(stored.fetch_state, FetchState::ParsingFailed);
    }
}
