//! Decentralized web-of-trust engine: the trust graph, identity
//! import/publish pipeline, change subscriptions, introduction protocol,
//! and FCP-style control surface.
//!
//! [`Engine`] is the facade a daemon (see `src/bin/wotd.rs`) or an
//! embedding application wires up: it owns the entity store, the trust
//! graph, the identity-file queue, and the subscription manager, and
//! constructs the introduction subsystem and control dispatcher on top
//! of them. Nothing in this crate reaches for a process-wide singleton —
//! every component takes its [`capability::Clock`]/[`capability::RandomSource`]
//! and collaborator `Arc`s as constructor arguments.

pub mod capability;
pub mod config;
pub mod control;
pub mod downloader;
pub mod error;
pub mod graph;
pub mod ids;
pub mod introduction;
pub mod model;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod subscription;
pub mod xml;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use config::{EngineConfig, QueueKind, StoreBackend};
use control::Dispatcher;
use downloader::{CancellationToken, Downloader, FetchClient, InsertClient, Inserter};
use error::{WotError, WotResult};
use graph::TrustGraphEngine;
use ids::Id;
use introduction::{ClientPuzzlePool, IntroductionServer, PuzzleFactory, PuzzleInsertClient};
use introduction::{Candidate, PuzzleDownloadClient, SolutionInsertClient};
use model::identity::Context;
use queue::{DedupQueue, FifoQueue, IdentityFileQueue};
use scheduler::{DelayedJob, JobRunnable};
use store::{EntityStore, MemoryStore, SqliteStore};
use subscription::SubscriptionManager;
use tokio::task::JoinHandle;
use uuid::Uuid;
use xml::{AdvertisedTrust, IdentityDocument, QuickXmlCodec, XmlCodec};

pub use capability::Capabilities;

/// Everything an embedder needs to run the engine: the wired-up store,
/// graph, queue, subscriptions, introduction subsystem, and control
/// dispatcher. `Engine::open` itself is synchronous and side-effect-free
/// beyond opening the store — it starts no background tasks other than
/// what [`SubscriptionManager::subscribe`] spawns per-subscription.
/// Once an embedder has a fetch/insert/puzzle-download client to hand it,
/// [`Engine::run_background_jobs`] spawns the coalescing
/// [`scheduler::DelayedJob`]s that keep identities-of-interest fetched,
/// own identities republished, and the client introduction pool fed.
pub struct Engine {
    pub config: EngineConfig,
    pub capabilities: Capabilities,
    pub store: Arc<dyn EntityStore>,
    pub graph: Arc<TrustGraphEngine>,
    pub queue: Arc<dyn IdentityFileQueue>,
    pub codec: Arc<dyn XmlCodec>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub client_puzzle_pool: Arc<ClientPuzzlePool>,
}

impl Engine {
    /// Opens the configured store backend and wires up the graph,
    /// queue, subscription manager, and client-side introduction pool.
    /// Does not construct [`IntroductionServer`] or [`Dispatcher`] —
    /// those need externally-supplied insert/fetch clients for the
    /// underlying network primitives, so callers build them
    /// with [`Engine::introduction_server`] / [`Engine::dispatcher`]
    /// once they have one.
    pub fn open(config: EngineConfig, capabilities: Capabilities) -> WotResult<Self> {
        let store: Arc<dyn EntityStore> = match config.store_backend {
            StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.db_path)?),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };
        Self::with_store(config, capabilities, store)
    }

    /// Variant of [`Engine::open`] that always uses the in-process
    /// [`MemoryStore`], ignoring `config.store_backend`. Used by tests
    /// and scratch runs that want a non-durable store regardless of
    /// what the environment is configured for.
    pub fn open_in_memory(config: EngineConfig, capabilities: Capabilities) -> WotResult<Self> {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        Self::with_store(config, capabilities, store)
    }

    fn with_store(
        config: EngineConfig,
        capabilities: Capabilities,
        store: Arc<dyn EntityStore>,
    ) -> WotResult<Self> {
        let subscriptions = Arc::new(SubscriptionManager::new(store.clone()));
        let graph = Arc::new(TrustGraphEngine::new(
            capabilities.clock.clone(),
            subscriptions.clone(),
        ));
        let queue: Arc<dyn IdentityFileQueue> = match config.queue_kind {
            QueueKind::Dedup => Arc::new(DedupQueue::new(capabilities.clock.clone())),
            QueueKind::Fifo => Arc::new(FifoQueue::new(capabilities.clock.clone())),
        };
        let codec: Arc<dyn XmlCodec> = Arc::new(QuickXmlCodec);
        let client_puzzle_pool = Arc::new(ClientPuzzlePool::new(
            store.clone(),
            codec.clone(),
            capabilities.clock.clone(),
            config.introduction_score_threshold,
        ));

        Ok(Self {
            config,
            capabilities,
            store,
            graph,
            queue,
            codec,
            subscriptions,
            client_puzzle_pool,
        })
    }

    /// Imports and relaxes a single queued identity file, if any is
    /// waiting. Returns `false` if the queue was empty.
    /// Callers typically drive this from a loop or a dedicated task;
    /// the engine itself doesn't spawn one (`EngineConfig` carries no
    /// "poll interval" — the importer is driven, not self-scheduling).
    pub fn import_one_queued_file(&self) -> WotResult<bool> {
        let changed = downloader::run_importer_once(
            &*self.queue,
            &*self.store,
            &*self.codec,
            &self.graph,
            &*self.capabilities.clock,
            &self.subscriptions,
        )?;
        if changed {
            self.subscriptions.wake(model::SubscriptionKind::Identities);
            self.subscriptions.wake(model::SubscriptionKind::Trusts);
            self.subscriptions.wake(model::SubscriptionKind::Scores);
        }
        Ok(changed)
    }

    /// Builds the server-side introduction subsystem against a caller-
    /// supplied puzzle-insert client (the out-of-scope content-addressed
    /// insert primitive).
    pub fn introduction_server(
        &self,
        insert_client: Arc<dyn PuzzleInsertClient>,
        random: Arc<dyn capability::RandomSource>,
    ) -> IntroductionServer {
        IntroductionServer::new(
            self.store.clone(),
            self.graph.clone(),
            PuzzleFactory::new(random, Arc::new(introduction::PlaceholderRenderer)),
            insert_client,
            self.codec.clone(),
            self.capabilities.clock.clone(),
            self.subscriptions.clone(),
        )
    }

    /// Builds the FCP-style [`Dispatcher`] against a caller-supplied
    /// solution-insert client.
    pub fn dispatcher(&self, solution_insert_client: Arc<dyn SolutionInsertClient>) -> Dispatcher {
        Dispatcher::new(
            self.store.clone(),
            self.graph.clone(),
            self.subscriptions.clone(),
            self.client_puzzle_pool.clone(),
            solution_insert_client,
            self.capabilities.clock.clone(),
        )
    }

    /// Identities the engine should keep fetching: anyone reachable with
    /// positive capacity from any own identity's perspective, plus anyone
    /// an own identity has given an explicit positive trust value (§4.5) —
    /// a fresh own→trustee edge is worth fetching before the graph engine
    /// has had a chance to derive a Score for it at all.
    pub fn identities_of_interest(&self) -> WotResult<Vec<Id>> {
        let txn = self.store.transaction()?;
        let owners = txn.all_own_identities()?;
        let mut interesting: BTreeSet<Id> = BTreeSet::new();
        for owner in &owners {
            for score in txn.scores_by_truster(&owner.id)? {
                if score.capacity > 0 {
                    interesting.insert(score.trustee);
                }
            }
            for trust in txn.trusts_by_truster(&owner.id)? {
                if trust.value.get() > 0 {
                    interesting.insert(trust.trustee);
                }
            }
        }
        Ok(interesting.into_iter().collect())
    }

    /// Spawns the three background jobs that make the downloader,
    /// inserter, and client-side introduction pool actually run: a
    /// coalescing fetch-reconciliation job that keeps one [`Downloader`]
    /// task alive per [`Engine::identities_of_interest`], one coalescing
    /// own-identity republish job per `OwnIdentity` debounced per
    /// `config.insert_debounce_seconds` (C8), and a coalescing client
    /// puzzle poll job that drives [`ClientPuzzlePool`]. Each job is
    /// additionally re-triggered on a fixed interval by a plain ticker
    /// task, since [`DelayedJob`] itself only coalesces triggers it is
    /// given — it has no timer of its own.
    pub fn run_background_jobs(
        self: Arc<Self>,
        fetch_client: Arc<dyn FetchClient>,
        insert_client: Arc<dyn InsertClient>,
        puzzle_download_client: Arc<dyn PuzzleDownloadClient>,
    ) -> WotResult<BackgroundJobs> {
        let active_fetches: Arc<parking_lot::Mutex<HashMap<Id, ActiveFetch>>> =
            Arc::new(parking_lot::Mutex::new(HashMap::new()));

        let fetch_reconciliation = Arc::new(DelayedJob::spawn(fetch_reconciliation_runnable(
            self.clone(),
            fetch_client,
            active_fetches.clone(),
        )));
        fetch_reconciliation.trigger_now();
        let fetch_ticker = spawn_ticker(
            fetch_reconciliation.clone(),
            Duration::from_secs(self.config.fetch_reconciliation_interval_seconds.max(1)),
        );

        let owners = {
            let txn = self.store.transaction()?;
            txn.all_own_identities()?
        };
        let mut own_identity_jobs = Vec::with_capacity(owners.len());
        for owner in owners {
            let job = Arc::new(DelayedJob::spawn(own_identity_publish_runnable(
                self.clone(),
                insert_client.clone(),
                owner.id,
            )));
            job.trigger_now();
            own_identity_jobs.push(job);
        }
        let insert_ticker = spawn_ticker_many(
            own_identity_jobs.clone(),
            Duration::from_secs(self.config.insert_debounce_seconds.max(1)),
        );

        let client_puzzle_job = Arc::new(DelayedJob::spawn(client_puzzle_poll_runnable(
            self.clone(),
            puzzle_download_client,
        )));
        client_puzzle_job.trigger_now();
        let client_puzzle_ticker = spawn_ticker(
            client_puzzle_job.clone(),
            Duration::from_secs(self.config.client_introduction_poll_interval_seconds.max(1)),
        );

        Ok(BackgroundJobs {
            fetch_reconciliation,
            fetch_ticker,
            own_identity_jobs,
            insert_ticker,
            client_puzzle_job,
            client_puzzle_ticker,
            active_fetches,
        })
    }

    fn reconcile_fetches(
        &self,
        fetch_client: &Arc<dyn FetchClient>,
        active: &parking_lot::Mutex<HashMap<Id, ActiveFetch>>,
    ) -> WotResult<()> {
        let interesting: BTreeSet<Id> = self.identities_of_interest()?.into_iter().collect();

        let mut guard = active.lock();
        guard.retain(|id, fetch| {
            if interesting.contains(id) {
                true
            } else {
                fetch.cancel.cancel();
                false
            }
        });

        let txn = self.store.transaction()?;
        for id in &interesting {
            if guard.contains_key(id) {
                continue;
            }
            let identity = match txn.get_identity(id)? {
                Some(identity) if !identity.is_own() => identity,
                _ => continue,
            };
            let downloader = Downloader::new(
                self.store.clone(),
                self.queue.clone(),
                fetch_client.clone(),
                self.capabilities.clock.clone(),
                self.capabilities.random.clone(),
            );
            let cancel = CancellationToken::new();
            let task_cancel = cancel.clone();
            let task_id = id.clone();
            let request_key = identity.request_address.key.clone();
            let edition_hint = identity.edition_hint;
            let handle = tokio::spawn(async move {
                let _ = downloader.run(task_id, request_key, edition_hint, task_cancel).await;
            });
            guard.insert(id.clone(), ActiveFetch { cancel, handle });
        }
        Ok(())
    }

    async fn publish_own_identity(
        &self,
        insert_client: Arc<dyn InsertClient>,
        owner: Id,
    ) -> WotResult<()> {
        let (identity, trust_list) = {
            let txn = self.store.transaction()?;
            let identity = txn
                .get_identity(&owner)?
                .ok_or_else(|| WotError::UnknownIdentity(owner.to_string()))?;
            let trusts = txn.trusts_by_truster(&owner)?;
            (identity, trusts)
        };
        let own = identity
            .own
            .as_ref()
            .ok_or_else(|| WotError::InvalidParameter("owner is not an OwnIdentity".into()))?;

        let advertised: Vec<AdvertisedTrust> = trust_list
            .into_iter()
            .map(|trust| AdvertisedTrust {
                trustee: trust.trustee,
                value: trust.value.get(),
                comment: trust.comment.as_str().to_string(),
            })
            .collect();
        let document = IdentityDocument::from_identity(&identity, advertised);
        let bytes = self.codec.encode_identity(&document)?;
        let edition = identity.request_address.edition + 1;

        let inserter = Inserter::new(insert_client, self.capabilities.random.clone());
        let cancel = CancellationToken::new();
        inserter
            .publish(&own.insert_address, edition, &bytes, &cancel)
            .await?;

        let mut txn = self.store.transaction()?;
        if let Some(mut stored) = txn.get_identity(&owner)? {
            stored.request_address.edition = edition;
            if let Some(own) = stored.own.as_mut() {
                own.last_insert_date = Some(self.capabilities.clock.now());
            }
            txn.put_identity(&stored)?;
        }
        txn.commit()
    }

    async fn poll_client_puzzles(
        &self,
        client: Arc<dyn PuzzleDownloadClient>,
    ) -> WotResult<()> {
        let introduction_context = Context::parse(introduction::client::INTRODUCTION_CONTEXT)?;
        let candidates = {
            let txn = self.store.transaction()?;
            let owners = txn.all_own_identities()?;
            let mut best_scores: HashMap<Id, i64> = HashMap::new();
            for owner in &owners {
                for score in txn.scores_by_truster(&owner.id)? {
                    let trustee = score.trustee.clone();
                    best_scores
                        .entry(trustee)
                        .and_modify(|best| {
                            if score.value > *best {
                                *best = score.value;
                            }
                        })
                        .or_insert(score.value);
                }
            }
            txn.all_identities()?
                .into_iter()
                .filter(|identity| !identity.is_own() && identity.contexts.contains(&introduction_context))
                .map(|identity| {
                    let best_score = best_scores.get(&identity.id).copied().unwrap_or(0);
                    Candidate { identity: identity.id, best_score }
                })
                .collect::<Vec<_>>()
        };

        let selected = self.client_puzzle_pool.select_candidates(candidates)?;
        let today = self.capabilities.clock.now().date_naive();
        for (index, source) in selected.into_iter().enumerate() {
            let puzzle_id = ids::puzzle_id(&Uuid::new_v4(), &source);
            let address = ids::puzzle_insertion_address(&source, today, index as u32);
            if let Err(err) = self
                .client_puzzle_pool
                .download_puzzle(
                    client.as_ref(),
                    &source,
                    puzzle_id,
                    &address,
                    today,
                    index as u32,
                    "image/png".to_string(),
                )
                .await
            {
                log::warn!("downloading introduction puzzle from {source}: {err}");
            }
        }
        Ok(())
    }
}

fn fetch_reconciliation_runnable(
    engine: Arc<Engine>,
    fetch_client: Arc<dyn FetchClient>,
    active_fetches: Arc<parking_lot::Mutex<HashMap<Id, ActiveFetch>>>,
) -> JobRunnable {
    Arc::new(move |_cancel: Arc<AtomicBool>| {
        let engine = engine.clone();
        let fetch_client = fetch_client.clone();
        let active_fetches = active_fetches.clone();
        Box::pin(async move {
            if let Err(err) = engine.reconcile_fetches(&fetch_client, &active_fetches) {
                log::warn!("fetch reconciliation failed: {err}");
            }
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    })
}

fn own_identity_publish_runnable(
    engine: Arc<Engine>,
    insert_client: Arc<dyn InsertClient>,
    owner: Id,
) -> JobRunnable {
    Arc::new(move |_cancel: Arc<AtomicBool>| {
        let engine = engine.clone();
        let insert_client = insert_client.clone();
        let owner = owner.clone();
        Box::pin(async move {
            if let Err(err) = engine.publish_own_identity(insert_client, owner).await {
                log::warn!("own-identity publish failed: {err}");
            }
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    })
}

fn client_puzzle_poll_runnable(
    engine: Arc<Engine>,
    puzzle_download_client: Arc<dyn PuzzleDownloadClient>,
) -> JobRunnable {
    Arc::new(move |_cancel: Arc<AtomicBool>| {
        let engine = engine.clone();
        let puzzle_download_client = puzzle_download_client.clone();
        Box::pin(async move {
            if let Err(err) = engine.poll_client_puzzles(puzzle_download_client).await {
                log::warn!("client puzzle poll failed: {err}");
            }
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    })
}

fn spawn_ticker(job: Arc<DelayedJob>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            job.trigger_now();
        }
    })
}

fn spawn_ticker_many(jobs: Vec<Arc<DelayedJob>>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for job in &jobs {
                job.trigger_now();
            }
        }
    })
}

/// One in-flight per-identity fetch loop, tracked so
/// [`Engine::reconcile_fetches`] can cancel it once the identity drops out
/// of [`Engine::identities_of_interest`].
struct ActiveFetch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Handle to the background jobs spawned by [`Engine::run_background_jobs`].
/// Dropping it does not stop the jobs — call [`BackgroundJobs::shutdown`]
/// for that; it aborts the ticker tasks, terminates each [`DelayedJob`],
/// and cancels every in-flight per-identity fetch.
pub struct BackgroundJobs {
    fetch_reconciliation: Arc<DelayedJob>,
    fetch_ticker: JoinHandle<()>,
    own_identity_jobs: Vec<Arc<DelayedJob>>,
    insert_ticker: JoinHandle<()>,
    client_puzzle_job: Arc<DelayedJob>,
    client_puzzle_ticker: JoinHandle<()>,
    active_fetches: Arc<parking_lot::Mutex<HashMap<Id, ActiveFetch>>>,
}

impl BackgroundJobs {
    pub fn shutdown(&self) {
        self.fetch_ticker.abort();
        self.insert_ticker.abort();
        self.client_puzzle_ticker.abort();
        self.fetch_reconciliation.terminate();
        for job in &self.own_identity_jobs {
            job.terminate();
        }
        self.client_puzzle_job.terminate();
        for fetch in self.active_fetches.lock().values() {
            fetch.cancel.cancel();
            fetch.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_wires_up_without_error() {
        let engine = Engine::open_in_memory(EngineConfig::default(), Capabilities::system())
            .expect("in-memory engine should open");
        assert_eq!(engine.subscriptions.active_count(), 0);
        assert!(!engine.import_one_queued_file().unwrap());
    }
}
