//! Entity store (C1): durable CRUD plus the secondary indices the graph
//! engine, importer, and control surface need.
//!
//! Every mutating operation participates in an explicit [`Transaction`]
//! object: the old "Persistent" base-class activate/store/
//! delete dance is replaced by `get`/`put`/`delete` on a transaction, one
//! repository surface per entity kind. The store never commits on its
//! own; the caller must call [`Transaction::commit`] or let the
//! transaction drop to roll back — any read/write error aborts
//! the enclosing transaction.

pub mod memory;
pub mod sqlite;

use crate::error::WotResult;
use crate::ids::Id;
use crate::model::{
    IntroductionPuzzle, Notification, Score, ScoreSelector, Subscription, SubscriptionKind, Trust,
};
use crate::model::identity::Identity;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A store capable of starting transactions. Readers use
/// [`EntityStore::transaction`] the same way writers do — a read-only
/// caller simply never calls `commit`, which is equivalent to a read
/// snapshot under the engine's shared lock: every iterator returned from
/// a transaction reflects a consistent snapshot of that transaction alone.
pub trait EntityStore: Send + Sync {
    fn transaction(&self) -> WotResult<Box<dyn Transaction + '_>>;
}

/// An open transaction against the store. Every method either succeeds or
/// returns an error that the caller should treat as aborting the whole
/// transaction (the transaction is then dropped without committing).
pub trait Transaction: Send {
    // ── Identity ────────────────────────────────────────────────────
    fn put_identity(&mut self, identity: &Identity) -> WotResult<()>;
    fn get_identity(&self, id: &Id) -> WotResult<Option<Identity>>;
    fn delete_identity(&mut self, id: &Id) -> WotResult<()>;
    fn identity_by_request_key(&self, key: &str) -> WotResult<Option<Identity>>;
    fn all_own_identities(&self) -> WotResult<Vec<Identity>>;
    fn all_identities(&self) -> WotResult<Vec<Identity>>;

    // ── Trust ───────────────────────────────────────────────────────
    fn put_trust(&mut self, trust: &Trust) -> WotResult<()>;
    fn get_trust(&self, truster: &Id, trustee: &Id) -> WotResult<Option<Trust>>;
    fn delete_trust(&mut self, truster: &Id, trustee: &Id) -> WotResult<()>;
    fn trusts_by_truster(&self, truster: &Id) -> WotResult<Vec<Trust>>;
    fn trusts_by_trustee(&self, trustee: &Id) -> WotResult<Vec<Trust>>;
    fn trusts_by_truster_older_than(&self, truster: &Id, edition: u64) -> WotResult<Vec<Trust>>;
    fn all_trusts(&self) -> WotResult<Vec<Trust>>;

    // ── Score ───────────────────────────────────────────────────────
    fn put_score(&mut self, score: &Score) -> WotResult<()>;
    fn get_score(&self, truster: &Id, trustee: &Id) -> WotResult<Option<Score>>;
    fn delete_score(&mut self, truster: &Id, trustee: &Id) -> WotResult<()>;
    fn scores_by_truster(&self, truster: &Id) -> WotResult<Vec<Score>>;
    fn scores_by_trustee(&self, trustee: &Id) -> WotResult<Vec<Score>>;
    fn identities_by_score_selector(
        &self,
        truster: &Id,
        selector: ScoreSelector,
    ) -> WotResult<Vec<Score>>;

    // ── Subscription / Notification ─────────────────────────────────
    fn put_subscription(&mut self, sub: &Subscription) -> WotResult<()>;
    fn get_subscription(&self, id: &str) -> WotResult<Option<Subscription>>;
    fn delete_subscription(&mut self, id: &str) -> WotResult<()>;
    fn subscription_by_client_and_kind(
        &self,
        client_id: &str,
        kind: SubscriptionKind,
    ) -> WotResult<Option<Subscription>>;
    fn push_notification(&mut self, notification: &Notification) -> WotResult<()>;
    fn notifications_after(
        &self,
        subscription_id: &str,
        after_sequence: u64,
    ) -> WotResult<Vec<Notification>>;
    fn next_sequence_number(&mut self, subscription_id: &str) -> WotResult<u64>;

    // ── IntroductionPuzzle ───────────────────────────────────────────
    fn put_puzzle(&mut self, puzzle: &IntroductionPuzzle) -> WotResult<()>;
    fn get_puzzle(&self, id: &str) -> WotResult<Option<IntroductionPuzzle>>;
    fn delete_puzzle(&mut self, id: &str) -> WotResult<()>;
    fn puzzles_by_inserter(&self, inserter: &Id) -> WotResult<Vec<IntroductionPuzzle>>;
    fn all_puzzles(&self) -> WotResult<Vec<IntroductionPuzzle>>;

    /// Commit all writes made through this transaction. Consumes the
    /// transaction; dropping it without calling this rolls back.
    fn commit(self: Box<Self>) -> WotResult<()>;
}
