//! In-memory entity store: a live table plus secondary indices behind a
//! `RwLock`. Used by
//! unit/integration tests and anywhere a durable backend would be
//! wasteful; a whole-state copy-on-write snapshot gives it the same
//! transactional isolation as [`super::sqlite::SqliteStore`].

use super::{EntityStore, Transaction};
use crate::error::{WotError, WotResult};
use crate::ids::Id;
use crate::model::identity::Identity;
use crate::model::{
    IntroductionPuzzle, Notification, Score, ScoreSelector, Subscription, SubscriptionKind, Trust,
};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::collections::BTreeMap;

#[derive(Default, Clone)]
struct StoreState {
    identities: BTreeMap<String, Identity>,
    trusts: BTreeMap<(String, String), Trust>,
    scores: BTreeMap<(String, String), Score>,
    subscriptions: BTreeMap<String, Subscription>,
    notifications: BTreeMap<String, Vec<Notification>>,
    sequence_counters: BTreeMap<String, u64>,
    puzzles: BTreeMap<String, IntroductionPuzzle>,
}

/// Dashmap-free in-memory store. A single `RwLock<StoreState>` stands in
/// for per-index concurrent maps: `transaction()` takes the write side of
/// that lock and holds it for the transaction's whole lifetime (released
/// on drop or commit), so two transactions can never interleave their
/// mutations the way two independent `DashMap` updates could.
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }
}

impl EntityStore for MemoryStore {
    fn transaction(&self) -> WotResult<Box<dyn Transaction + '_>> {
        let guard = self.state.write();
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction {
            _guard: guard,
            staged,
            committed: false,
        }))
    }
}

/// Holds the store's write guard for the transaction's entire life, so a
/// second `transaction()` call blocks until this one commits or drops.
/// Mutations land in `staged`, a copy-on-write scratch space, and are
/// only made visible by [`MemoryTransaction::commit`] swapping it into
/// the locked state; an uncommitted transaction rolls back by simply
/// releasing the guard with `staged` discarded.
struct MemoryTransaction<'s> {
    _guard: RwLockWriteGuard<'s, StoreState>,
    staged: StoreState,
    committed: bool,
}

impl Transaction for MemoryTransaction<'_> {
    fn put_identity(&mut self, identity: &Identity) -> WotResult<()> {
        self.staged
            .identities
            .insert(identity.id.as_str().to_string(), identity.clone());
        Ok(())
    }

    fn get_identity(&self, id: &Id) -> WotResult<Option<Identity>> {
        Ok(self.staged.identities.get(id.as_str()).cloned())
    }

    fn delete_identity(&mut self, id: &Id) -> WotResult<()> {
        self.staged.identities.remove(id.as_str());
        Ok(())
    }

    fn identity_by_request_key(&self, key: &str) -> WotResult<Option<Identity>> {
        Ok(self
            .staged
            .identities
            .values()
            .find(|i| i.request_address.key == key)
            .cloned())
    }

    fn all_own_identities(&self) -> WotResult<Vec<Identity>> {
        Ok(self
            .staged
            .identities
            .values()
            .filter(|i| i.is_own())
            .cloned()
            .collect())
    }

    fn all_identities(&self) -> WotResult<Vec<Identity>> {
        Ok(self.staged.identities.values().cloned().collect())
    }

    fn put_trust(&mut self, trust: &Trust) -> WotResult<()> {
        let key = (
            trust.truster.as_str().to_string(),
            trust.trustee.as_str().to_string(),
        );
        self.staged.trusts.insert(key, trust.clone());
        Ok(())
    }

    fn get_trust(&self, truster: &Id, trustee: &Id) -> WotResult<Option<Trust>> {
        Ok(self
            .staged
            .trusts
            .get(&(truster.as_str().to_string(), trustee.as_str().to_string()))
            .cloned())
    }

    fn delete_trust(&mut self, truster: &Id, trustee: &Id) -> WotResult<()> {
        self.staged
            .trusts
            .remove(&(truster.as_str().to_string(), trustee.as_str().to_string()));
        Ok(())
    }

    fn trusts_by_truster(&self, truster: &Id) -> WotResult<Vec<Trust>> {
        Ok(self
            .staged
            .trusts
            .values()
            .filter(|t| &t.truster == truster)
            .cloned()
            .collect())
    }

    fn trusts_by_trustee(&self, trustee: &Id) -> WotResult<Vec<Trust>> {
        Ok(self
            .staged
            .trusts
            .values()
            .filter(|t| &t.trustee == trustee)
            .cloned()
            .collect())
    }

    fn trusts_by_truster_older_than(&self, truster: &Id, edition: u64) -> WotResult<Vec<Trust>> {
        Ok(self
            .staged
            .trusts
            .values()
            .filter(|t| &t.truster == truster && t.truster_edition < edition)
            .cloned()
            .collect())
    }

    fn all_trusts(&self) -> WotResult<Vec<Trust>> {
        Ok(self.staged.trusts.values().cloned().collect())
    }

    fn put_score(&mut self, score: &Score) -> WotResult<()> {
        let key = (
            score.truster.as_str().to_string(),
            score.trustee.as_str().to_string(),
        );
        self.staged.scores.insert(key, score.clone());
        Ok(())
    }

    fn get_score(&self, truster: &Id, trustee: &Id) -> WotResult<Option<Score>> {
        Ok(self
            .staged
            .scores
            .get(&(truster.as_str().to_string(), trustee.as_str().to_string()))
            .cloned())
    }

    fn delete_score(&mut self, truster: &Id, trustee: &Id) -> WotResult<()> {
        self.staged
            .scores
            .remove(&(truster.as_str().to_string(), trustee.as_str().to_string()));
        Ok(())
    }

    fn scores_by_truster(&self, truster: &Id) -> WotResult<Vec<Score>> {
        Ok(self
            .staged
            .scores
            .values()
            .filter(|s| &s.truster == truster)
            .cloned()
            .collect())
    }

    fn scores_by_trustee(&self, trustee: &Id) -> WotResult<Vec<Score>> {
        Ok(self
            .staged
            .scores
            .values()
            .filter(|s| &s.trustee == trustee)
            .cloned()
            .collect())
    }

    fn identities_by_score_selector(
        &self,
        truster: &Id,
        selector: ScoreSelector,
    ) -> WotResult<Vec<Score>> {
        Ok(self
            .staged
            .scores
            .values()
            .filter(|s| &s.truster == truster && selector.matches(s.value))
            .cloned()
            .collect())
    }

    fn put_subscription(&mut self, sub: &Subscription) -> WotResult<()> {
        self.staged
            .subscriptions
            .insert(sub.id.clone(), sub.clone());
        Ok(())
    }

    fn get_subscription(&self, id: &str) -> WotResult<Option<Subscription>> {
        Ok(self.staged.subscriptions.get(id).cloned())
    }

    fn delete_subscription(&mut self, id: &str) -> WotResult<()> {
        self.staged.subscriptions.remove(id);
        self.staged.notifications.remove(id);
        self.staged.sequence_counters.remove(id);
        Ok(())
    }

    fn subscription_by_client_and_kind(
        &self,
        client_id: &str,
        kind: SubscriptionKind,
    ) -> WotResult<Option<Subscription>> {
        Ok(self
            .staged
            .subscriptions
            .values()
            .find(|s| s.client_id == client_id && s.kind == kind)
            .cloned())
    }

    fn push_notification(&mut self, notification: &Notification) -> WotResult<()> {
        self.staged
            .notifications
            .entry(notification.subscription_id.clone())
            .or_default()
            .push(notification.clone());
        Ok(())
    }

    fn notifications_after(
        &self,
        subscription_id: &str,
        after_sequence: u64,
    ) -> WotResult<Vec<Notification>> {
        Ok(self
            .staged
            .notifications
            .get(subscription_id)
            .map(|v| {
                v.iter()
                    .filter(|n| n.sequence_number > after_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn next_sequence_number(&mut self, subscription_id: &str) -> WotResult<u64> {
        let counter = self
            .staged
            .sequence_counters
            .entry(subscription_id.to_string())
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    fn put_puzzle(&mut self, puzzle: &IntroductionPuzzle) -> WotResult<()> {
        self.staged
            .puzzles
            .insert(puzzle.id.clone(), puzzle.clone());
        Ok(())
    }

    fn get_puzzle(&self, id: &str) -> WotResult<Option<IntroductionPuzzle>> {
        Ok(self.staged.puzzles.get(id).cloned())
    }

    fn delete_puzzle(&mut self, id: &str) -> WotResult<()> {
        self.staged.puzzles.remove(id);
        Ok(())
    }

    fn puzzles_by_inserter(&self, inserter: &Id) -> WotResult<Vec<IntroductionPuzzle>> {
        Ok(self
            .staged
            .puzzles
            .values()
            .filter(|p| &p.inserter == inserter)
            .cloned()
            .collect())
    }

    fn all_puzzles(&self) -> WotResult<Vec<IntroductionPuzzle>> {
        Ok(self.staged.puzzles.values().cloned().collect())
    }

    fn commit(mut self: Box<Self>) -> WotResult<()> {
        if self.committed {
            return Err(WotError::Fatal("transaction already committed".into()));
        }
        *self._guard = std::mem::take(&mut self.staged);
        self.committed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::identity::Identity;
    use chrono::Utc;

    fn id(n: u8) -> Id {
        Id::new_unchecked(format!("{}{:02}", "A".repeat(41), n))
    }

    #[test]
    fn uncommitted_transaction_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut txn = store.transaction().unwrap();
            txn.put_identity(&Identity::new_non_own(id(1), "k", Utc::now()))
                .unwrap();
            // dropped without commit
        }
        let txn = store.transaction().unwrap();
        assert!(txn.get_identity(&id(1)).unwrap().is_none());
    }

    #[test]
    fn committed_transaction_is_visible_to_later_transactions() {
        let store = MemoryStore::new();
        {
            let mut txn = store.transaction().unwrap();
            txn.put_identity(&Identity::new_non_own(id(1), "k", Utc::now()))
                .unwrap();
            Box::new(txn).commit().unwrap();
        }
        let txn = store.transaction().unwrap();
        assert!(txn.get_identity(&id(1)).unwrap().is_some());
    }

    #[test]
    fn sequence_numbers_are_dense_and_monotonic() {
        let store = MemoryStore::new();
        let mut txn = store.transaction().unwrap();
        assert_eq!(txn.next_sequence_number("sub1").unwrap(), 1);
        assert_eq!(txn.next_sequence_number("sub1").unwrap(), 2);
        assert_eq!(txn.next_sequence_number("sub2").unwrap(), 1);
    }
}
