//! Trust-graph engine (C2): the algorithmic core that keeps Score
//! invariants consistent as Identity/Trust rows mutate.

pub mod import;
pub mod rank;

use crate::capability::Clock;
use crate::error::WotResult;
use crate::ids::Id;
use crate::model::trust::{Comment, Trust, TrustValue};
use crate::model::SubscriptionKind;
use crate::store::Transaction;
use crate::subscription::SubscriptionManager;
use std::collections::HashMap;
use std::sync::Arc;

pub use import::AdvertisedEdge;

/// Trust-graph algorithms, parameterized by a clock so `lastChangeDate`
/// stamping is deterministic in tests, and by the subscription manager
/// every Trust/Score mutation is reported to (C2 "emits change events
/// into the subscription manager"). Notifications are written inside the
/// same transaction as the entity mutation they describe; callers must
/// call [`SubscriptionManager::wake`] after the transaction commits.
pub struct TrustGraphEngine {
    clock: Arc<dyn Clock>,
    subscriptions: Arc<SubscriptionManager>,
}

impl TrustGraphEngine {
    pub fn new(clock: Arc<dyn Clock>, subscriptions: Arc<SubscriptionManager>) -> Self {
        Self {
            clock,
            subscriptions,
        }
    }

    /// `setTrust`: create-or-update the edge, then run an
    /// incremental score update for every OwnIdentity. Idempotent when
    /// `(value, comment)` are unchanged — `lastChangeDate` does not
    /// advance in that case.
    pub fn set_trust(
        &self,
        txn: &mut dyn Transaction,
        truster: &Id,
        trustee: &Id,
        value: TrustValue,
        comment: Comment,
    ) -> WotResult<()> {
        let now = self.clock.now();
        let existing = txn.get_trust(truster, trustee)?;
        let changed = match &existing {
            Some(t) => t.value != value || t.comment != comment,
            None => true,
        };
        let edition = existing.as_ref().map(|t| t.truster_edition).unwrap_or(0);
        let last_change_date = if changed {
            now
        } else {
            existing.as_ref().map(|t| t.last_change_date).unwrap_or(now)
        };

        let trust = Trust {
            truster: truster.clone(),
            trustee: trustee.clone(),
            value,
            comment,
            truster_edition: edition,
            last_change_date,
        };
        txn.put_trust(&trust)?;

        if changed {
            self.record_trust_change(txn, existing.as_ref(), Some(&trust))?;
            self.update_scores_for_all_owners(txn, trustee)?;
        }
        Ok(())
    }

    /// `removeTrust`.
    pub fn remove_trust(&self, txn: &mut dyn Transaction, truster: &Id, trustee: &Id) -> WotResult<()> {
        let existing = match txn.get_trust(truster, trustee)? {
            Some(t) => t,
            None => return Ok(()),
        };
        txn.delete_trust(truster, trustee)?;
        self.record_trust_change(txn, Some(&existing), None)?;
        self.update_scores_for_all_owners(txn, trustee)
    }

    fn record_trust_change(
        &self,
        txn: &mut dyn Transaction,
        old: Option<&Trust>,
        new: Option<&Trust>,
    ) -> WotResult<()> {
        let old_snapshot = old.map(serde_json::to_value).transpose().map_err(|e| {
            crate::error::WotError::CorruptedData(format!("serializing trust notification: {e}"))
        })?;
        let new_snapshot = new.map(serde_json::to_value).transpose().map_err(|e| {
            crate::error::WotError::CorruptedData(format!("serializing trust notification: {e}"))
        })?;
        self.subscriptions
            .record_change(txn, SubscriptionKind::Trusts, old_snapshot, new_snapshot)
    }

    /// Import a fetched trust list, then
    /// run incremental updates for every trustee whose edge changed.
    pub fn import_trust_list(
        &self,
        txn: &mut dyn Transaction,
        truster: &Id,
        edges: Vec<AdvertisedEdge>,
        edition: u64,
    ) -> WotResult<()> {
        let now = self.clock.now();
        let touched = import::apply_trust_list(txn, truster, edges, edition, now)?;
        for change in touched {
            self.record_trust_change(txn, change.old.as_ref(), change.new.as_ref())?;
            self.update_scores_for_all_owners(txn, &change.trustee)?;
        }
        Ok(())
    }

    /// Incremental score update for a single changed trustee, across
    /// every OwnIdentity in the store.
    fn update_scores_for_all_owners(&self, txn: &mut dyn Transaction, changed_trustee: &Id) -> WotResult<()> {
        let owners = txn.all_own_identities()?;
        for owner in owners {
            self.update_scores_incremental(txn, &owner.id, changed_trustee)?;
        }
        Ok(())
    }

    fn update_scores_incremental(
        &self,
        txn: &mut dyn Transaction,
        owner: &Id,
        changed_trustee: &Id,
    ) -> WotResult<()> {
        let all_trusts = txn.all_trusts()?;
        let trusts_by_trustee = index_by_trustee(&all_trusts);
        let trusts_by_truster = index_by_truster(&all_trusts);

        let existing_scores = txn.scores_by_truster(owner)?;
        let mut scores: HashMap<Id, crate::model::Score> = existing_scores
            .into_iter()
            .map(|s| (s.trustee.clone(), s))
            .collect();
        scores.insert(owner.clone(), crate::model::Score::own_identity_self_score(owner.clone()));

        let updated = rank::compute_incremental(
            owner,
            changed_trustee,
            &trusts_by_truster,
            &trusts_by_trustee,
            scores.clone(),
        );

        self.write_score_diff(txn, owner, &scores, &updated)
    }

    /// `recomputeAllScores`: O(identities + trusts), used on
    /// startup integrity check, after heuristically-large imports, and as
    /// a repair tool.
    pub fn recompute_all_scores(&self, txn: &mut dyn Transaction, owner: &Id) -> WotResult<()> {
        let all_identities = txn.all_identities()?;
        let ids: Vec<Id> = all_identities.into_iter().map(|i| i.id).collect();
        let all_trusts = txn.all_trusts()?;
        let trusts_by_trustee = index_by_trustee(&all_trusts);

        let existing_scores = txn.scores_by_truster(owner)?;
        let before: HashMap<Id, crate::model::Score> = existing_scores
            .into_iter()
            .map(|s| (s.trustee.clone(), s))
            .collect();

        let updated = rank::compute_scores(owner, &ids, &trusts_by_trustee);

        self.write_score_diff(txn, owner, &before, &updated)
    }

    fn write_score_diff(
        &self,
        txn: &mut dyn Transaction,
        owner: &Id,
        before: &HashMap<Id, crate::model::Score>,
        after: &HashMap<Id, crate::model::Score>,
    ) -> WotResult<()> {
        for (trustee, score) in after {
            if trustee == owner {
                continue;
            }
            let old = before.get(trustee);
            if old != Some(score) {
                txn.put_score(score)?;
                self.record_score_change(txn, old, Some(score))?;
            }
        }
        for (trustee, score) in before {
            if trustee != owner && !after.contains_key(trustee) {
                txn.delete_score(owner, trustee)?;
                self.record_score_change(txn, Some(score), None)?;
            }
        }
        Ok(())
    }

    fn record_score_change(
        &self,
        txn: &mut dyn Transaction,
        old: Option<&crate::model::Score>,
        new: Option<&crate::model::Score>,
    ) -> WotResult<()> {
        let old_snapshot = old.map(serde_json::to_value).transpose().map_err(|e| {
            crate::error::WotError::CorruptedData(format!("serializing score notification: {e}"))
        })?;
        let new_snapshot = new.map(serde_json::to_value).transpose().map_err(|e| {
            crate::error::WotError::CorruptedData(format!("serializing score notification: {e}"))
        })?;
        self.subscriptions
            .record_change(txn, SubscriptionKind::Scores, old_snapshot, new_snapshot)
    }
}

fn index_by_trustee(trusts: &[Trust]) -> HashMap<Id, Vec<&Trust>> {
    let mut map: HashMap<Id, Vec<&Trust>> = HashMap::new();
    for t in trusts {
        map.entry(t.trustee.clone()).or_default().push(t);
    }
    map
}

fn index_by_truster(trusts: &[Trust]) -> HashMap<Id, Vec<&Trust>> {
    let mut map: HashMap<Id, Vec<&Trust>> = HashMap::new();
    for t in trusts {
        map.entry(t.truster.clone()).or_default().push(t);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SystemClock;
    use crate::model::identity::Identity;
    use crate::store::{EntityStore, MemoryStore};
    use chrono::Utc;

    fn id(n: u8) -> Id {
        Id::new_unchecked(format!("{}{:02}", "C".repeat(41), n))
    }

    fn engine() -> TrustGraphEngine {
        let store = Arc::new(MemoryStore::new());
        TrustGraphEngine::new(
            Arc::new(SystemClock),
            Arc::new(crate::subscription::SubscriptionManager::new(store)),
        )
    }

    #[test]
    fn trust_tree_init_has_only_self_score() {
        let store = MemoryStore::new();
        let mut txn = store.transaction().unwrap();
        let a = id(1);
        txn.put_identity(&Identity::new_own(a.clone(), "rk", "iu", Utc::now()))
            .unwrap();
        let score = crate::model::Score::own_identity_self_score(a.clone());
        txn.put_score(&score).unwrap();

        assert_eq!(txn.all_own_identities().unwrap().len(), 1);
        assert_eq!(txn.all_identities().unwrap().len(), 1);
        assert_eq!(txn.scores_by_truster(&a).unwrap().len(), 1);
        assert_eq!(txn.scores_by_truster(&a).unwrap()[0], score);
    }

    #[test]
    fn set_trust_propagates_two_hops() {
        let store = MemoryStore::new();
        let mut txn = store.transaction().unwrap();
        let a = id(1);
        let b = id(2);
        let c = id(3);
        txn.put_identity(&Identity::new_own(a.clone(), "rk", "iu", Utc::now()))
            .unwrap();
        txn.put_identity(&Identity::new_non_own(b.clone(), "rkb", Utc::now()))
            .unwrap();
        txn.put_identity(&Identity::new_non_own(c.clone(), "rkc", Utc::now()))
            .unwrap();

        let eng = engine();
        eng.set_trust(
            &mut *txn,
            &a,
            &b,
            TrustValue::parse(100).unwrap(),
            Comment::empty(),
        )
        .unwrap();
        eng.set_trust(
            &mut *txn,
            &b,
            &c,
            TrustValue::parse(50).unwrap(),
            Comment::empty(),
        )
        .unwrap();

        let sb = txn.get_score(&a, &b).unwrap().unwrap();
        assert_eq!((sb.value, sb.rank, sb.capacity), (100, Some(1), 40));
        let sc = txn.get_score(&a, &c).unwrap().unwrap();
        assert_eq!((sc.value, sc.rank, sc.capacity), (20, Some(2), 16));
    }

    #[test]
    fn set_trust_is_idempotent_when_unchanged() {
        let store = MemoryStore::new();
        let mut txn = store.transaction().unwrap();
        let a = id(1);
        let b = id(2);
        txn.put_identity(&Identity::new_own(a.clone(), "rk", "iu", Utc::now()))
            .unwrap();
        txn.put_identity(&Identity::new_non_own(b.clone(), "rkb", Utc::now()))
            .unwrap();

        let eng = engine();
        eng.set_trust(&mut *txn, &a, &b, TrustValue::parse(10).unwrap(), Comment::empty())
            .unwrap();
        let first = txn.get_trust(&a, &b).unwrap().unwrap();
        eng.set_trust(&mut *txn, &a, &b, TrustValue::parse(10).unwrap(), Comment::empty())
            .unwrap();
        let second = txn.get_trust(&a, &b).unwrap().unwrap();
        assert_eq!(first.last_change_date, second.last_change_date);
    }

    #[test]
    fn removing_trust_cuts_downstream_score() {
        let store = MemoryStore::new();
        let mut txn = store.transaction().unwrap();
        let a = id(1);
        let b = id(2);
        let c = id(3);
        txn.put_identity(&Identity::new_own(a.clone(), "rk", "iu", Utc::now()))
            .unwrap();
        txn.put_identity(&Identity::new_non_own(b.clone(), "rkb", Utc::now()))
            .unwrap();
        txn.put_identity(&Identity::new_non_own(c.clone(), "rkc", Utc::now()))
            .unwrap();

        let eng = engine();
        eng.set_trust(&mut *txn, &a, &b, TrustValue::parse(100).unwrap(), Comment::empty())
            .unwrap();
        eng.set_trust(&mut *txn, &b, &c, TrustValue::parse(50).unwrap(), Comment::empty())
            .unwrap();
        eng.set_trust(&mut *txn, &a, &b, TrustValue::parse(-1).unwrap(), Comment::empty())
            .unwrap();

        let sb = txn.get_score(&a, &b).unwrap().unwrap();
        assert_eq!((sb.value, sb.rank, sb.capacity), (-1, Some(1), 0));
        assert!(txn.get_score(&a, &c).unwrap().is_none());
    }
}
