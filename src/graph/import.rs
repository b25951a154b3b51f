//! Trust-list import.

use crate::error::WotResult;
use crate::ids::Id;
use crate::model::trust::{Comment, Trust, TrustValue};
use crate::store::Transaction;
use chrono::{DateTime, Utc};

/// One advertised edge from a fetched trust list, prior to validation.
pub struct AdvertisedEdge {
    pub trustee: Id,
    pub value: TrustValue,
    pub comment: Comment,
}

/// A single (truster, trustee) Trust row that changed as a consequence
/// of a trust-list import, carrying enough to both feed incremental
/// score updates (the trustee) and report a notification (old/new).
pub struct TrustChange {
    pub trustee: Id,
    pub old: Option<Trust>,
    pub new: Option<Trust>,
}

/// Upsert every advertised edge at `edition`, then delete any of
/// `truster`'s stored edges left at an older edition — the mechanism by
/// which a trust list's removals are observed without the truster having
/// to announce them explicitly.
///
/// Returns one [`TrustChange`] per Trust(`truster`, trustee) row that was
/// created, changed, or deleted.
pub fn apply_trust_list(
    txn: &mut dyn Transaction,
    truster: &Id,
    edges: Vec<AdvertisedEdge>,
    edition: u64,
    now: DateTime<Utc>,
) -> WotResult<Vec<TrustChange>> {
    let mut touched = Vec::new();

    for edge in edges {
        let existing = txn.get_trust(truster, &edge.trustee)?;
        let changed = match &existing {
            Some(t) => t.value != edge.value || t.comment != edge.comment,
            None => true,
        };
        let last_change_date = if changed {
            now
        } else {
            existing.as_ref().map(|t| t.last_change_date).unwrap_or(now)
        };
        let trust = Trust {
            truster: truster.clone(),
            trustee: edge.trustee.clone(),
            value: edge.value,
            comment: edge.comment,
            truster_edition: edition,
            last_change_date,
        };
        txn.put_trust(&trust)?;
        if changed {
            touched.push(TrustChange {
                trustee: edge.trustee,
                old: existing,
                new: Some(trust),
            });
        }
    }

    let stale = txn.trusts_by_truster_older_than(truster, edition)?;
    for trust in stale {
        txn.delete_trust(&trust.truster, &trust.trustee)?;
        touched.push(TrustChange {
            trustee: trust.trustee.clone(),
            old: Some(trust),
            new: None,
        });
    }

    Ok(touched)
}
