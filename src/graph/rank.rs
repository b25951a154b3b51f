//! Pure, store-agnostic rank/value/capacity computation.
//!
//! Rank and value are mutually circular: value needs the capacity of
//! upstream trusters, capacity needs rank, and rank needs the capacity of
//! upstream trusters too. Rather than a single BFS pass this relaxes to a
//! fixed point the way Bellman-Ford relaxes edge weights — every round
//! re-derives each identity's rank/value from the previous round's
//! capacities. Because capacity is forced to 0 once rank reaches the end
//! of [`CAPACITY_TABLE`], propagation can only travel finitely far, so
//! this converges in a small, bounded number of rounds independent of
//! graph size.

use crate::ids::Id;
use crate::model::score::Score;
use crate::model::trust::Trust;
use std::collections::{HashMap, HashSet, VecDeque};

/// Generous bound on relaxation rounds. Real convergence happens within a
/// handful of rounds once capacity zeroes out beyond rank 6; this just
/// guards against surprising cyclic feedback never settling.
const MAX_ROUNDS: usize = 64;

fn round_half_up(product: i64) -> i64 {
    if product >= 0 {
        (product + 50) / 100
    } else {
        -((-product + 50) / 100)
    }
}

/// Relax `scores` to a fixed point, writing entries only for
/// `mutable_ids`. Entries already present in `scores` for identities not
/// in `mutable_ids` (the owner itself, or a frozen boundary supplied by
/// an incremental update) are read as trusters but never overwritten.
fn relax(
    owner: &Id,
    mutable_ids: &[Id],
    trusts_by_trustee: &HashMap<Id, Vec<&Trust>>,
    scores: &mut HashMap<Id, Score>,
) {
    for _round in 0..MAX_ROUNDS {
        let mut changed = false;

        for id in mutable_ids {
            if id == owner {
                continue;
            }
            let incoming = match trusts_by_trustee.get(id) {
                Some(v) => v,
                None => {
                    if scores.remove(id).is_some() {
                        changed = true;
                    }
                    continue;
                }
            };

            let own_edge = incoming.iter().find(|t| &t.truster == owner);

            let mut best_rank: Option<u32> = None;
            let mut weighted_sum: i64 = 0;
            let mut any_contribution = false;

            for trust in incoming {
                let truster_score = match scores.get(&trust.truster) {
                    Some(s) => s,
                    None => continue,
                };
                if truster_score.capacity <= 0 {
                    continue;
                }
                any_contribution = true;
                let candidate_rank = truster_score.rank.map(|r| r + 1);
                best_rank = match (best_rank, candidate_rank) {
                    (None, c) => c,
                    (Some(b), Some(c)) => Some(b.min(c)),
                    (b, None) => b,
                };
                weighted_sum += round_half_up(trust.value.get() as i64 * truster_score.capacity as i64);
            }

            if !any_contribution {
                if scores.remove(id).is_some() {
                    changed = true;
                }
                continue;
            }

            let value = match own_edge {
                Some(trust) => trust.value.get() as i64,
                None => weighted_sum,
            };

            let candidate = Score::new(owner.clone(), id.clone(), value, best_rank);
            let replace = scores.get(id).map(|existing| existing != &candidate).unwrap_or(true);
            if replace {
                scores.insert(id.clone(), candidate);
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }
}

/// Full recomputation: every identity is a candidate, seeded only with
/// the owner's fixed self-score.
pub fn compute_scores(
    owner: &Id,
    identities: &[Id],
    trusts_by_trustee: &HashMap<Id, Vec<&Trust>>,
) -> HashMap<Id, Score> {
    let mut scores = HashMap::new();
    scores.insert(owner.clone(), Score::own_identity_self_score(owner.clone()));

    let mutable: Vec<Id> = identities.iter().filter(|id| *id != owner).cloned().collect();
    relax(owner, &mutable, trusts_by_trustee, &mut scores);
    scores
}

/// Incremental update: only identities in the forward closure of
/// `changed_trustee`, following only outgoing edges, can have their
/// score change; everything else is
/// passed in as a frozen boundary and used only as a truster input.
pub fn compute_incremental(
    owner: &Id,
    changed_trustee: &Id,
    trusts_by_truster: &HashMap<Id, Vec<&Trust>>,
    trusts_by_trustee: &HashMap<Id, Vec<&Trust>>,
    mut scores: HashMap<Id, Score>,
) -> HashMap<Id, Score> {
    let affected = forward_closure(changed_trustee, trusts_by_truster);
    let mutable: Vec<Id> = affected.into_iter().filter(|id| id != owner).collect();
    relax(owner, &mutable, trusts_by_trustee, &mut scores);
    scores
}

fn forward_closure(seed: &Id, trusts_by_truster: &HashMap<Id, Vec<&Trust>>) -> HashSet<Id> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    visited.insert(seed.clone());
    queue.push_back(seed.clone());
    while let Some(node) = queue.pop_front() {
        if let Some(edges) = trusts_by_truster.get(&node) {
            for trust in edges {
                if visited.insert(trust.trustee.clone()) {
                    queue.push_back(trust.trustee.clone());
                }
            }
        }
    }
    visited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::trust::{Comment, TrustValue};
    use chrono::Utc;

    fn id(n: u8) -> Id {
        Id::new_unchecked(format!("{}{:02}", "A".repeat(41), n))
    }

    fn trust(truster: Id, trustee: Id, value: i32) -> Trust {
        Trust::new(
            truster,
            trustee,
            TrustValue::parse(value).unwrap(),
            Comment::empty(),
            0,
            Utc::now(),
        )
        .unwrap()
    }

    fn by_trustee(trusts: &[Trust]) -> HashMap<Id, Vec<&Trust>> {
        let mut map: HashMap<Id, Vec<&Trust>> = HashMap::new();
        for t in trusts {
            map.entry(t.trustee.clone()).or_default().push(t);
        }
        map
    }

    #[test]
    fn two_hop_propagation() {
        let a = id(1);
        let b = id(2);
        let c = id(3);
        let trusts = vec![trust(a.clone(), b.clone(), 100), trust(b.clone(), c.clone(), 50)];
        let scores = compute_scores(&a, &[a.clone(), b.clone(), c.clone()], &by_trustee(&trusts));

        assert_eq!(scores[&a], Score::own_identity_self_score(a.clone()));
        let sb = &scores[&b];
        assert_eq!((sb.value, sb.rank, sb.capacity), (100, Some(1), 40));
        let sc = &scores[&c];
        assert_eq!((sc.value, sc.rank, sc.capacity), (20, Some(2), 16));
    }

    #[test]
    fn distrust_cuts_downstream_reachability() {
        let a = id(1);
        let b = id(2);
        let c = id(3);
        let trusts = vec![trust(a.clone(), b.clone(), -1), trust(b.clone(), c.clone(), 50)];
        let scores = compute_scores(&a, &[a.clone(), b.clone(), c.clone()], &by_trustee(&trusts));

        let sb = &scores[&b];
        assert_eq!((sb.value, sb.rank, sb.capacity), (-1, Some(1), 0));
        assert!(!scores.contains_key(&c));
    }

    #[test]
    fn own_opinion_overrides_calculated_contribution() {
        let a = id(1);
        let b = id(2);
        let c = id(3);
        let trusts = vec![
            trust(a.clone(), b.clone(), 100),
            trust(b.clone(), c.clone(), 50),
            trust(c.clone(), a.clone(), 100),
            trust(c.clone(), b.clone(), 50),
        ];
        let scores = compute_scores(
            &a,
            &[a.clone(), b.clone(), c.clone()],
            &by_trustee(&trusts),
        );

        assert_eq!(scores[&b].value, 100);
        let sc = &scores[&c];
        assert_eq!((sc.value, sc.rank, sc.capacity), (20, Some(2), 16));
    }

    #[test]
    fn malicious_identity_with_zero_capacity_is_neutralized() {
        let o = id(1);
        let s = id(2);
        let a = id(3);
        let b = id(4);
        let m = id(5);
        let trusts = vec![
            trust(o.clone(), s.clone(), 100),
            trust(s.clone(), a.clone(), 4),
            trust(s.clone(), b.clone(), 4),
            trust(s.clone(), m.clone(), -100),
            trust(m.clone(), a.clone(), -100),
            trust(m.clone(), b.clone(), -100),
        ];
        let identities = vec![o.clone(), s.clone(), a.clone(), b.clone(), m.clone()];
        let scores = compute_scores(&o, &identities, &by_trustee(&trusts));

        assert!(scores[&a].value > 0);
        assert!(scores[&b].value > 0);
        assert_eq!(scores[&m].capacity, 0);
    }

    #[test]
    fn order_independence_of_import() {
        let o = id(1);
        let s = id(2);
        let a = id(3);
        let b = id(4);
        let c = id(5);
        let identities = vec![o.clone(), s.clone(), a.clone(), b.clone(), c.clone()];

        let base = vec![
            trust(o.clone(), s.clone(), 100),
            trust(s.clone(), a.clone(), 4),
            trust(s.clone(), b.clone(), 4),
            trust(s.clone(), c.clone(), 4),
            trust(a.clone(), c.clone(), 100),
            trust(b.clone(), a.clone(), -100),
            trust(b.clone(), c.clone(), -100),
        ];

        let mut order1 = base.clone();
        order1.insert(1, trust(a.clone(), b.clone(), -100));
        let scores1 = compute_scores(&o, &identities, &by_trustee(&order1));

        let mut order2 = base;
        order2.push(trust(a.clone(), b.clone(), -100));
        let scores2 = compute_scores(&o, &identities, &by_trustee(&order2));

        for target in [&a, &b, &c] {
            assert_eq!(scores1.get(target), scores2.get(target));
        }
    }
}
