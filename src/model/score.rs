//! Score entity: derived reachability of a trustee from one
//! OwnIdentity's perspective.

use crate::ids::{edge_id, Id};
use serde::{Deserialize, Serialize};

/// Capacity table indexed by rank: rank 0 → 100, rank 1..=6 → 40, 16, 6, 1,
/// 1, 1, rank >= 7 → 0.
pub const CAPACITY_TABLE: [i32; 7] = [100, 40, 16, 6, 1, 1, 1];

/// Rank: `Some(n)` for a finite distance, `None` for unreachable (∞).
pub type Rank = Option<u32>;

/// Look up capacity for a given rank, ignoring the sign of value. Capacity
/// is forced to 0 separately by the caller when `value < 0`.
pub fn capacity_for_rank(rank: Rank) -> i32 {
    match rank {
        None => 0,
        Some(r) => {
            let idx = r as usize;
            if idx < CAPACITY_TABLE.len() {
                CAPACITY_TABLE[idx]
            } else {
                0
            }
        }
    }
}

/// Derive final capacity from rank and the sign of value: if
/// value(O, I) < 0 then capacity(O, I) = 0 regardless of rank.
pub fn derive_capacity(rank: Rank, value: i64) -> i32 {
    if value < 0 {
        0
    } else {
        capacity_for_rank(rank)
    }
}

/// A Score record: `truster`'s (an OwnIdentity) computed reachability of
/// `trustee`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub truster: Id,
    pub trustee: Id,
    pub value: i64,
    pub rank: Rank,
    pub capacity: i32,
}

impl Score {
    /// Construct a Score, deriving `capacity` from `rank`/`value` so callers
    /// can never desynchronize the two.
    pub fn new(truster: Id, trustee: Id, value: i64, rank: Rank) -> Self {
        let capacity = derive_capacity(rank, value);
        Self {
            truster,
            trustee,
            value,
            rank,
            capacity,
        }
    }

    pub fn own_identity_self_score(owner: Id) -> Self {
        Self::new(owner.clone(), owner, 100, Some(0))
    }

    pub fn id(&self) -> String {
        edge_id(&self.truster, &self.trustee)
    }

    pub fn is_reachable(&self) -> bool {
        self.rank.is_some()
    }
}

/// Selector used by `GetIdentitiesByScore` (`Selection` ∈
/// {"+","0","-"}).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreSelector {
    Positive,
    Zero,
    Negative,
}

impl ScoreSelector {
    pub fn matches(self, value: i64) -> bool {
        match self {
            ScoreSelector::Positive => value > 0,
            ScoreSelector::Zero => value == 0,
            ScoreSelector::Negative => value < 0,
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "+" => Some(Self::Positive),
            "0" => Some(Self::Zero),
            "-" => Some(Self::Negative),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_table_values_by_rank() {
        assert_eq!(capacity_for_rank(Some(0)), 100);
        assert_eq!(capacity_for_rank(Some(1)), 40);
        assert_eq!(capacity_for_rank(Some(2)), 16);
        assert_eq!(capacity_for_rank(Some(3)), 6);
        assert_eq!(capacity_for_rank(Some(4)), 1);
        assert_eq!(capacity_for_rank(Some(5)), 1);
        assert_eq!(capacity_for_rank(Some(6)), 1);
        assert_eq!(capacity_for_rank(Some(7)), 0);
        assert_eq!(capacity_for_rank(None), 0);
    }

    #[test]
    fn negative_value_zeroes_capacity_regardless_of_rank() {
        assert_eq!(derive_capacity(Some(1), -1), 0);
        assert_eq!(derive_capacity(Some(0), -100), 0);
    }

    #[test]
    fn own_identity_self_score_is_fixed() {
        let owner = Id::new_unchecked("A".repeat(43));
        let score = Score::own_identity_self_score(owner);
        assert_eq!(score.value, 100);
        assert_eq!(score.rank, Some(0));
        assert_eq!(score.capacity, 100);
    }

    #[test]
    fn selector_parses_tokens() {
        assert_eq!(ScoreSelector::parse("+"), Some(ScoreSelector::Positive));
        assert_eq!(ScoreSelector::parse("0"), Some(ScoreSelector::Zero));
        assert_eq!(ScoreSelector::parse("-"), Some(ScoreSelector::Negative));
        assert_eq!(ScoreSelector::parse("?"), None);
    }
}
