//! Introduction puzzle lifecycle maintenance: expiring
//! puzzles past their `valid_until`, evicting the oldest when a pool
//! grows past capacity, and cascading deletes when an identity is
//! removed from the store.

use crate::capability::Clock;
use crate::error::WotResult;
use crate::ids::Id;
use crate::store::EntityStore;

/// Deletes every puzzle whose `valid_until` has passed. Returns the
/// number of puzzles removed.
pub fn expire_puzzles(store: &dyn EntityStore, clock: &dyn Clock) -> WotResult<u32> {
    let now = clock.now();
    let mut txn = store.transaction()?;
    let expired: Vec<String> = txn
        .all_puzzles()?
        .into_iter()
        .filter(|p| p.is_expired(now))
        .map(|p| p.id)
        .collect();
    let count = expired.len() as u32;
    for id in expired {
        txn.delete_puzzle(&id)?;
    }
    txn.commit()?;
    Ok(count)
}

/// Evicts the oldest (by `valid_until`, ascending) puzzles from `pool`
/// until its size is at or below `max_size`. Used by the client pool to
/// enforce [`super::client::POOL_SIZE`] when unsolved puzzles
/// accumulate faster than they're solved.
pub fn evict_over_pool_size(
    store: &dyn EntityStore,
    pool: impl Fn(&crate::model::puzzle::IntroductionPuzzle) -> bool,
    max_size: usize,
) -> WotResult<u32> {
    let mut txn = store.transaction()?;
    let mut pooled: Vec<_> = txn
        .all_puzzles()?
        .into_iter()
        .filter(|p| pool(p))
        .collect();
    if pooled.len() <= max_size {
        txn.commit()?;
        return Ok(0);
    }
    pooled.sort_by_key(|p| p.valid_until);
    let overflow = pooled.len() - max_size;
    let mut evicted = 0;
    for puzzle in pooled.into_iter().take(overflow) {
        txn.delete_puzzle(&puzzle.id)?;
        evicted += 1;
    }
    txn.commit()?;
    Ok(evicted)
}

/// Deletes every puzzle inserted by `identity` and every puzzle that
/// identity solved, alongside the identity itself, as a single
/// transaction.
pub fn cascade_delete_for_identity(store: &dyn EntityStore, identity: &Id) -> WotResult<()> {
    let mut txn = store.transaction()?;
    let inserted = txn.puzzles_by_inserter(identity)?;
    for puzzle in inserted {
        txn.delete_puzzle(&puzzle.id)?;
    }
    let solved_elsewhere: Vec<String> = txn
        .all_puzzles()?
        .into_iter()
        .filter(|p| p.solver.as_ref() == Some(identity))
        .map(|p| p.id)
        .collect();
    for id in solved_elsewhere {
        txn.delete_puzzle(&id)?;
    }
    txn.delete_identity(identity)?;
    txn.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::FixedClock;
    use crate::model::identity::Identity;
    use crate::model::puzzle::IntroductionPuzzle;
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn id(n: u8) -> Id {
        Id::new_unchecked(format!("{}{:02}", "L".repeat(41), n))
    }

    #[test]
    fn expire_puzzles_removes_only_past_valid_until() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let clock = FixedClock::new(now);
        let inserter = id(1);
        {
            let mut txn = store.transaction().unwrap();
            let fresh = IntroductionPuzzle::new_own(
                "fresh@i".into(),
                inserter.clone(),
                "image/png",
                vec![],
                "SOL".into(),
                now.date_naive(),
                0,
                now,
            );
            let mut stale = IntroductionPuzzle::new_own(
                "stale@i".into(),
                inserter.clone(),
                "image/png",
                vec![],
                "SOL".into(),
                (now - chrono::Duration::days(10)).date_naive(),
                0,
                now - chrono::Duration::days(10),
            );
            stale.valid_until = now - chrono::Duration::hours(1);
            txn.put_puzzle(&fresh).unwrap();
            txn.put_puzzle(&stale).unwrap();
            txn.commit().unwrap();
        }

        let removed = expire_puzzles(&store, &clock).unwrap();
        assert_eq!(removed, 1);

        let txn = store.transaction().unwrap();
        assert_eq!(txn.all_puzzles().unwrap().len(), 1);
        assert!(txn.get_puzzle("fresh@i").unwrap().is_some());
    }

    #[test]
    fn evict_over_pool_size_keeps_newest() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let inserter = id(2);
        {
            let mut txn = store.transaction().unwrap();
            for i in 0..5u32 {
                let mut puzzle = IntroductionPuzzle::new_downloaded(
                    format!("p{i}@i"),
                    inserter.clone(),
                    "image/png",
                    vec![],
                    now.date_naive(),
                    i,
                    now,
                );
                puzzle.valid_until = now + chrono::Duration::seconds(i as i64);
                txn.put_puzzle(&puzzle).unwrap();
            }
            txn.commit().unwrap();
        }

        let evicted = evict_over_pool_size(&store, |p| p.solution.is_none(), 3).unwrap();
        assert_eq!(evicted, 2);

        let txn = store.transaction().unwrap();
        let remaining = txn.all_puzzles().unwrap();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.iter().all(|p| p.index >= 2));
    }

    #[test]
    fn cascade_delete_removes_identity_and_its_puzzles() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let target = id(3);
        {
            let mut txn = store.transaction().unwrap();
            txn.put_identity(&Identity::new_own(target.clone(), "rk", "insert", now))
                .unwrap();
            let puzzle = IntroductionPuzzle::new_own(
                "p@i".into(),
                target.clone(),
                "image/png",
                vec![],
                "SOL".into(),
                now.date_naive(),
                0,
                now,
            );
            txn.put_puzzle(&puzzle).unwrap();
            txn.commit().unwrap();
        }

        cascade_delete_for_identity(&store, &target).unwrap();

        let txn = store.transaction().unwrap();
        assert!(txn.get_identity(&target).unwrap().is_none());
        assert!(txn.puzzles_by_inserter(&target).unwrap().is_empty());
    }
}
