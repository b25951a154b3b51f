//! Client-side introduction puzzle pool: downloads puzzles
//! from identities that opt in to the introduction context, tracks a
//! recent-download LRU to avoid hammering the same identity, enforces a
//! per-identity daily cap, and inserts a solved puzzle's solution
//! document at its solution address with indefinite retry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;

use crate::capability::Clock;
use crate::error::{WotError, WotResult};
use crate::ids::{self, Id};
use crate::model::identity::Identity;
use crate::model::puzzle::IntroductionPuzzle;
use crate::store::EntityStore;
use crate::xml::{IdentityDocument, IntroductionSolutionDocument, XmlCodec};

/// Size of the client's unsolved-downloaded-puzzle pool.
pub const POOL_SIZE: usize = 128;
/// Per-identity daily download cap.
pub const MAX_PUZZLES_PER_IDENTITY_PER_DAY: u32 = 3;
/// Context tag an identity must publish to be considered a puzzle
/// source.
pub const INTRODUCTION_CONTEXT: &str = "Introduction";
/// Delay between retries of the solution-document insert; retried
/// indefinitely until success.
const INSERT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// The out-of-scope fetch primitive for downloading a candidate's
/// puzzle.
#[async_trait]
pub trait PuzzleDownloadClient: Send + Sync {
    async fn fetch_puzzle(&self, address: &str) -> WotResult<Vec<u8>>;
}

/// The out-of-scope insert primitive for publishing the client's solved
/// solution document.
#[async_trait]
pub trait SolutionInsertClient: Send + Sync {
    async fn insert_solution(&self, address: &str, bytes: &[u8]) -> WotResult<()>;
}

/// One identity eligible as a puzzle source, as judged by the caller.
pub struct Candidate {
    pub identity: Id,
    pub best_score: i64,
}

/// Per-OwnIdentity download bookkeeping. The LRU and daily counters are
/// in-memory only — losing them across a restart only costs a few
/// redundant downloads, not correctness, so unlike the puzzle rows
/// themselves (durable via the entity store) they aren't persisted.
pub struct ClientPuzzlePool {
    store: Arc<dyn EntityStore>,
    codec: Arc<dyn XmlCodec>,
    clock: Arc<dyn Clock>,
    recent_lru: Mutex<VecDeque<Id>>,
    daily_counts: Mutex<HashMap<(Id, NaiveDate), u32>>,
    score_threshold: i64,
}

impl ClientPuzzlePool {
    pub fn new(
        store: Arc<dyn EntityStore>,
        codec: Arc<dyn XmlCodec>,
        clock: Arc<dyn Clock>,
        score_threshold: i64,
    ) -> Self {
        Self {
            store,
            codec,
            clock,
            recent_lru: Mutex::new(VecDeque::new()),
            daily_counts: Mutex::new(HashMap::new()),
            score_threshold,
        }
    }

    /// Filters `candidates` down to those eligible for a new puzzle
    /// download: best score at or above the configured threshold and not
    /// on the recent-download LRU (publishing the introduction context
    /// is expected to already have been applied by the caller when
    /// assembling `candidates`). Returns none if the pool is already at
    /// capacity.
    pub fn select_candidates(&self, candidates: Vec<Candidate>) -> WotResult<Vec<Id>> {
        if self.pool_len()? >= POOL_SIZE {
            return Ok(Vec::new());
        }
        let recent = self.recent_lru.lock();
        Ok(candidates
            .into_iter()
            .filter(|c| c.best_score >= self.score_threshold)
            .filter(|c| !recent.contains(&c.identity))
            .map(|c| c.identity)
            .collect())
    }

    fn pool_len(&self) -> WotResult<usize> {
        let txn = self.store.transaction()?;
        Ok(txn
            .all_puzzles()?
            .into_iter()
            .filter(|p| p.solution.is_none() && !p.was_solved)
            .count())
    }

    /// Downloads one puzzle from `from_identity`, subject to the
    /// per-identity daily cap. Returns `Ok(None)` without fetching if the
    /// cap was already reached for `date_of_insertion`.
    #[allow(clippy::too_many_arguments)]
    pub async fn download_puzzle(
        &self,
        client: &dyn PuzzleDownloadClient,
        from_identity: &Id,
        puzzle_id: String,
        address: &str,
        date_of_insertion: NaiveDate,
        index: u32,
        mime_type: String,
    ) -> WotResult<Option<()>> {
        {
            let mut counts = self.daily_counts.lock();
            let count = counts
                .entry((from_identity.clone(), date_of_insertion))
                .or_insert(0);
            if *count >= MAX_PUZZLES_PER_IDENTITY_PER_DAY {
                return Ok(None);
            }
            *count += 1;
        }

        let bytes = client.fetch_puzzle(address).await?;
        let now = self.clock.now();
        let puzzle = IntroductionPuzzle::new_downloaded(
            puzzle_id,
            from_identity.clone(),
            mime_type,
            bytes,
            date_of_insertion,
            index,
            now,
        );
        let mut txn = self.store.transaction()?;
        txn.put_puzzle(&puzzle)?;
        txn.commit()?;

        let mut recent = self.recent_lru.lock();
        recent.push_back(from_identity.clone());
        if recent.len() > POOL_SIZE {
            recent.pop_front();
        }
        Ok(Some(()))
    }

    /// Records the user's solution, then inserts the client's
    /// introduction document at the puzzle's solution address, retrying
    /// indefinitely until it succeeds, and marks `was_inserted` on
    /// completion.
    pub async fn submit_solution(
        &self,
        insert_client: &dyn SolutionInsertClient,
        puzzle_id: &str,
        solution: String,
        solver: &Identity,
    ) -> WotResult<()> {
        {
            let mut txn = self.store.transaction()?;
            let mut puzzle = txn
                .get_puzzle(puzzle_id)?
                .ok_or_else(|| WotError::UnknownPuzzle(puzzle_id.to_string()))?;
            puzzle.solution = Some(solution);
            txn.put_puzzle(&puzzle)?;
            txn.commit()?;
        }

        let document = IdentityDocument::from_identity(solver, Vec::new());
        let solution_doc = IntroductionSolutionDocument {
            puzzle_id: puzzle_id.to_string(),
            solver_identity: document,
        };
        let bytes = self.codec.encode_introduction_solution(&solution_doc)?;
        let address = ids::solution_address(puzzle_id);

        while insert_client.insert_solution(&address, &bytes).await.is_err() {
            tokio::time::sleep(INSERT_RETRY_DELAY).await;
        }

        let mut txn = self.store.transaction()?;
        if let Some(mut puzzle) = txn.get_puzzle(puzzle_id)? {
            puzzle.was_inserted = true;
            txn.put_puzzle(&puzzle)?;
        }
        txn.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SystemClock;
    use crate::store::MemoryStore;
    use crate::xml::QuickXmlCodec;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn id(n: u8) -> Id {
        Id::new_unchecked(format!("{}{:02}", "Q".repeat(41), n))
    }

    fn pool(store: Arc<dyn EntityStore>) -> ClientPuzzlePool {
        ClientPuzzlePool::new(store, Arc::new(QuickXmlCodec::new()), Arc::new(SystemClock), 0)
    }

    #[test]
    fn select_candidates_filters_by_threshold_and_lru() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let p = ClientPuzzlePool::new(store, Arc::new(QuickXmlCodec::new()), Arc::new(SystemClock), 10);
        p.recent_lru.lock().push_back(id(2));
        let candidates = vec![
            Candidate { identity: id(1), best_score: 20 },
            Candidate { identity: id(2), best_score: 30 },
            Candidate { identity: id(3), best_score: 5 },
        ];
        let selected = p.select_candidates(candidates).unwrap();
        assert_eq!(selected, vec![id(1)]);
    }

    struct CountingDownloadClient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PuzzleDownloadClient for CountingDownloadClient {
        async fn fetch_puzzle(&self, _address: &str) -> WotResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![9, 9, 9])
        }
    }

    #[tokio::test]
    async fn download_puzzle_respects_daily_cap() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let p = pool(store.clone());
        let client = CountingDownloadClient { calls: AtomicU32::new(0) };
        let source = id(4);
        let today = Utc::now().date_naive();

        for i in 0..MAX_PUZZLES_PER_IDENTITY_PER_DAY {
            let got = p
                .download_puzzle(&client, &source, format!("u{i}@{source}"), "addr", today, i, "image/png".into())
                .await
                .unwrap();
            assert!(got.is_some());
        }
        let capped = p
            .download_puzzle(&client, &source, format!("over@{source}"), "addr", today, 99, "image/png".into())
            .await
            .unwrap();
        assert!(capped.is_none());
        assert_eq!(client.calls.load(Ordering::SeqCst), MAX_PUZZLES_PER_IDENTITY_PER_DAY);

        let txn = store.transaction().unwrap();
        assert_eq!(txn.puzzles_by_inserter(&source).unwrap().len() as u32, MAX_PUZZLES_PER_IDENTITY_PER_DAY);
    }

    struct AlwaysSucceedsInsert;

    #[async_trait]
    impl SolutionInsertClient for AlwaysSucceedsInsert {
        async fn insert_solution(&self, _address: &str, _bytes: &[u8]) -> WotResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn submit_solution_marks_inserted() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let source = id(5);
        let solver_id = id(6);
        let puzzle = IntroductionPuzzle::new_downloaded(
            format!("u@{source}"),
            source,
            "image/png",
            vec![1, 2],
            Utc::now().date_naive(),
            0,
            Utc::now(),
        );
        {
            let mut txn = store.transaction().unwrap();
            txn.put_puzzle(&puzzle).unwrap();
            txn.commit().unwrap();
        }

        let p = pool(store.clone());
        let solver = Identity::new_own(solver_id, "rk", "insert", Utc::now());
        p.submit_solution(&AlwaysSucceedsInsert, &puzzle.id, "ANSWER".into(), &solver)
            .await
            .unwrap();

        let txn = store.transaction().unwrap();
        let stored = txn.get_puzzle(&puzzle.id).unwrap().unwrap();
        assert!(stored.was_inserted);
        assert_eq!(stored.solution.as_deref(), Some("ANSWER"));
    }
}
