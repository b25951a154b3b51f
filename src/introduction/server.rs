//! Server-side introduction puzzle lifecycle: tops up each
//! opted-in OwnIdentity's daily puzzle quota, inserts rendered puzzles
//! at their deterministic address, and — on a successful fetch of a
//! puzzle's solution address — creates the solver's identity and grants
//! the initial zero-value trust edge that makes it reachable.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::capability::Clock;
use crate::error::{WotError, WotResult};
use crate::graph::TrustGraphEngine;
use crate::ids::{self, Id};
use crate::model::identity::Identity;
use crate::model::puzzle::IntroductionPuzzle;
use crate::model::trust::{Comment, TrustValue};
use crate::model::SubscriptionKind;
use crate::store::EntityStore;
use crate::subscription::SubscriptionManager;
use crate::xml::{IdentityDocument, XmlCodec};

use super::factory::PuzzleFactory;

/// The out-of-scope insert primitive for publishing a rendered puzzle at
/// its deterministic address (the underlying content-addressed insert
/// primitive).
#[async_trait]
pub trait PuzzleInsertClient: Send + Sync {
    async fn insert_puzzle(&self, address: &str, bytes: &[u8]) -> WotResult<()>;
}

/// Comment stamped on the trust edge granted by a solved captcha.
pub const CAPTCHA_TRUST_COMMENT: &str = "Trust received by solving a captcha.";

pub struct IntroductionServer {
    store: Arc<dyn EntityStore>,
    graph: Arc<TrustGraphEngine>,
    factory: PuzzleFactory,
    insert_client: Arc<dyn PuzzleInsertClient>,
    codec: Arc<dyn XmlCodec>,
    clock: Arc<dyn Clock>,
    subscriptions: Arc<SubscriptionManager>,
}

impl IntroductionServer {
    pub fn new(
        store: Arc<dyn EntityStore>,
        graph: Arc<TrustGraphEngine>,
        factory: PuzzleFactory,
        insert_client: Arc<dyn PuzzleInsertClient>,
        codec: Arc<dyn XmlCodec>,
        clock: Arc<dyn Clock>,
        subscriptions: Arc<SubscriptionManager>,
    ) -> Self {
        Self {
            store,
            graph,
            factory,
            insert_client,
            codec,
            clock,
            subscriptions,
        }
    }

    /// Tops up `owner`'s unsolved own-puzzle count for the current UTC
    /// day up to its configured `puzzle_count`.
    /// A no-op, returning 0, if the identity hasn't opted in. Returns the
    /// number of puzzles created.
    pub async fn maintain_puzzles(&self, owner: &Id) -> WotResult<u32> {
        let now = self.clock.now();
        let today = now.date_naive();

        let (enabled, puzzle_count) = {
            let txn = self.store.transaction()?;
            let identity = txn
                .get_identity(owner)?
                .ok_or_else(|| WotError::UnknownIdentity(owner.to_string()))?;
            let own = identity.own.as_ref().ok_or_else(|| {
                WotError::InvalidParameter("owner is not an OwnIdentity".into())
            })?;
            (own.config.publishes_introduction_puzzles, own.config.puzzle_count)
        };
        if !enabled {
            return Ok(0);
        }

        let existing_today = {
            let txn = self.store.transaction()?;
            txn.puzzles_by_inserter(owner)?
                .into_iter()
                .filter(|p| p.date_of_insertion == today && p.solution.is_some())
                .count() as u32
        };

        let mut created = 0u32;
        let mut next_index = existing_today;
        while existing_today + created < puzzle_count {
            let (solution, mime_type, bytes) = self.factory.generate()?;
            let address = ids::puzzle_insertion_address(owner, today, next_index);
            self.insert_client.insert_puzzle(&address, &bytes).await?;

            let puzzle_id = ids::puzzle_id(&Uuid::new_v4(), owner);
            let puzzle = IntroductionPuzzle::new_own(
                puzzle_id, owner.clone(), mime_type, bytes, solution, today, next_index, now,
            );
            let mut txn = self.store.transaction()?;
            txn.put_puzzle(&puzzle)?;
            txn.commit()?;

            created += 1;
            next_index += 1;
        }
        Ok(created)
    }

    /// Handles a successful fetch of a puzzle's solution address: parses
    /// the solver's identity document, creates or updates
    /// it, and grants a zero-value trust edge sufficient to make it
    /// fetchable. The puzzle is marked solved unconditionally, even on a
    /// parse failure, so a malformed payload can't be replayed to keep
    /// re-triggering work and avoid a denial-of-service vector.
    pub fn handle_solution_fetched(&self, puzzle_id: &str, payload: &[u8]) -> WotResult<()> {
        let mut txn = self.store.transaction()?;
        let mut puzzle = txn
            .get_puzzle(puzzle_id)?
            .ok_or_else(|| WotError::UnknownPuzzle(puzzle_id.to_string()))?;

        let decoded = match self.codec.decode_introduction_solution(payload) {
            Ok(doc) => doc,
            Err(err) => {
                log::warn!("introduction solution for puzzle {puzzle_id} failed to parse: {err}");
                puzzle.was_solved = true;
                txn.put_puzzle(&puzzle)?;
                return txn.commit();
            }
        };

        let now = self.clock.now();
        let solver_id = decoded.solver_identity.identity.clone();
        let existing = txn.get_identity(&solver_id)?;
        let before = existing
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| WotError::CorruptedData(format!("serializing identity notification: {e}")))?;
        let mut solver_identity = existing.unwrap_or_else(|| {
            Identity::new_non_own(solver_id.clone(), solver_id.as_str(), now)
        });
        apply_identity_document(&mut solver_identity, &decoded.solver_identity, now);
        txn.put_identity(&solver_identity)?;
        let after = serde_json::to_value(&solver_identity)
            .map_err(|e| WotError::CorruptedData(format!("serializing identity notification: {e}")))?;
        self.subscriptions
            .record_change(&mut *txn, SubscriptionKind::Identities, before, Some(after))?;

        self.graph.set_trust(
            &mut *txn,
            &puzzle.inserter,
            &solver_id,
            TrustValue::parse(0)?,
            Comment::parse(CAPTCHA_TRUST_COMMENT)?,
        )?;

        puzzle.was_solved = true;
        puzzle.solver = Some(solver_id);
        txn.put_puzzle(&puzzle)?;
        txn.commit()?;

        self.subscriptions.wake(SubscriptionKind::Identities);
        self.subscriptions.wake(SubscriptionKind::Trusts);
        self.subscriptions.wake(SubscriptionKind::Scores);
        Ok(())
    }
}

fn apply_identity_document(identity: &mut Identity, document: &IdentityDocument, now: DateTime<Utc>) {
    if let Some(nickname) = &document.nickname {
        let _ = identity.set_nickname_once(nickname.clone());
    }
    identity.does_publish_trust_list = document.does_publish_trust_list;
    identity.last_change_date = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CountingRandom, SystemClock};
    use crate::introduction::factory::PlaceholderRenderer;
    use crate::model::identity::{Nickname, OwnIdentityConfig};
    use crate::store::MemoryStore;
    use crate::xml::{IntroductionSolutionDocument, QuickXmlCodec};

    fn id(n: u8) -> Id {
        Id::new_unchecked(format!("{}{:02}", "P".repeat(41), n))
    }

    struct RecordingInsertClient;

    #[async_trait]
    impl PuzzleInsertClient for RecordingInsertClient {
        async fn insert_puzzle(&self, _address: &str, _bytes: &[u8]) -> WotResult<()> {
            Ok(())
        }
    }

    fn server(store: Arc<dyn EntityStore>) -> IntroductionServer {
        let subscriptions = Arc::new(crate::subscription::SubscriptionManager::new(store.clone()));
        IntroductionServer::new(
            store,
            Arc::new(TrustGraphEngine::new(Arc::new(SystemClock), subscriptions.clone())),
            PuzzleFactory::new(Arc::new(CountingRandom::new(1)), Arc::new(PlaceholderRenderer)),
            Arc::new(RecordingInsertClient),
            Arc::new(QuickXmlCodec::new()),
            Arc::new(SystemClock),
            subscriptions,
        )
    }

    #[tokio::test]
    async fn maintain_puzzles_tops_up_to_configured_count() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let owner = id(1);
        {
            let mut txn = store.transaction().unwrap();
            let mut identity = Identity::new_own(owner.clone(), "rk", "insert", Utc::now());
            identity.own.as_mut().unwrap().config = OwnIdentityConfig {
                publishes_introduction_puzzles: true,
                puzzle_count: 3,
                auto_update_trust_list: true,
            };
            txn.put_identity(&identity).unwrap();
            txn.commit().unwrap();
        }

        let srv = server(store.clone());
        let created = srv.maintain_puzzles(&owner).await.unwrap();
        assert_eq!(created, 3);

        let txn = store.transaction().unwrap();
        assert_eq!(txn.puzzles_by_inserter(&owner).unwrap().len(), 3);

        // Calling again the same day is a no-op: quota already met.
        let created_again = srv.maintain_puzzles(&owner).await.unwrap();
        assert_eq!(created_again, 0);
    }

    #[tokio::test]
    async fn disabled_identity_generates_no_puzzles() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let owner = id(2);
        {
            let mut txn = store.transaction().unwrap();
            txn.put_identity(&Identity::new_own(owner.clone(), "rk", "insert", Utc::now()))
                .unwrap();
            txn.commit().unwrap();
        }
        let srv = server(store);
        assert_eq!(srv.maintain_puzzles(&owner).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn solved_puzzle_creates_identity_and_zero_value_trust() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let owner = id(3);
        let solver = id(4);
        {
            let mut txn = store.transaction().unwrap();
            txn.put_identity(&Identity::new_own(owner.clone(), "rk", "insert", Utc::now()))
                .unwrap();
            txn.commit().unwrap();
        }

        let puzzle = IntroductionPuzzle::new_own(
            format!("uuid@{owner}"),
            owner.clone(),
            "image/png",
            vec![1, 2, 3],
            "SOLUTION".into(),
            Utc::now().date_naive(),
            0,
            Utc::now(),
        );
        {
            let mut txn = store.transaction().unwrap();
            txn.put_puzzle(&puzzle).unwrap();
            txn.commit().unwrap();
        }

        let srv = server(store.clone());
        let codec = QuickXmlCodec::new();
        let solver_doc = IdentityDocument {
            identity: solver.clone(),
            nickname: Some(Nickname::parse("Newcomer").unwrap()),
            does_publish_trust_list: false,
            contexts: vec![],
            properties: vec![],
            trust_list: vec![],
        };
        let payload = codec
            .encode_introduction_solution(&IntroductionSolutionDocument {
                puzzle_id: puzzle.id.clone(),
                solver_identity: solver_doc,
            })
            .unwrap();

        srv.handle_solution_fetched(&puzzle.id, &payload).unwrap();

        let txn = store.transaction().unwrap();
        let stored_solver = txn.get_identity(&solver).unwrap().unwrap();
        assert_eq!(stored_solver.nickname.unwrap().as_str(), "Newcomer");

        let trust = txn.get_trust(&owner, &solver).unwrap().unwrap();
        assert_eq!(trust.value.get(), 0);
        assert_eq!(trust.comment.as_str(), CAPTCHA_TRUST_COMMENT);

        let stored_puzzle = txn.get_puzzle(&puzzle.id).unwrap().unwrap();
        assert!(stored_puzzle.was_solved);
        assert_eq!(stored_puzzle.solver, Some(solver));
    }

    #[tokio::test]
    async fn malformed_solution_still_marks_puzzle_solved() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let owner = id(5);
        {
            let mut txn = store.transaction().unwrap();
            txn.put_identity(&Identity::new_own(owner.clone(), "rk", "insert", Utc::now()))
                .unwrap();
            txn.commit().unwrap();
        }
        let puzzle = IntroductionPuzzle::new_own(
            format!("uuid2@{owner}"),
            owner.clone(),
            "image/png",
            vec![],
            "SOLUTION".into(),
            Utc::now().date_naive(),
            0,
            Utc::now(),
        );
        {
            let mut txn = store.transaction().unwrap();
            txn.put_puzzle(&puzzle).unwrap();
            txn.commit().unwrap();
        }

        let srv = server(store.clone());
        srv.handle_solution_fetched(&puzzle.id, b"not xml").unwrap();

        let txn = store.transaction().unwrap();
        let stored = txn.get_puzzle(&puzzle.id).unwrap().unwrap();
        assert!(stored.was_solved);
        assert!(stored.solver.is_none());
    }
}
