//! SQLite-backed entity store. Each entity table keeps a `data` column
//! holding the canonical `serde_json` encoding plus whatever columns the
//! secondary-index queries in [`super::Transaction`] need; the JSON blob
//! stays the single source of truth, the extra columns exist only to let
//! SQLite's own indices do the filtering.

use super::{EntityStore, Transaction};
use crate::error::{WotError, WotResult};
use crate::ids::Id;
use crate::model::identity::Identity;
use crate::model::{
    IntroductionPuzzle, Notification, Score, ScoreSelector, Subscription, SubscriptionKind, Trust,
};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id TEXT PRIMARY KEY,
    request_key TEXT NOT NULL,
    is_own INTEGER NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_identities_request_key ON identities(request_key);
CREATE INDEX IF NOT EXISTS idx_identities_is_own ON identities(is_own);

CREATE TABLE IF NOT EXISTS trusts (
    truster TEXT NOT NULL,
    trustee TEXT NOT NULL,
    truster_edition INTEGER NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (truster, trustee)
);
CREATE INDEX IF NOT EXISTS idx_trusts_truster ON trusts(truster);
CREATE INDEX IF NOT EXISTS idx_trusts_trustee ON trusts(trustee);

CREATE TABLE IF NOT EXISTS scores (
    truster TEXT NOT NULL,
    trustee TEXT NOT NULL,
    value INTEGER NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (truster, trustee)
);
CREATE INDEX IF NOT EXISTS idx_scores_truster ON scores(truster);
CREATE INDEX IF NOT EXISTS idx_scores_trustee ON scores(trustee);
CREATE INDEX IF NOT EXISTS idx_scores_truster_value ON scores(truster, value);

CREATE TABLE IF NOT EXISTS subscriptions (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_client_kind ON subscriptions(client_id, kind);

CREATE TABLE IF NOT EXISTS notifications (
    subscription_id TEXT NOT NULL,
    sequence_number INTEGER NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (subscription_id, sequence_number)
);

CREATE TABLE IF NOT EXISTS sequence_counters (
    subscription_id TEXT PRIMARY KEY,
    next_seq INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS puzzles (
    id TEXT PRIMARY KEY,
    inserter TEXT NOT NULL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_puzzles_inserter ON puzzles(inserter);
";

/// Durable store over a single `rusqlite::Connection`, guarded by a
/// `parking_lot::Mutex` — the engine already serializes writers with its
/// own lock, so one connection is sufficient and avoids the
/// pooling machinery a busier service would need.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> WotResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> WotResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl EntityStore for SqliteStore {
    fn transaction(&self) -> WotResult<Box<dyn Transaction + '_>> {
        let guard = self.conn.lock();
        guard.execute_batch("BEGIN")?;
        Ok(Box::new(SqliteTransaction {
            conn: guard,
            committed: false,
        }))
    }
}

/// Holds the connection's `MutexGuard` directly rather than a
/// `rusqlite::Transaction<'conn>`, which would need to borrow from the
/// guard it lives alongside — not expressible without a self-referential
/// struct. `BEGIN`/`COMMIT`/`ROLLBACK` are issued by hand instead.
struct SqliteTransaction<'c> {
    conn: MutexGuard<'c, Connection>,
    committed: bool,
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

fn row_identity(row: &rusqlite::Row) -> rusqlite::Result<Identity> {
    let data: String = row.get("data")?;
    serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_trust(row: &rusqlite::Row) -> rusqlite::Result<Trust> {
    let data: String = row.get("data")?;
    serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_score(row: &rusqlite::Row) -> rusqlite::Result<Score> {
    let data: String = row.get("data")?;
    serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_subscription(row: &rusqlite::Row) -> rusqlite::Result<Subscription> {
    let data: String = row.get("data")?;
    serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_notification(row: &rusqlite::Row) -> rusqlite::Result<Notification> {
    let data: String = row.get("data")?;
    serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_puzzle(row: &rusqlite::Row) -> rusqlite::Result<IntroductionPuzzle> {
    let data: String = row.get("data")?;
    serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn kind_str(kind: SubscriptionKind) -> &'static str {
    match kind {
        SubscriptionKind::Identities => "Identities",
        SubscriptionKind::Trusts => "Trusts",
        SubscriptionKind::Scores => "Scores",
    }
}

impl Transaction for SqliteTransaction<'_> {
    fn put_identity(&mut self, identity: &Identity) -> WotResult<()> {
        let data = serde_json::to_string(identity)
            .map_err(|e| WotError::Fatal(format!("serializing identity: {e}")))?;
        self.conn.execute(
            "INSERT INTO identities (id, request_key, is_own, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET request_key=excluded.request_key, is_own=excluded.is_own, data=excluded.data",
            params![
                identity.id.as_str(),
                identity.request_address.key,
                identity.is_own() as i64,
                data
            ],
        )?;
        Ok(())
    }

    fn get_identity(&self, id: &Id) -> WotResult<Option<Identity>> {
        Ok(self
            .conn
            .query_row(
                "SELECT data FROM identities WHERE id = ?1",
                params![id.as_str()],
                row_identity,
            )
            .optional()?)
    }

    fn delete_identity(&mut self, id: &Id) -> WotResult<()> {
        self.conn
            .execute("DELETE FROM identities WHERE id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn identity_by_request_key(&self, key: &str) -> WotResult<Option<Identity>> {
        Ok(self
            .conn
            .query_row(
                "SELECT data FROM identities WHERE request_key = ?1",
                params![key],
                row_identity,
            )
            .optional()?)
    }

    fn all_own_identities(&self) -> WotResult<Vec<Identity>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM identities WHERE is_own = 1")?;
        let rows = stmt.query_map([], row_identity)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn all_identities(&self) -> WotResult<Vec<Identity>> {
        let mut stmt = self.conn.prepare("SELECT data FROM identities")?;
        let rows = stmt.query_map([], row_identity)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn put_trust(&mut self, trust: &Trust) -> WotResult<()> {
        let data = serde_json::to_string(trust)
            .map_err(|e| WotError::Fatal(format!("serializing trust: {e}")))?;
        self.conn.execute(
            "INSERT INTO trusts (truster, trustee, truster_edition, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(truster, trustee) DO UPDATE SET truster_edition=excluded.truster_edition, data=excluded.data",
            params![
                trust.truster.as_str(),
                trust.trustee.as_str(),
                trust.truster_edition as i64,
                data
            ],
        )?;
        Ok(())
    }

    fn get_trust(&self, truster: &Id, trustee: &Id) -> WotResult<Option<Trust>> {
        Ok(self
            .conn
            .query_row(
                "SELECT data FROM trusts WHERE truster = ?1 AND trustee = ?2",
                params![truster.as_str(), trustee.as_str()],
                row_trust,
            )
            .optional()?)
    }

    fn delete_trust(&mut self, truster: &Id, trustee: &Id) -> WotResult<()> {
        self.conn.execute(
            "DELETE FROM trusts WHERE truster = ?1 AND trustee = ?2",
            params![truster.as_str(), trustee.as_str()],
        )?;
        Ok(())
    }

    fn trusts_by_truster(&self, truster: &Id) -> WotResult<Vec<Trust>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM trusts WHERE truster = ?1")?;
        let rows = stmt.query_map(params![truster.as_str()], row_trust)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn trusts_by_trustee(&self, trustee: &Id) -> WotResult<Vec<Trust>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM trusts WHERE trustee = ?1")?;
        let rows = stmt.query_map(params![trustee.as_str()], row_trust)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn trusts_by_truster_older_than(&self, truster: &Id, edition: u64) -> WotResult<Vec<Trust>> {
        let mut stmt = self.conn.prepare(
            "SELECT data FROM trusts WHERE truster = ?1 AND truster_edition < ?2",
        )?;
        let rows = stmt.query_map(params![truster.as_str(), edition as i64], row_trust)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn all_trusts(&self) -> WotResult<Vec<Trust>> {
        let mut stmt = self.conn.prepare("SELECT data FROM trusts")?;
        let rows = stmt.query_map([], row_trust)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn put_score(&mut self, score: &Score) -> WotResult<()> {
        let data = serde_json::to_string(score)
            .map_err(|e| WotError::Fatal(format!("serializing score: {e}")))?;
        self.conn.execute(
            "INSERT INTO scores (truster, trustee, value, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(truster, trustee) DO UPDATE SET value=excluded.value, data=excluded.data",
            params![
                score.truster.as_str(),
                score.trustee.as_str(),
                score.value,
                data
            ],
        )?;
        Ok(())
    }

    fn get_score(&self, truster: &Id, trustee: &Id) -> WotResult<Option<Score>> {
        Ok(self
            .conn
            .query_row(
                "SELECT data FROM scores WHERE truster = ?1 AND trustee = ?2",
                params![truster.as_str(), trustee.as_str()],
                row_score,
            )
            .optional()?)
    }

    fn delete_score(&mut self, truster: &Id, trustee: &Id) -> WotResult<()> {
        self.conn.execute(
            "DELETE FROM scores WHERE truster = ?1 AND trustee = ?2",
            params![truster.as_str(), trustee.as_str()],
        )?;
        Ok(())
    }

    fn scores_by_truster(&self, truster: &Id) -> WotResult<Vec<Score>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM scores WHERE truster = ?1")?;
        let rows = stmt.query_map(params![truster.as_str()], row_score)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn scores_by_trustee(&self, trustee: &Id) -> WotResult<Vec<Score>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM scores WHERE trustee = ?1")?;
        let rows = stmt.query_map(params![trustee.as_str()], row_score)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn identities_by_score_selector(
        &self,
        truster: &Id,
        selector: ScoreSelector,
    ) -> WotResult<Vec<Score>> {
        let clause = match selector {
            ScoreSelector::Positive => "value > 0",
            ScoreSelector::Zero => "value = 0",
            ScoreSelector::Negative => "value < 0",
        };
        let sql = format!("SELECT data FROM scores WHERE truster = ?1 AND {clause}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![truster.as_str()], row_score)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn put_subscription(&mut self, sub: &Subscription) -> WotResult<()> {
        let data = serde_json::to_string(sub)
            .map_err(|e| WotError::Fatal(format!("serializing subscription: {e}")))?;
        self.conn.execute(
            "INSERT INTO subscriptions (id, client_id, kind, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET client_id=excluded.client_id, kind=excluded.kind, data=excluded.data",
            params![sub.id, sub.client_id, kind_str(sub.kind), data],
        )?;
        Ok(())
    }

    fn get_subscription(&self, id: &str) -> WotResult<Option<Subscription>> {
        Ok(self
            .conn
            .query_row(
                "SELECT data FROM subscriptions WHERE id = ?1",
                params![id],
                row_subscription,
            )
            .optional()?)
    }

    fn delete_subscription(&mut self, id: &str) -> WotResult<()> {
        self.conn
            .execute("DELETE FROM subscriptions WHERE id = ?1", params![id])?;
        self.conn
            .execute("DELETE FROM notifications WHERE subscription_id = ?1", params![id])?;
        self.conn.execute(
            "DELETE FROM sequence_counters WHERE subscription_id = ?1",
            params![id],
        )?;
        Ok(())
    }

    fn subscription_by_client_and_kind(
        &self,
        client_id: &str,
        kind: SubscriptionKind,
    ) -> WotResult<Option<Subscription>> {
        Ok(self
            .conn
            .query_row(
                "SELECT data FROM subscriptions WHERE client_id = ?1 AND kind = ?2",
                params![client_id, kind_str(kind)],
                row_subscription,
            )
            .optional()?)
    }

    fn push_notification(&mut self, notification: &Notification) -> WotResult<()> {
        let data = serde_json::to_string(notification)
            .map_err(|e| WotError::Fatal(format!("serializing notification: {e}")))?;
        self.conn.execute(
            "INSERT INTO notifications (subscription_id, sequence_number, data) VALUES (?1, ?2, ?3)",
            params![
                notification.subscription_id,
                notification.sequence_number as i64,
                data
            ],
        )?;
        Ok(())
    }

    fn notifications_after(
        &self,
        subscription_id: &str,
        after_sequence: u64,
    ) -> WotResult<Vec<Notification>> {
        let mut stmt = self.conn.prepare(
            "SELECT data FROM notifications WHERE subscription_id = ?1 AND sequence_number > ?2
             ORDER BY sequence_number ASC",
        )?;
        let rows = stmt.query_map(
            params![subscription_id, after_sequence as i64],
            row_notification,
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn next_sequence_number(&mut self, subscription_id: &str) -> WotResult<u64> {
        self.conn.execute(
            "INSERT INTO sequence_counters (subscription_id, next_seq) VALUES (?1, 1)
             ON CONFLICT(subscription_id) DO UPDATE SET next_seq = next_seq + 1",
            params![subscription_id],
        )?;
        let next: i64 = self.conn.query_row(
            "SELECT next_seq FROM sequence_counters WHERE subscription_id = ?1",
            params![subscription_id],
            |row| row.get(0),
        )?;
        Ok(next as u64)
    }

    fn put_puzzle(&mut self, puzzle: &IntroductionPuzzle) -> WotResult<()> {
        let data = serde_json::to_string(puzzle)
            .map_err(|e| WotError::Fatal(format!("serializing puzzle: {e}")))?;
        self.conn.execute(
            "INSERT INTO puzzles (id, inserter, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET inserter=excluded.inserter, data=excluded.data",
            params![puzzle.id, puzzle.inserter.as_str(), data],
        )?;
        Ok(())
    }

    fn get_puzzle(&self, id: &str) -> WotResult<Option<IntroductionPuzzle>> {
        Ok(self
            .conn
            .query_row(
                "SELECT data FROM puzzles WHERE id = ?1",
                params![id],
                row_puzzle,
            )
            .optional()?)
    }

    fn delete_puzzle(&mut self, id: &str) -> WotResult<()> {
        self.conn
            .execute("DELETE FROM puzzles WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn puzzles_by_inserter(&self, inserter: &Id) -> WotResult<Vec<IntroductionPuzzle>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM puzzles WHERE inserter = ?1")?;
        let rows = stmt.query_map(params![inserter.as_str()], row_puzzle)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn all_puzzles(&self) -> WotResult<Vec<IntroductionPuzzle>> {
        let mut stmt = self.conn.prepare("SELECT data FROM puzzles")?;
        let rows = stmt.query_map([], row_puzzle)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn commit(mut self: Box<Self>) -> WotResult<()> {
        if self.committed {
            return Err(WotError::Fatal("transaction already committed".into()));
        }
        self.conn.execute_batch("COMMIT")?;
        self.committed = true;
        Ok(())
    }
}
