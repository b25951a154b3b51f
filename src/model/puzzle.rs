//! IntroductionPuzzle entity.

use crate::ids::Id;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PuzzleType {
    Captcha,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroductionPuzzle {
    /// "{uuid}@{inserter}" — encodes the inserter ID for authenticity.
    pub id: String,
    pub inserter: Id,
    pub puzzle_type: PuzzleType,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub date_of_insertion: NaiveDate,
    pub index: u32,
    pub valid_until: DateTime<Utc>,
    /// Present only on locally generated puzzles, and after a remote
    /// solver submits a solution.
    pub solution: Option<String>,
    /// The OwnIdentity that solved a remote puzzle.
    pub solver: Option<Id>,
    pub was_solved: bool,
    pub was_inserted: bool,
}

impl IntroductionPuzzle {
    pub fn new_own(
        id: String,
        inserter: Id,
        mime_type: impl Into<String>,
        data: Vec<u8>,
        solution: String,
        date_of_insertion: NaiveDate,
        index: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            inserter,
            puzzle_type: PuzzleType::Captcha,
            mime_type: mime_type.into(),
            data,
            date_of_insertion,
            index,
            valid_until: now + chrono::Duration::days(3),
            solution: Some(solution),
            solver: None,
            was_solved: false,
            was_inserted: false,
        }
    }

    pub fn new_downloaded(
        id: String,
        inserter: Id,
        mime_type: impl Into<String>,
        data: Vec<u8>,
        date_of_insertion: NaiveDate,
        index: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            inserter,
            puzzle_type: PuzzleType::Captcha,
            mime_type: mime_type.into(),
            data,
            date_of_insertion,
            index,
            valid_until: now + chrono::Duration::days(3),
            solution: None,
            solver: None,
            was_solved: false,
            was_inserted: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_until_is_three_days_after_insertion() {
        let now = Utc::now();
        let inserter = Id::new_unchecked("A".repeat(43));
        let puzzle = IntroductionPuzzle::new_own(
            "u@i".into(),
            inserter,
            "image/png",
            vec![1, 2, 3],
            "SOLUTION".into(),
            now.date_naive(),
            0,
            now,
        );
        assert_eq!(puzzle.valid_until, now + chrono::Duration::days(3));
        assert!(!puzzle.is_expired(now));
        assert!(puzzle.is_expired(now + chrono::Duration::days(4)));
    }
}
