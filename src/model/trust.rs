//! Trust entity: a directed, signed opinion edge.

use crate::error::{WotError, WotResult};
use crate::ids::{edge_id, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MAX_COMMENT_BYTES: usize = 256;
const MIN_VALUE: i32 = -100;
const MAX_VALUE: i32 = 100;

/// A comment attached to a trust edge: UTF-8, ≤256 bytes, no line breaks,
/// no control characters, no bidi-format characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Comment(String);

impl Comment {
    pub fn parse(candidate: impl Into<String>) -> WotResult<Self> {
        let candidate = candidate.into();
        if candidate.len() > MAX_COMMENT_BYTES {
            return Err(WotError::InvalidParameter(format!(
                "comment must be <= {MAX_COMMENT_BYTES} bytes, got {}",
                candidate.len()
            )));
        }
        if candidate.chars().any(|c| {
            c == '\n' || c == '\r' || is_control_or_bidi(c)
        }) {
            return Err(WotError::InvalidParameter(
                "comment contains a line break, control character, or bidi-format character"
                    .into(),
            ));
        }
        Ok(Self(candidate))
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_control_or_bidi(c: char) -> bool {
    if c.is_control() {
        return true;
    }
    matches!(
        c,
        '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' | '\u{200E}' | '\u{200F}'
    )
}

/// A validated trust value in `[-100, 100]`. 0 counts as positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustValue(i32);

impl TrustValue {
    pub fn parse(value: i32) -> WotResult<Self> {
        if !(MIN_VALUE..=MAX_VALUE).contains(&value) {
            return Err(WotError::InvalidParameter(format!(
                "trust value must be in [{MIN_VALUE}, {MAX_VALUE}], got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i32 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 >= 0
    }
}

/// A directed trust edge from `truster` to `trustee`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trust {
    pub truster: Id,
    pub trustee: Id,
    pub value: TrustValue,
    pub comment: Comment,
    /// Edition of the truster's trust list this edge was last observed in.
    /// Used to evict removed edges without recomputing every trustee's
    /// score.
    pub truster_edition: u64,
    pub last_change_date: DateTime<Utc>,
}

impl Trust {
    pub fn new(
        truster: Id,
        trustee: Id,
        value: TrustValue,
        comment: Comment,
        truster_edition: u64,
        now: DateTime<Utc>,
    ) -> WotResult<Self> {
        if truster == trustee {
            return Err(WotError::InvalidParameter(
                "a trust edge cannot have the same truster and trustee".into(),
            ));
        }
        Ok(Self {
            truster,
            trustee,
            value,
            comment,
            truster_edition,
            last_change_date: now,
        })
    }

    pub fn id(&self) -> String {
        edge_id(&self.truster, &self.trustee)
    }
}
