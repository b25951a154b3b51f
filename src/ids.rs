//! Identity IDs and content-hash addressing.
//!
//! An identity ID is a 43-character base64url-alphabet string derived (by
//! the host network, out of scope here) from the identity's public request
//! key. This module only validates the shape and provides the canonical
//! edge/score ID formatting and the deterministic content hashes used for
//! introduction puzzle addresses.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

const ID_LEN: usize = 43;

/// A validated identity ID. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Validate and wrap a candidate identity ID.
    ///
    /// Accepts the base64url alphabet (`A-Za-z0-9-_`) at exactly
    /// [`ID_LEN`] characters. The real network encodes a public key hash
    /// this way; cryptographic derivation itself is out of scope (Non-goal).
    pub fn parse(candidate: impl Into<String>) -> Result<Self, String> {
        let candidate = candidate.into();
        if candidate.len() != ID_LEN {
            return Err(format!(
                "identity id must be {ID_LEN} characters, got {}",
                candidate.len()
            ));
        }
        if !candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err("identity id contains characters outside the base64url alphabet".into());
        }
        Ok(Self(candidate))
    }

    /// Construct without validation. Only for test fixtures and internally
    /// derived IDs that are already known-valid.
    #[cfg(test)]
    pub fn new_unchecked(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical "{truster}@{trustee}" ID shared by `Trust` and `Score`.
pub fn edge_id(truster: &Id, trustee: &Id) -> String {
    format!("{truster}@{trustee}")
}

/// Canonical introduction puzzle ID: "{uuid}@{inserter}".
pub fn puzzle_id(uuid: &uuid::Uuid, inserter: &Id) -> String {
    format!("{uuid}@{inserter}")
}

/// SHA-256 content hash, hex-encoded. Used for puzzle solution addresses
/// and any other content-addressed lookup key the engine needs.
pub fn content_hash_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// The deterministic introduction puzzle insertion address:
/// `"{identity}|Introduction|{date}|{index}"`.
pub fn puzzle_insertion_address(inserter: &Id, date: chrono::NaiveDate, index: u32) -> String {
    format!("{inserter}|Introduction|{date}|{index}")
}

/// The introduction solution fetch address: `KSK:WoT|Introduction|{puzzle_id}|solution`.
pub fn solution_address(puzzle_id: &str) -> String {
    format!("KSK:WoT|Introduction|{puzzle_id}|solution")
}
