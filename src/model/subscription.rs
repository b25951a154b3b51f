//! Subscription / Notification entities.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    Identities,
    Trusts,
    Scores,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub client_id: String,
    pub kind: SubscriptionKind,
}

/// A durable notification record. `old_snapshot`/`new_snapshot` are
/// serialized entity snapshots (JSON), `None` for a deletion/creation
/// respectively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub subscription_id: String,
    pub sequence_number: u64,
    pub old_snapshot: Option<serde_json::Value>,
    pub new_snapshot: Option<serde_json::Value>,
}
