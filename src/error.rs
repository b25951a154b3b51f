//! Error taxonomy for the web-of-trust engine.
//!
//! One enum, one variant per failure kind from the design's error taxonomy.
//! `Duplicate` and `CorruptedData` are always bugs or on-disk corruption and
//! are logged at `error!` by the call site that detects them; the
//! well-defined "no such row" kinds are not logged above `debug!`.

use thiserror::Error;

/// Canonical engine error. Returned by every fallible public operation.
#[derive(Debug, Error)]
pub enum WotError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("unknown puzzle: {0}")]
    UnknownPuzzle(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("no such context: {0}")]
    NoSuchContext(String),

    #[error("not trusted: {truster} has no trust for {trustee}")]
    NotTrusted { truster: String, trustee: String },

    #[error("not in trust tree: {0} is unreachable from the given owner")]
    NotInTrustTree(String),

    #[error("duplicate row violates a uniqueness invariant: {0}")]
    Duplicate(String),

    /// Soft error: the client already holds a subscription of this kind.
    #[error("subscription already exists: {existing_id}")]
    SubscriptionExistsAlready { existing_id: String },

    #[error("corrupted data, quarantined: {0}")]
    CorruptedData(String),

    #[error("transient failure, should be retried: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type WotResult<T> = Result<T, WotError>;

impl WotError {
    /// Stable machine-readable kind string, used by the control surface's
    /// `Description` field and never localized.
    pub fn description_kind(&self) -> &'static str {
        match self {
            WotError::InvalidParameter(_) => "InvalidParameter",
            WotError::UnknownIdentity(_) => "UnknownIdentity",
            WotError::UnknownPuzzle(_) => "UnknownPuzzle",
            WotError::UnknownSubscription(_) => "UnknownSubscription",
            WotError::NoSuchContext(_) => "NoSuchContext",
            WotError::NotTrusted { .. } => "NotTrusted",
            WotError::NotInTrustTree(_) => "NotInTrustTree",
            WotError::Duplicate(_) => "Duplicate",
            WotError::SubscriptionExistsAlready { .. } => "SubscriptionExistsAlready",
            WotError::CorruptedData(_) => "CorruptedData",
            WotError::Transient(_) => "Transient",
            WotError::Fatal(_) => "Fatal",
        }
    }
}

impl From<rusqlite::Error> for WotError {
    fn from(e: rusqlite::Error) -> Self {
        WotError::Transient(format!("sqlite: {e}"))
    }
}
