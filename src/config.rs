//! Engine configuration, env-var-driven: tunables across the store,
//! queue, downloader, subscription, and introduction components are each
//! exposed as one `WOT_*` environment variable with a hardcoded fallback.

use std::env;

/// Which [`crate::store::EntityStore`] backend [`crate::Engine::open`]
/// constructs. `WOT_STORE_BACKEND=memory` is for tests and scratch runs;
/// `sqlite` (the default) is the durable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

impl StoreBackend {
    pub fn from_env() -> Self {
        match env::var("WOT_STORE_BACKEND").unwrap_or_default().to_lowercase().as_str() {
            "memory" | "mem" => Self::Memory,
            _ => Self::Sqlite,
        }
    }
}

/// Which [`crate::queue::IdentityFileQueue`] implementation the importer
/// pipeline runs against. `Dedup` is the default; tests must not depend
/// on delivery ordering between editions of the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Dedup,
    Fifo,
}

impl QueueKind {
    pub fn from_env() -> Self {
        match env::var("WOT_QUEUE_KIND").unwrap_or_default().to_lowercase().as_str() {
            "fifo" => Self::Fifo,
            _ => Self::Dedup,
        }
    }
}

/// Engine-wide configuration, resolved from the environment with
/// documented defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store_backend: StoreBackend,
    /// Path to the SQLite database file. Ignored for the memory backend.
    /// `WOT_DB_PATH`, default `"wot.sqlite3"`.
    pub db_path: String,
    pub queue_kind: QueueKind,
    /// Debounce window before a dirty own-identity is re-inserted.
    /// `WOT_INSERT_DEBOUNCE_SECS`, default 300 seconds.
    pub insert_debounce_seconds: u64,
    /// `WOT_SUBSCRIPTION_SCORE_THRESHOLD`: minimum best score an
    /// identity must have for the client puzzle pool to consider it an
    /// introduction candidate. Default 0.
    pub introduction_score_threshold: i64,
    /// How often [`crate::Engine::run_background_jobs`] re-triggers the
    /// fetch-reconciliation job that diffs identities-of-interest against
    /// in-flight downloader tasks. `WOT_FETCH_RECONCILE_SECS`, default 60
    /// seconds.
    pub fetch_reconciliation_interval_seconds: u64,
    /// How often the client-side introduction puzzle pool is polled for
    /// new candidates to download from. `WOT_INTRODUCTION_POLL_SECS`,
    /// default 300 seconds.
    pub client_introduction_poll_interval_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::from_env(),
            db_path: env::var("WOT_DB_PATH").unwrap_or_else(|_| "wot.sqlite3".to_string()),
            queue_kind: QueueKind::from_env(),
            insert_debounce_seconds: env::var("WOT_INSERT_DEBOUNCE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            introduction_score_threshold: env::var("WOT_SUBSCRIPTION_SCORE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            fetch_reconciliation_interval_seconds: env::var("WOT_FETCH_RECONCILE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            client_introduction_poll_interval_seconds: env::var("WOT_INTRODUCTION_POLL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_backend_defaults_to_sqlite_for_unset_or_unknown_value() {
        assert_eq!(
            match env::var("WOT_STORE_BACKEND").unwrap_or_default().to_lowercase().as_str() {
                "memory" | "mem" => StoreBackend::Memory,
                _ => StoreBackend::Sqlite,
            },
            StoreBackend::from_env()
        );
    }

    #[test]
    fn queue_kind_defaults_to_dedup() {
        assert_eq!(QueueKind::from_env() == QueueKind::Fifo, env::var("WOT_QUEUE_KIND").as_deref() == Ok("fifo"));
    }

    #[test]
    fn engine_config_default_uses_documented_constants() {
        let config = EngineConfig::default();
        // Absent overrides in this test process's environment, the
        // documented defaults apply.
        if env::var("WOT_INSERT_DEBOUNCE_SECS").is_err() {
            assert_eq!(config.insert_debounce_seconds, 300);
        }
        if env::var("WOT_SUBSCRIPTION_SCORE_THRESHOLD").is_err() {
            assert_eq!(config.introduction_score_threshold, 0);
        }
        if env::var("WOT_FETCH_RECONCILE_SECS").is_err() {
            assert_eq!(config.fetch_reconciliation_interval_seconds, 60);
        }
        if env::var("WOT_INTRODUCTION_POLL_SECS").is_err() {
            assert_eq!(config.client_introduction_poll_interval_seconds, 300);
        }
    }
}
