//! Identity entity.

use crate::error::{WotError, WotResult};
use crate::ids::Id;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MAX_NICKNAME_BYTES: usize = 30;
const MAX_CONTEXTS: usize = 32;
const MAX_CONTEXT_BYTES: usize = 32;
const MAX_PROPERTIES: usize = 64;
const MAX_PROPERTY_NAME_BYTES: usize = 256;
const MAX_PROPERTY_VALUE_BYTES: usize = 10_240;

/// Conservative nickname whitelist: letters, digits, space, and a small set
/// of punctuation. No control characters, no bidi-format characters.
static NICKNAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\p{L}\p{N} ._'\-]+$").expect("static regex is valid"));

/// Fetch state of an identity's current edition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchState {
    NotFetched,
    Fetched,
    ParsingFailed,
}

/// Nickname: validated, ≤30 bytes, immutable once set on an `Identity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nickname(String);

impl Nickname {
    pub fn parse(candidate: impl Into<String>) -> WotResult<Self> {
        let candidate = candidate.into();
        if candidate.is_empty() || candidate.len() > MAX_NICKNAME_BYTES {
            return Err(WotError::InvalidParameter(format!(
                "nickname must be 1..={MAX_NICKNAME_BYTES} bytes, got {}",
                candidate.len()
            )));
        }
        if !NICKNAME_PATTERN.is_match(&candidate) {
            return Err(WotError::InvalidParameter(
                "nickname contains characters outside the conservative whitelist".into(),
            ));
        }
        Ok(Self(candidate))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A context tag: an opaque, short, application-domain label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(String);

impl Context {
    pub fn parse(candidate: impl Into<String>) -> WotResult<Self> {
        let candidate = candidate.into();
        if candidate.is_empty() || candidate.len() > MAX_CONTEXT_BYTES {
            return Err(WotError::InvalidParameter(format!(
                "context tag must be 1..={MAX_CONTEXT_BYTES} bytes, got {}",
                candidate.len()
            )));
        }
        Ok(Self(candidate))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An identity's set of declared application-domain contexts, capped at
/// [`MAX_CONTEXTS`] entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextSet(std::collections::BTreeSet<Context>);

impl ContextSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ctx: Context) -> WotResult<()> {
        if !self.0.contains(&ctx) && self.0.len() >= MAX_CONTEXTS {
            return Err(WotError::InvalidParameter(format!(
                "identity already declares the maximum of {MAX_CONTEXTS} contexts"
            )));
        }
        self.0.insert(ctx);
        Ok(())
    }

    pub fn remove(&mut self, ctx: &Context) {
        self.0.remove(ctx);
    }

    pub fn contains(&self, ctx: &Context) -> bool {
        self.0.contains(ctx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Context> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Property map: name (≤256 bytes) → value (≤10240 bytes), ≤64 entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertyMap(BTreeMap<String, String>);

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> WotResult<()> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() || name.len() > MAX_PROPERTY_NAME_BYTES {
            return Err(WotError::InvalidParameter(format!(
                "property name must be 1..={MAX_PROPERTY_NAME_BYTES} bytes"
            )));
        }
        if value.len() > MAX_PROPERTY_VALUE_BYTES {
            return Err(WotError::InvalidParameter(format!(
                "property value must be <= {MAX_PROPERTY_VALUE_BYTES} bytes"
            )));
        }
        if !self.0.contains_key(&name) && self.0.len() >= MAX_PROPERTIES {
            return Err(WotError::InvalidParameter(format!(
                "identity already has the maximum of {MAX_PROPERTIES} properties"
            )));
        }
        self.0.insert(name, value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// The network address an identity's documents are fetched from, plus the
/// monotonically increasing edition counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAddress {
    pub key: String,
    pub edition: u64,
}

/// Per-`OwnIdentity` configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnIdentityConfig {
    pub publishes_introduction_puzzles: bool,
    pub puzzle_count: u32,
    pub auto_update_trust_list: bool,
}

impl Default for OwnIdentityConfig {
    fn default() -> Self {
        Self {
            publishes_introduction_puzzles: false,
            puzzle_count: 10,
            auto_update_trust_list: true,
        }
    }
}

/// Data present only on the `OwnIdentity` variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnIdentityData {
    /// Private-key insertion URI. Never logged in full.
    pub insert_address: String,
    pub last_insert_date: Option<DateTime<Utc>>,
    pub config: OwnIdentityConfig,
}

/// Tagged variant replacing inheritance of `OwnIdentity` from `Identity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Identity,
    OwnIdentity,
}

/// An identity known to the engine. `own` is `Some` iff this is an
/// `OwnIdentity` — all operations dispatch on that, rather than on a
/// separate subclass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Id,
    pub request_address: RequestAddress,
    pub edition_hint: u64,
    pub nickname: Option<Nickname>,
    pub does_publish_trust_list: bool,
    pub contexts: ContextSet,
    pub properties: PropertyMap,
    pub fetch_state: FetchState,
    pub creation_date: DateTime<Utc>,
    pub last_change_date: DateTime<Utc>,
    pub last_fetched_date: Option<DateTime<Utc>>,
    pub own: Option<OwnIdentityData>,
}

impl Identity {
    pub fn new_non_own(id: Id, request_key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            request_address: RequestAddress {
                key: request_key.into(),
                edition: 0,
            },
            edition_hint: 0,
            nickname: None,
            does_publish_trust_list: false,
            contexts: ContextSet::new(),
            properties: PropertyMap::new(),
            fetch_state: FetchState::NotFetched,
            creation_date: now,
            last_change_date: now,
            last_fetched_date: None,
            own: None,
        }
    }

    pub fn new_own(
        id: Id,
        request_key: impl Into<String>,
        insert_address: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut identity = Self::new_non_own(id, request_key, now);
        identity.own = Some(OwnIdentityData {
            insert_address: insert_address.into(),
            last_insert_date: None,
            config: OwnIdentityConfig::default(),
        });
        identity
    }

    pub fn kind(&self) -> IdentityKind {
        if self.own.is_some() {
            IdentityKind::OwnIdentity
        } else {
            IdentityKind::Identity
        }
    }

    pub fn is_own(&self) -> bool {
        self.own.is_some()
    }

    /// Set the nickname if not already set. Immutable once set.
    pub fn set_nickname_once(&mut self, nickname: Nickname) -> WotResult<()> {
        if self.nickname.is_some() {
            return Err(WotError::InvalidParameter(
                "nickname is already set and is immutable".into(),
            ));
        }
        self.nickname = Some(nickname);
        Ok(())
    }

    pub fn own_config_mut(&mut self) -> WotResult<&mut OwnIdentityConfig> {
        self.own
            .as_mut()
            .map(|o| &mut o.config)
            .ok_or_else(|| WotError::InvalidParameter("identity is not an OwnIdentity".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Id;

    fn id() -> Id {
        Id::new_unchecked("A".repeat(43))
    }

    #[test]
    fn nickname_rejects_oversized() {
        assert!(Nickname::parse("x".repeat(31)).is_err());
    }

    #[test]
    fn nickname_rejects_control_chars() {
        assert!(Nickname::parse("bad\u{0000}name").is_err());
    }

    #[test]
    fn nickname_accepts_plain_text() {
        assert!(Nickname::parse("Alice W.").is_ok());
    }

    #[test]
    fn nickname_is_immutable_once_set() {
        let mut identity = Identity::new_non_own(id(), "key", Utc::now());
        identity
            .set_nickname_once(Nickname::parse("Alice").unwrap())
            .unwrap();
        let err = identity
            .set_nickname_once(Nickname::parse("Bob").unwrap())
            .unwrap_err();
        assert!(matches!(err, WotError::InvalidParameter(_)));
    }

    #[test]
    fn context_set_caps_at_max() {
        let mut set = ContextSet::new();
        for i in 0..MAX_CONTEXTS {
            set.insert(Context::parse(format!("ctx{i}")).unwrap()).unwrap();
        }
        assert!(set.insert(Context::parse("overflow").unwrap()).is_err());
    }

    #[test]
    fn property_map_rejects_oversized_value() {
        let mut props = PropertyMap::new();
        let err = props
            .set("k", "v".repeat(MAX_PROPERTY_VALUE_BYTES + 1))
            .unwrap_err();
        assert!(matches!(err, WotError::InvalidParameter(_)));
    }

    #[test]
    fn own_identity_carries_own_data() {
        let identity = Identity::new_own(id(), "key", "insert-uri", Utc::now());
        assert_eq!(identity.kind(), IdentityKind::OwnIdentity);
        assert!(identity.is_own());
    }
}
