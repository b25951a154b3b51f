//! Importer: applies one polled [`IdentityFile`] atomically —
//! decode, verify, merge identity metadata, hand the trust list to the
//! graph engine — then re-triggers itself while the queue stays
//! non-empty. Malformed documents are quarantined rather than retried:
//! a transient store failure is the only case that should cause the
//! caller to retry the whole poll.

use std::sync::Arc;

use crate::capability::Clock;
use crate::error::{WotError, WotResult};
use crate::graph::{AdvertisedEdge, TrustGraphEngine};
use crate::model::identity::{Context, FetchState, Identity, Nickname};
use crate::model::SubscriptionKind;
use crate::queue::{IdentityFile, IdentityFileQueue};
use crate::store::EntityStore;
use crate::subscription::SubscriptionManager;
use crate::xml::XmlCodec;

/// Runs one import cycle: polls at most one file and applies it. Returns
/// `true` if a file was polled (whether or not it imported cleanly), so the
/// caller can keep calling this in a loop until the queue is drained.
pub fn run_importer_once(
    queue: &dyn IdentityFileQueue,
    store: &dyn EntityStore,
    codec: &dyn XmlCodec,
    graph: &TrustGraphEngine,
    clock: &dyn Clock,
    subscriptions: &Arc<SubscriptionManager>,
) -> WotResult<bool> {
    let polled = match queue.poll() {
        Some(p) => p,
        None => return Ok(false),
    };

    let file = polled.file();
    let outcome = import_one(store, codec, graph, clock, subscriptions, file);

    match outcome {
        Ok(()) => {
            polled.close();
            Ok(true)
        }
        // Malformed data never becomes valid on retry — quarantine by
        // dropping it from the queue: a document that fails to parse or
        // whose declared identity mismatches is discarded, not retried.
        Err(err @ (WotError::CorruptedData(_) | WotError::InvalidParameter(_))) => {
            log::warn!("discarding unimportable identity file: {err}");
            polled.close();
            Ok(true)
        }
        Err(err) => {
            polled.close();
            Err(err)
        }
    }
}

fn import_one(
    store: &dyn EntityStore,
    codec: &dyn XmlCodec,
    graph: &TrustGraphEngine,
    clock: &dyn Clock,
    subscriptions: &Arc<SubscriptionManager>,
    file: &IdentityFile,
) -> WotResult<()> {
    let document = codec.decode_identity(&file.bytes)?;

    if document.identity != file.identity {
        return Err(WotError::CorruptedData(format!(
            "document declares identity {} but was fetched for {}",
            document.identity, file.identity
        )));
    }

    let mut txn = store.transaction()?;
    let mut identity = txn
        .get_identity(&file.identity)?
        .ok_or_else(|| WotError::UnknownIdentity(file.identity.to_string()))?;
    let before = serde_json::to_value(&identity).map_err(|e| {
        WotError::CorruptedData(format!("serializing identity notification: {e}"))
    })?;

    if file.edition < identity.request_address.edition && identity.fetch_state == FetchState::Fetched {
        // Stale redelivery of an edition we've already applied; nothing to do.
        return txn.commit();
    }

    let now = clock.now();
    if let Some(nickname) = &document.nickname {
        let parsed = Nickname::parse(nickname.as_str())?;
        // set_nickname_once is a no-op error if already set; the nickname
        // field is immutable once claimed, so a later document attempting
        // to change it is silently ignored rather than rejecting the
        // whole import.
        let _ = identity.set_nickname_once(parsed);
    }

    identity.does_publish_trust_list = document.does_publish_trust_list;

    let mut wanted_contexts = crate::model::identity::ContextSet::new();
    for ctx in &document.contexts {
        wanted_contexts.insert(Context::parse(ctx.as_str())?)?;
    }
    identity.contexts = wanted_contexts;

    let mut properties = crate::model::identity::PropertyMap::new();
    for (name, value) in &document.properties {
        properties.set(name.clone(), value.clone())?;
    }
    identity.properties = properties;

    identity.request_address.edition = file.edition;
    identity.fetch_state = FetchState::Fetched;
    identity.last_fetched_date = Some(now);
    identity.last_change_date = now;
    txn.put_identity(&identity)?;
    let after = serde_json::to_value(&identity).map_err(|e| {
        WotError::CorruptedData(format!("serializing identity notification: {e}"))
    })?;
    subscriptions.record_change(&mut *txn, SubscriptionKind::Identities, Some(before), Some(after))?;

    if identity.does_publish_trust_list {
        let edges = document
            .trust_list
            .into_iter()
            .map(|advertised| {
                Ok(AdvertisedEdge {
                    trustee: advertised.trustee,
                    value: crate::model::trust::TrustValue::parse(advertised.value)?,
                    comment: crate::model::trust::Comment::parse(advertised.comment)?,
                })
            })
            .collect::<WotResult<Vec<_>>>()?;
        graph.import_trust_list(&mut *txn, &file.identity, edges, file.edition)?;
    }

    txn.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SystemClock;
    use crate::ids::Id;
    use crate::queue::DedupQueue;
    use crate::xml::{AdvertisedTrust, IdentityDocument};
    use chrono::Utc;
    use std::sync::Arc;

    fn id(n: u8) -> Id {
        Id::new_unchecked(format!("{}{:02}", "I".repeat(41), n))
    }

    struct FakeCodec(IdentityDocument);

    impl XmlCodec for FakeCodec {
        fn encode_identity(&self, _: &IdentityDocument) -> WotResult<Vec<u8>> {
            unimplemented!()
        }
        fn decode_identity(&self, _: &[u8]) -> WotResult<IdentityDocument> {
            Ok(self.0.clone())
        }
        fn encode_puzzle(&self, _: &crate::xml::PuzzleDocument) -> WotResult<Vec<u8>> {
            unimplemented!()
        }
        fn decode_puzzle(&self, _: &[u8]) -> WotResult<crate::xml::PuzzleDocument> {
            unimplemented!()
        }
        fn encode_introduction_solution(
            &self,
            _: &crate::xml::IntroductionSolutionDocument,
        ) -> WotResult<Vec<u8>> {
            unimplemented!()
        }
        fn decode_introduction_solution(
            &self,
            _: &[u8],
        ) -> WotResult<crate::xml::IntroductionSolutionDocument> {
            unimplemented!()
        }
    }

    #[test]
    fn imports_trust_list_and_advances_edition() {
        let store = crate::store::MemoryStore::new();
        let truster = id(1);
        let trustee = id(2);
        {
            let mut txn = store.transaction().unwrap();
            txn.put_identity(&Identity::new_non_own(truster.clone(), "rk", Utc::now()))
                .unwrap();
            txn.put_identity(&Identity::new_own(trustee.clone(), "rk2", "insert", Utc::now()))
                .unwrap();
            txn.commit().unwrap();
        }

        let document = IdentityDocument {
            identity: truster.clone(),
            nickname: Some(Nickname::parse("Alice").unwrap()),
            does_publish_trust_list: true,
            contexts: vec![],
            properties: vec![],
            trust_list: vec![AdvertisedTrust {
                trustee: trustee.clone(),
                value: 100,
                comment: "friend".into(),
            }],
        };
        let codec = FakeCodec(document);
        let queue = DedupQueue::new(Arc::new(SystemClock));
        queue.add(IdentityFile {
            identity: truster.clone(),
            edition: 3,
            bytes: vec![],
        });
        let subscriptions = Arc::new(crate::subscription::SubscriptionManager::new(Arc::new(
            crate::store::MemoryStore::new(),
        )));
        let graph = TrustGraphEngine::new(Arc::new(SystemClock), subscriptions.clone());

        let processed =
            run_importer_once(&queue, &store, &codec, &graph, &SystemClock, &subscriptions).unwrap();
        assert!(processed);

        let txn = store.transaction().unwrap();
        let stored = txn.get_identity(&truster).unwrap().unwrap();
        assert_eq!(stored.nickname.unwrap().as_str(), "Alice");
        assert_eq!(stored.request_address.edition, 3);
        assert_eq!(stored.fetch_state, FetchState::Fetched);

        let score = txn.get_score(&trustee, &truster).unwrap().unwrap();
        assert_eq!(score.value, 100);
    }

    #[test]
    fn mismatched_declared_identity_is_quarantined() {
        let store = crate::store::MemoryStore::new();
        let expected = id(1);
        let other = id(2);
        {
            let mut txn = store.transaction().unwrap();
            txn.put_identity(&Identity::new_non_own(expected.clone(), "rk", Utc::now()))
                .unwrap();
            txn.commit().unwrap();
        }

        let document = IdentityDocument {
            identity: other,
            nickname: None,
            does_publish_trust_list: false,
            contexts: vec![],
            properties: vec![],
            trust_list: vec![],
        };
        let codec = FakeCodec(document);
        let queue = DedupQueue::new(Arc::new(SystemClock));
        queue.add(IdentityFile {
            identity: expected,
            edition: 0,
            bytes: vec![],
        });
        let subscriptions = Arc::new(crate::subscription::SubscriptionManager::new(Arc::new(
            crate::store::MemoryStore::new(),
        )));
        let graph = TrustGraphEngine::new(Arc::new(SystemClock), subscriptions.clone());

        let processed =
            run_importer_once(&queue, &store, &codec, &graph, &SystemClock, &subscriptions).unwrap();
        assert!(processed);
        assert_eq!(queue.size(), 0);
    }
}
