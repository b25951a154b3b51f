//! Subscription manager (C6): per-client notification delivery for
//! Identity/Trust/Score changes.
//!
//! Notification delivery via callbacks is modeled as a message channel per
//! subscription with a single-consumer worker; the channel itself only
//! carries a wake-up signal, bounded to one pending wake (backpressure
//! without ever blocking the notifier). The durable content lives in the
//! store's `Notification` rows — an immutable view handed out at subscribe
//! time and reconciled against the backing store rather than trusted to
//! stay in sync on its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{WotError, WotResult};
use crate::model::{Notification, Subscription, SubscriptionKind};
use crate::store::{EntityStore, Transaction};

/// Fixed retry delay after a client nacks or times out a notification.
const RETRY_DELAY: Duration = Duration::from_secs(60);
/// Consecutive delivery failures before the subscription is torn down.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
/// Per-delivery-attempt timeout.
const DELIVERY_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// The client-facing delivery surface. The actual transport (FCP socket,
/// HTTP long-poll, ...) is out of scope; this is the seam production
/// code would bind one to.
#[async_trait]
pub trait SubscriptionClient: Send + Sync {
    /// Ships the full synchronization snapshot at subscribe time. An `Err`
    /// return causes the subscribe call to roll back: the client may
    /// reject, causing rollback of the subscription.
    async fn deliver_snapshot(
        &self,
        subscription_id: &str,
        kind: SubscriptionKind,
        snapshot: Vec<serde_json::Value>,
    ) -> WotResult<()>;

    /// Delivers one notification and waits for the client's ack. `Err`
    /// counts as a delivery failure towards the N=5 termination threshold.
    async fn deliver_notification(&self, notification: &Notification) -> WotResult<()>;

    /// Informed once, after the subscription has been torn down locally.
    async fn subscription_terminated(&self, subscription_id: &str, reason: &str);
}

struct WorkerEntry {
    subscription: Subscription,
    wake: mpsc::Sender<()>,
    terminate: Arc<AtomicBool>,
    #[allow(dead_code)]
    task: JoinHandle<()>,
}

/// Registers subscriptions and drives their delivery workers.
pub struct SubscriptionManager {
    store: Arc<dyn EntityStore>,
    workers: Mutex<HashMap<String, WorkerEntry>>,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// `subscribe(clientID, kind)`: ships the synchronization
    /// snapshot synchronously before committing the subscription row, so a
    /// client-side rejection rolls the whole thing back.
    pub async fn subscribe(
        &self,
        client_id: impl Into<String>,
        kind: SubscriptionKind,
        client: Arc<dyn SubscriptionClient>,
    ) -> WotResult<String> {
        let client_id = client_id.into();
        let mut txn = self.store.transaction()?;
        if let Some(existing) = txn.subscription_by_client_and_kind(&client_id, kind)? {
            return Err(WotError::SubscriptionExistsAlready {
                existing_id: existing.id,
            });
        }

        let subscription_id = Uuid::new_v4().to_string();
        let snapshot = build_snapshot(&*txn, kind)?;
        client
            .deliver_snapshot(&subscription_id, kind, snapshot)
            .await?;

        let subscription = Subscription {
            id: subscription_id.clone(),
            client_id,
            kind,
        };
        txn.put_subscription(&subscription)?;
        txn.commit()?;

        let (wake_tx, wake_rx) = mpsc::channel(1);
        let terminate = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(delivery_worker(
            subscription.id.clone(),
            wake_rx,
            client,
            self.store.clone(),
            terminate.clone(),
        ));
        self.workers.lock().insert(
            subscription.id.clone(),
            WorkerEntry {
                subscription,
                wake: wake_tx,
                terminate,
                task,
            },
        );
        Ok(subscription_id)
    }

    /// `unsubscribe(subscriptionID)`. Idempotent: unsubscribing
    /// an already-terminated (e.g. failed-out) subscription that still has
    /// a store row tears it down the same way.
    pub fn unsubscribe(&self, subscription_id: &str) -> WotResult<()> {
        let mut txn = self.store.transaction()?;
        txn.get_subscription(subscription_id)?
            .ok_or_else(|| WotError::UnknownSubscription(subscription_id.to_string()))?;
        txn.delete_subscription(subscription_id)?;
        txn.commit()?;

        if let Some(entry) = self.workers.lock().remove(subscription_id) {
            entry.terminate.store(true, Ordering::Release);
            // Dropping `entry.wake` closes the channel, which wakes the
            // worker out of `recv().await` even if it never observes the
            // flag directly.
        }
        Ok(())
    }

    /// Appends one Notification per subscription of `kind`, stamped with
    /// that subscription's next sequence number, on every commit of a
    /// mutating transaction. Must run inside the same
    /// transaction as the entity mutation it reports, and the caller MUST
    /// call [`SubscriptionManager::wake`] only after that transaction
    /// commits — workers only ever observe durably committed state.
    pub fn record_change(
        &self,
        txn: &mut dyn Transaction,
        kind: SubscriptionKind,
        old_snapshot: Option<serde_json::Value>,
        new_snapshot: Option<serde_json::Value>,
    ) -> WotResult<()> {
        let ids: Vec<String> = self
            .workers
            .lock()
            .values()
            .filter(|e| e.subscription.kind == kind)
            .map(|e| e.subscription.id.clone())
            .collect();
        for subscription_id in ids {
            let sequence_number = txn.next_sequence_number(&subscription_id)?;
            let notification = Notification {
                subscription_id,
                sequence_number,
                old_snapshot: old_snapshot.clone(),
                new_snapshot: new_snapshot.clone(),
            };
            txn.push_notification(&notification)?;
        }
        Ok(())
    }

    /// Wakes every delivery worker subscribed to `kind` so it re-checks the
    /// store for newly committed notifications. Coalesces: a worker
    /// already mid-delivery simply picks up the new rows on its next pass.
    pub fn wake(&self, kind: SubscriptionKind) {
        for entry in self.workers.lock().values() {
            if entry.subscription.kind == kind {
                let _ = entry.wake.try_send(());
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.workers.lock().len()
    }
}

fn build_snapshot(txn: &dyn Transaction, kind: SubscriptionKind) -> WotResult<Vec<serde_json::Value>> {
    let values = match kind {
        SubscriptionKind::Identities => txn
            .all_identities()?
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>(),
        SubscriptionKind::Trusts => txn
            .all_trusts()?
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>(),
        SubscriptionKind::Scores => {
            let mut scores = Vec::new();
            for owner in txn.all_own_identities()? {
                scores.extend(txn.scores_by_truster(&owner.id)?);
            }
            scores
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()
        }
    };
    values.map_err(|e| WotError::CorruptedData(format!("serializing snapshot: {e}")))
}

async fn delivery_worker(
    subscription_id: String,
    mut wake: mpsc::Receiver<()>,
    client: Arc<dyn SubscriptionClient>,
    store: Arc<dyn EntityStore>,
    terminate: Arc<AtomicBool>,
) {
    let mut last_delivered: u64 = 0;
    let mut consecutive_failures: u32 = 0;

    loop {
        if terminate.load(Ordering::Acquire) {
            return;
        }

        let pending = match store.transaction() {
            Ok(txn) => txn
                .notifications_after(&subscription_id, last_delivered)
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        if pending.is_empty() {
            if wake.recv().await.is_none() {
                return; // channel closed: unsubscribed
            }
            continue;
        }

        for notification in pending {
            loop {
                if terminate.load(Ordering::Acquire) {
                    return;
                }
                let attempt =
                    tokio::time::timeout(DELIVERY_ATTEMPT_TIMEOUT, client.deliver_notification(&notification))
                        .await;
                match attempt {
                    Ok(Ok(())) => {
                        last_delivered = notification.sequence_number;
                        consecutive_failures = 0;
                        break;
                    }
                    Ok(Err(_)) | Err(_) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                            let _ = delete_subscription(&store, &subscription_id);
                            client
                                .subscription_terminated(
                                    &subscription_id,
                                    "client failed to ack 5 consecutive notifications",
                                )
                                .await;
                            return;
                        }
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
    }
}

fn delete_subscription(store: &Arc<dyn EntityStore>, subscription_id: &str) -> WotResult<()> {
    let mut txn = store.transaction()?;
    txn.delete_subscription(subscription_id)?;
    txn.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Id;
    use crate::model::identity::Identity;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Notify;

    fn id(n: u8) -> Id {
        Id::new_unchecked(format!("{}{:02}", "S".repeat(41), n))
    }

    struct RecordingClient {
        snapshots: Mutex<Vec<Vec<serde_json::Value>>>,
        delivered: Mutex<Vec<Notification>>,
        fail_every: Option<u32>,
        calls: AtomicU32,
        terminated: Arc<Notify>,
    }

    impl RecordingClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                snapshots: Mutex::new(Vec::new()),
                delivered: Mutex::new(Vec::new()),
                fail_every: None,
                calls: AtomicU32::new(0),
                terminated: Arc::new(Notify::new()),
            })
        }

        fn always_failing() -> Arc<Self> {
            Arc::new(Self {
                snapshots: Mutex::new(Vec::new()),
                delivered: Mutex::new(Vec::new()),
                fail_every: Some(1),
                calls: AtomicU32::new(0),
                terminated: Arc::new(Notify::new()),
            })
        }
    }

    #[async_trait]
    impl SubscriptionClient for RecordingClient {
        async fn deliver_snapshot(
            &self,
            _subscription_id: &str,
            _kind: SubscriptionKind,
            snapshot: Vec<serde_json::Value>,
        ) -> WotResult<()> {
            self.snapshots.lock().push(snapshot);
            Ok(())
        }

        async fn deliver_notification(&self, notification: &Notification) -> WotResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_every.is_some() {
                return Err(WotError::Transient("client unreachable".into()));
            }
            self.delivered.lock().push(notification.clone());
            Ok(())
        }

        async fn subscription_terminated(&self, _subscription_id: &str, _reason: &str) {
            self.terminated.notify_one();
        }
    }

    #[tokio::test]
    async fn subscribe_ships_snapshot_then_delivers_notifications_in_order() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let owner = id(1);
        {
            let mut txn = store.transaction().unwrap();
            txn.put_identity(&Identity::new_own(owner.clone(), "rk", "insert", Utc::now()))
                .unwrap();
            txn.commit().unwrap();
        }

        let manager = SubscriptionManager::new(store.clone());
        let client = RecordingClient::new();
        let sub_id = manager
            .subscribe("client-a", SubscriptionKind::Identities, client.clone())
            .await
            .unwrap();
        assert_eq!(client.snapshots.lock().len(), 1);
        assert_eq!(client.snapshots.lock()[0].len(), 1);

        {
            let mut txn = store.transaction().unwrap();
            manager
                .record_change(
                    &mut *txn,
                    SubscriptionKind::Identities,
                    None,
                    Some(serde_json::json!({"id": owner.to_string()})),
                )
                .unwrap();
            txn.commit().unwrap();
        }
        manager.wake(SubscriptionKind::Identities);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let delivered = client.delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].subscription_id, sub_id);
        assert_eq!(delivered[0].sequence_number, 1);
    }

    #[tokio::test]
    async fn duplicate_subscription_is_rejected_with_existing_id() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let manager = SubscriptionManager::new(store);
        let client = RecordingClient::new();
        let first = manager
            .subscribe("client-a", SubscriptionKind::Trusts, client.clone())
            .await
            .unwrap();
        let err = manager
            .subscribe("client-a", SubscriptionKind::Trusts, client)
            .await
            .unwrap_err();
        match err {
            WotError::SubscriptionExistsAlready { existing_id } => assert_eq!(existing_id, first),
            other => panic!("expected SubscriptionExistsAlready, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_delivery_failure_terminates_subscription() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
        let manager = SubscriptionManager::new(store.clone());
        let client = RecordingClient::always_failing();
        manager
            .subscribe("client-b", SubscriptionKind::Scores, client.clone())
            .await
            .unwrap();

        {
            let mut txn = store.transaction().unwrap();
            manager
                .record_change(&mut *txn, SubscriptionKind::Scores, None, None)
                .unwrap();
            txn.commit().unwrap();
        }
        manager.wake(SubscriptionKind::Scores);

        tokio::time::timeout(Duration::from_secs(2), client.terminated.notified())
            .await
            .expect("subscription should terminate after repeated failures");
        assert!(client.calls.load(Ordering::SeqCst) >= MAX_CONSECUTIVE_FAILURES);
    }
}
