//! FCP-style command dispatcher: maps a request
//! [`Frame`] onto the engine's store/graph/subscription/introduction
//! operations and produces a reply `Frame`. The transport that ships
//! frames over a socket is out of scope — a host binds
//! [`Dispatcher::dispatch`] to whatever listener it runs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::capability::Clock;
use crate::error::{WotError, WotResult};
use crate::graph::TrustGraphEngine;
use crate::ids::Id;
use crate::introduction::client::{ClientPuzzlePool, SolutionInsertClient};
use crate::model::identity::Identity;
use crate::model::score::ScoreSelector;
use crate::model::trust::{Comment, TrustValue};
use crate::model::{Score, SubscriptionKind, Trust};
use crate::store::EntityStore;
use crate::subscription::{SubscriptionClient, SubscriptionManager};

use super::frame::Frame;

/// The client-facing sink a subscription's notifications and synchronous
/// snapshot are rendered to as frames. The actual socket write is out of
/// scope; a host binds this to its transport.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: Frame) -> WotResult<()>;
}

struct FrameSubscriptionClient {
    sink: Arc<dyn FrameSink>,
}

#[async_trait]
impl SubscriptionClient for FrameSubscriptionClient {
    async fn deliver_snapshot(
        &self,
        subscription_id: &str,
        kind: SubscriptionKind,
        snapshot: Vec<serde_json::Value>,
    ) -> WotResult<()> {
        let mut frame = Frame::new("Snapshot");
        frame.set("SubscriptionID", subscription_id);
        frame.set("To", kind_label(kind));
        frame.set_amount("Snapshot", snapshot.len());
        for (i, value) in snapshot.iter().enumerate() {
            frame.set_indexed("Snapshot", i, "Value", value.to_string());
        }
        self.sink.send(frame).await
    }

    async fn deliver_notification(&self, notification: &crate::model::Notification) -> WotResult<()> {
        let mut frame = Frame::new("Notification");
        frame.set("SubscriptionID", notification.subscription_id.as_str());
        frame.set("Sequence", notification.sequence_number.to_string());
        if let Some(old) = &notification.old_snapshot {
            frame.set("OldValue", old.to_string());
        }
        if let Some(new) = &notification.new_snapshot {
            frame.set("NewValue", new.to_string());
        }
        self.sink.send(frame).await
    }

    async fn subscription_terminated(&self, subscription_id: &str, reason: &str) {
        let mut frame = Frame::new("SubscriptionTerminated");
        frame.set("SubscriptionID", subscription_id);
        frame.set("Reason", reason);
        let _ = self.sink.send(frame).await;
    }
}

fn kind_label(kind: SubscriptionKind) -> &'static str {
    match kind {
        SubscriptionKind::Identities => "Identities",
        SubscriptionKind::Trusts => "Trusts",
        SubscriptionKind::Scores => "Scores",
    }
}

fn parse_kind(label: &str) -> WotResult<SubscriptionKind> {
    match label {
        "Identities" => Ok(SubscriptionKind::Identities),
        "Trusts" => Ok(SubscriptionKind::Trusts),
        "Scores" => Ok(SubscriptionKind::Scores),
        other => Err(WotError::InvalidParameter(format!(
            "unknown subscription kind {other:?}, expected Identities/Trusts/Scores"
        ))),
    }
}

fn required<'a>(frame: &'a Frame, key: &str) -> WotResult<&'a str> {
    frame
        .get(key)
        .ok_or_else(|| WotError::InvalidParameter(format!("missing required field {key:?}")))
}

fn parse_id(frame: &Frame, key: &str) -> WotResult<Id> {
    Id::parse(required(frame, key)?).map_err(WotError::InvalidParameter)
}

/// Dispatches control-surface commands against the engine's store, trust
/// graph, subscription manager, and client-side introduction pool.
pub struct Dispatcher {
    store: Arc<dyn EntityStore>,
    graph: Arc<TrustGraphEngine>,
    subscriptions: Arc<SubscriptionManager>,
    puzzle_pool: Arc<ClientPuzzlePool>,
    solution_insert_client: Arc<dyn SolutionInsertClient>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn EntityStore>,
        graph: Arc<TrustGraphEngine>,
        subscriptions: Arc<SubscriptionManager>,
        puzzle_pool: Arc<ClientPuzzlePool>,
        solution_insert_client: Arc<dyn SolutionInsertClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            graph,
            subscriptions,
            puzzle_pool,
            solution_insert_client,
            clock,
        }
    }

    /// Dispatches one request frame, returning either the success reply
    /// or an `"Error"` frame carrying `Description` (the error's stable
    /// machine-readable kind) and `Detail` (the display message).
    pub async fn dispatch(&self, request: &Frame, sink: Option<Arc<dyn FrameSink>>) -> Frame {
        match self.handle(request, sink).await {
            Ok(reply) => reply,
            Err(err) => {
                let mut frame = Frame::new("Error");
                frame.set("Description", err.description_kind());
                frame.set("Detail", err.to_string());
                frame
            }
        }
    }

    async fn handle(&self, request: &Frame, sink: Option<Arc<dyn FrameSink>>) -> WotResult<Frame> {
        match request.message() {
            "Ping" => Ok(Frame::new("Pong")),
            "CreateIdentity" => self.create_identity(request),
            "AddIdentity" => self.add_identity(request),
            "GetIdentity" => self.get_identity(request),
            "GetIdentities" => self.get_identities(),
            "SetTrust" => self.set_trust(request),
            "RemoveTrust" => self.remove_trust(request),
            "GetTrust" => self.get_trust(request),
            "GetTrusts" => self.get_trusts(request),
            "GetScore" => self.get_score(request),
            "GetScores" => self.get_scores(request),
            "GetIdentitiesByScore" => self.get_identities_by_score(request),
            "Subscribe" => self.subscribe(request, sink).await,
            "Unsubscribe" => self.unsubscribe(request),
            "GetIntroductionPuzzles" => self.get_introduction_puzzles(request),
            "GetIntroductionPuzzle" => self.get_introduction_puzzle(request),
            "SolveIntroductionPuzzle" => self.solve_introduction_puzzle(request).await,
            other => Err(WotError::InvalidParameter(format!("unknown command {other:?}"))),
        }
    }

    fn create_identity(&self, request: &Frame) -> WotResult<Frame> {
        let id = parse_id(request, "Identity")?;
        let request_key = required(request, "RequestKey")?;
        let insert_address = required(request, "InsertURI")?;
        let now = self.clock.now();
        let identity = Identity::new_own(id.clone(), request_key, insert_address, now);

        let mut txn = self.store.transaction()?;
        if txn.get_identity(&id)?.is_some() {
            return Err(WotError::Duplicate(format!("identity {id} already exists")));
        }
        txn.put_identity(&identity)?;
        let score = Score::own_identity_self_score(id.clone());
        txn.put_score(&score)?;
        let snapshot = serde_json::to_value(&identity)
            .map_err(|e| WotError::CorruptedData(format!("serializing identity notification: {e}")))?;
        self.subscriptions
            .record_change(&mut *txn, SubscriptionKind::Identities, None, Some(snapshot))?;
        txn.commit()?;
        self.subscriptions.wake(SubscriptionKind::Identities);

        let mut reply = Frame::new("IdentityCreated");
        reply.set("Identity", id.to_string());
        Ok(reply)
    }

    fn add_identity(&self, request: &Frame) -> WotResult<Frame> {
        let id = parse_id(request, "Identity")?;
        let request_key = required(request, "RequestKey")?;
        let now = self.clock.now();

        let mut txn = self.store.transaction()?;
        if txn.get_identity(&id)?.is_some() {
            return Err(WotError::Duplicate(format!("identity {id} already exists")));
        }
        let identity = Identity::new_non_own(id.clone(), request_key, now);
        txn.put_identity(&identity)?;
        let snapshot = serde_json::to_value(&identity)
            .map_err(|e| WotError::CorruptedData(format!("serializing identity notification: {e}")))?;
        self.subscriptions
            .record_change(&mut *txn, SubscriptionKind::Identities, None, Some(snapshot))?;
        txn.commit()?;
        self.subscriptions.wake(SubscriptionKind::Identities);

        let mut reply = Frame::new("IdentityAdded");
        reply.set("Identity", id.to_string());
        Ok(reply)
    }

    /// Unknown identities, and identities a given `Truster` distrusts
    /// (a negative score), come back as a successful `Identity` frame
    /// carrying `Type=Inexistent` rather than an `Error` frame: a client
    /// asking about a stranger's reachability learns the answer, it
    /// doesn't get bounced.
    fn get_identity(&self, request: &Frame) -> WotResult<Frame> {
        let id = parse_id(request, "Identity")?;
        let truster = request
            .get("Truster")
            .map(Id::parse)
            .transpose()
            .map_err(WotError::InvalidParameter)?;
        let txn = self.store.transaction()?;
        let identity = txn.get_identity(&id)?;
        let distrusted = match (&truster, &identity) {
            (Some(truster), Some(_)) => txn
                .get_score(truster, &id)?
                .map(|score| score.value < 0)
                .unwrap_or(false),
            _ => false,
        };

        let mut reply = Frame::new("Identity");
        match identity {
            Some(identity) if !distrusted => write_identity(&mut reply, "", &identity),
            _ => {
                reply.set("Identity", id.to_string());
                reply.set("Type", "Inexistent");
            }
        }
        Ok(reply)
    }

    fn get_identities(&self) -> WotResult<Frame> {
        let txn = self.store.transaction()?;
        let identities = txn.all_identities()?;
        let mut reply = Frame::new("Identities");
        reply.set_amount("Identities", identities.len());
        for (i, identity) in identities.iter().enumerate() {
            write_identity(&mut reply, &format!("Identities.{i}"), identity);
        }
        Ok(reply)
    }

    fn set_trust(&self, request: &Frame) -> WotResult<Frame> {
        let truster = parse_id(request, "Truster")?;
        let trustee = parse_id(request, "Trustee")?;
        let value: i32 = required(request, "Value")?
            .parse()
            .map_err(|_| WotError::InvalidParameter("Value must be an integer".into()))?;
        let comment = request.get("Comment").unwrap_or("");

        let mut txn = self.store.transaction()?;
        self.graph.set_trust(
            &mut *txn,
            &truster,
            &trustee,
            TrustValue::parse(value)?,
            Comment::parse(comment)?,
        )?;
        txn.commit()?;
        self.subscriptions.wake(SubscriptionKind::Trusts);
        self.subscriptions.wake(SubscriptionKind::Scores);
        Ok(Frame::new("TrustSet"))
    }

    fn remove_trust(&self, request: &Frame) -> WotResult<Frame> {
        let truster = parse_id(request, "Truster")?;
        let trustee = parse_id(request, "Trustee")?;
        let mut txn = self.store.transaction()?;
        self.graph.remove_trust(&mut *txn, &truster, &trustee)?;
        txn.commit()?;
        self.subscriptions.wake(SubscriptionKind::Trusts);
        self.subscriptions.wake(SubscriptionKind::Scores);
        Ok(Frame::new("TrustRemoved"))
    }

    fn get_trust(&self, request: &Frame) -> WotResult<Frame> {
        let truster = parse_id(request, "Truster")?;
        let trustee = parse_id(request, "Trustee")?;
        let txn = self.store.transaction()?;
        let trust = txn
            .get_trust(&truster, &trustee)?
            .ok_or_else(|| WotError::NotTrusted {
                truster: truster.to_string(),
                trustee: trustee.to_string(),
            })?;
        let mut reply = Frame::new("Trust");
        write_trust(&mut reply, "", &trust);
        Ok(reply)
    }

    fn get_trusts(&self, request: &Frame) -> WotResult<Frame> {
        let txn = self.store.transaction()?;
        let trusts = if let Some(truster) = request.get("Truster") {
            let truster = Id::parse(truster).map_err(WotError::InvalidParameter)?;
            txn.trusts_by_truster(&truster)?
        } else if let Some(trustee) = request.get("Trustee") {
            let trustee = Id::parse(trustee).map_err(WotError::InvalidParameter)?;
            txn.trusts_by_trustee(&trustee)?
        } else {
            return Err(WotError::InvalidParameter(
                "GetTrusts requires Truster or Trustee".into(),
            ));
        };
        let mut reply = Frame::new("Trusts");
        reply.set_amount("Trusts", trusts.len());
        for (i, trust) in trusts.iter().enumerate() {
            write_trust(&mut reply, &format!("Trusts.{i}"), trust);
        }
        Ok(reply)
    }

    fn get_score(&self, request: &Frame) -> WotResult<Frame> {
        let truster = parse_id(request, "Truster")?;
        let trustee = parse_id(request, "Trustee")?;
        let txn = self.store.transaction()?;
        let score = txn
            .get_score(&truster, &trustee)?
            .ok_or_else(|| WotError::NotInTrustTree(trustee.to_string()))?;
        let mut reply = Frame::new("Score");
        write_score(&mut reply, "", &score);
        Ok(reply)
    }

    fn get_scores(&self, request: &Frame) -> WotResult<Frame> {
        let truster = parse_id(request, "Truster")?;
        let txn = self.store.transaction()?;
        let scores = txn.scores_by_truster(&truster)?;
        let mut reply = Frame::new("Scores");
        reply.set_amount("Scores", scores.len());
        for (i, score) in scores.iter().enumerate() {
            write_score(&mut reply, &format!("Scores.{i}"), score);
        }
        Ok(reply)
    }

    fn get_identities_by_score(&self, request: &Frame) -> WotResult<Frame> {
        let truster = parse_id(request, "Truster")?;
        let selection = required(request, "Selection")?;
        let selector = ScoreSelector::parse(selection).ok_or_else(|| {
            WotError::InvalidParameter(format!("Selection must be one of +, 0, -, got {selection:?}"))
        })?;
        let txn = self.store.transaction()?;
        let scores = txn.identities_by_score_selector(&truster, selector)?;
        let mut reply = Frame::new("Identities");
        reply.set_amount("Identities", scores.len());
        for (i, score) in scores.iter().enumerate() {
            reply.set_indexed("Identities", i, "Identity", score.trustee.to_string());
        }
        Ok(reply)
    }

    async fn subscribe(&self, request: &Frame, sink: Option<Arc<dyn FrameSink>>) -> WotResult<Frame> {
        let client_id = required(request, "ClientID")?;
        let kind = parse_kind(required(request, "To")?)?;
        let sink = sink.ok_or_else(|| {
            WotError::InvalidParameter("Subscribe requires a transport-provided frame sink".into())
        })?;
        let client = Arc::new(FrameSubscriptionClient { sink });
        let subscription_id = self.subscriptions.subscribe(client_id, kind, client).await?;
        let mut reply = Frame::new("Subscribed");
        reply.set("SubscriptionID", subscription_id);
        Ok(reply)
    }

    fn unsubscribe(&self, request: &Frame) -> WotResult<Frame> {
        let subscription_id = required(request, "SubscriptionID")?;
        self.subscriptions.unsubscribe(subscription_id)?;
        Ok(Frame::new("Unsubscribed"))
    }

    fn get_introduction_puzzles(&self, request: &Frame) -> WotResult<Frame> {
        let inserter = request.get("Identity").map(Id::parse).transpose().map_err(WotError::InvalidParameter)?;
        let txn = self.store.transaction()?;
        let puzzles = match inserter {
            Some(id) => txn.puzzles_by_inserter(&id)?,
            None => txn.all_puzzles()?,
        };
        let unsolved: Vec<_> = puzzles.into_iter().filter(|p| !p.was_solved).collect();
        let mut reply = Frame::new("IntroductionPuzzles");
        reply.set_amount("Puzzles", unsolved.len());
        for (i, puzzle) in unsolved.iter().enumerate() {
            reply.set_indexed("Puzzles", i, "ID", puzzle.id.as_str());
            reply.set_indexed("Puzzles", i, "Type", "Captcha");
        }
        Ok(reply)
    }

    fn get_introduction_puzzle(&self, request: &Frame) -> WotResult<Frame> {
        let puzzle_id = required(request, "PuzzleID")?;
        let txn = self.store.transaction()?;
        let puzzle = txn
            .get_puzzle(puzzle_id)?
            .ok_or_else(|| WotError::UnknownPuzzle(puzzle_id.to_string()))?;
        use base64::Engine;
        let mut reply = Frame::new("IntroductionPuzzle");
        reply.set("PuzzleID", puzzle.id.as_str());
        reply.set("MimeType", puzzle.mime_type.as_str());
        reply.set("Data", base64::engine::general_purpose::STANDARD.encode(&puzzle.data));
        Ok(reply)
    }

    async fn solve_introduction_puzzle(&self, request: &Frame) -> WotResult<Frame> {
        let puzzle_id = required(request, "PuzzleID")?;
        let solver_id = parse_id(request, "Identity")?;
        let solution = required(request, "Solution")?.to_string();

        let txn = self.store.transaction()?;
        let solver = txn
            .get_identity(&solver_id)?
            .ok_or_else(|| WotError::UnknownIdentity(solver_id.to_string()))?;
        drop(txn);

        self.puzzle_pool
            .submit_solution(self.solution_insert_client.as_ref(), puzzle_id, solution, &solver)
            .await?;
        Ok(Frame::new("PuzzleSolved"))
    }
}

fn write_identity(frame: &mut Frame, prefix: &str, identity: &Identity) {
    let p = |field: &str| if prefix.is_empty() { field.to_string() } else { format!("{prefix}.{field}") };
    frame.set(p("Identity"), identity.id.to_string());
    frame.set(p("RequestKey"), identity.request_address.key.as_str());
    frame.set(p("Edition"), identity.request_address.edition.to_string());
    frame.set(p("DoesPublishTrustList"), identity.does_publish_trust_list.to_string());
    frame.set(p("IsOwn"), identity.is_own().to_string());
    frame.set(p("Type"), if identity.is_own() { "OwnIdentity" } else { "Identity" });
    if let Some(nickname) = &identity.nickname {
        frame.set(p("Nickname"), nickname.as_str());
    }
}

fn write_trust(frame: &mut Frame, prefix: &str, trust: &Trust) {
    let p = |field: &str| if prefix.is_empty() { field.to_string() } else { format!("{prefix}.{field}") };
    frame.set(p("Truster"), trust.truster.to_string());
    frame.set(p("Trustee"), trust.trustee.to_string());
    frame.set(p("Value"), trust.value.get().to_string());
    frame.set(p("Comment"), trust.comment.as_str());
    frame.set(p("TrusterEdition"), trust.truster_edition.to_string());
    frame.set(p("LastChangeDate"), trust.last_change_date.to_rfc3339());
}

fn write_score(frame: &mut Frame, prefix: &str, score: &Score) {
    let p = |field: &str| if prefix.is_empty() { field.to_string() } else { format!("{prefix}.{field}") };
    frame.set(p("Truster"), score.truster.to_string());
    frame.set(p("Trustee"), score.trustee.to_string());
    frame.set(p("Value"), score.value.to_string());
    frame.set(
        p("Rank"),
        score.rank.map(|r| r.to_string()).unwrap_or_else(|| "None".to_string()),
    );
    frame.set(p("Capacity"), score.capacity.to_string());
}
