//! Leader election handles.
//!
//! [`Leadership`] is returned as soon as the candidacy is registered. A
//! background task then campaigns, publishes the primary record once elected,
//! and holds the position until the handle resigns or its session expires.
//!
//! ```text
//! Campaigning ──elected──> Elected ──resign / session or key lost──> Resigned
//!      └──────────────resign / session or key lost──────────────────────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use conclave_kv::CoordinationStore;
use conclave_kv::KeyValue;
use conclave_kv::LeaseId;
use futures::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::CAMPAIGN_RETRY_INITIAL_BACKOFF_MS;
use crate::constants::CAMPAIGN_RETRY_MAX_BACKOFF_MS;
use crate::constants::OBSERVE_CHANNEL_CAPACITY;
use crate::election::Candidacy;
use crate::election::StoreElection;
use crate::error::CandidateExistsSnafu;
use crate::error::ElectionLostSnafu;
use crate::error::NoLeaderSnafu;
use crate::error::NotLeadingSnafu;
use crate::error::SyncError;
use crate::keys::last_segment;
use crate::keys::member_key;
use crate::keys::members_prefix;
use crate::keys::unescape_segment;
use crate::options::LeaderOptions;
use crate::session::Session;
use crate::types::CandidacyState;
use crate::types::Member;
use crate::types::ObserveResult;
use crate::types::Role;

/// A candidacy in one election namespace.
///
/// Cloning shares the candidacy. Dropping the last clone without calling
/// [`resign`](Self::resign) stops the campaign and revokes the session in the
/// background, so the candidacy disappears from the store shortly after.
#[derive(Clone)]
pub struct Leadership {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    namespace: String,
    candidacy: Candidacy,
    session: Session,
    election: StoreElection,
    state: Arc<watch::Sender<CandidacyState>>,
    cancel: CancellationToken,
    resigned: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Id of the member owning a leader record.
///
/// Falls back to the key when the record does not decode.
fn leader_id(kv: &KeyValue) -> String {
    match Member::decode(&kv.key, &kv.value) {
        Ok(member) => member.id,
        Err(_) => unescape_segment(last_segment(&kv.key)),
    }
}

impl Leadership {
    /// Open a session, register the candidacy and start campaigning.
    pub(crate) async fn start(
        store: Arc<dyn CoordinationStore>,
        prefix: &str,
        options: &LeaderOptions,
    ) -> Result<Self, SyncError> {
        let id = options.resolved_id();
        let namespace = options.resolved_namespace();
        let member = Member::new(namespace.clone(), id.clone());
        let follower_record = member.encode()?;
        let primary_record = member.with_role(Role::Primary).encode()?;

        let key = member_key(prefix, &namespace, &id);
        let election = StoreElection::new(store.clone(), members_prefix(prefix, &namespace));
        let session = Session::open(store, options.resolved_ttl_secs()).await?;

        let candidacy = match election.register(&key, &follower_record, session.lease()).await {
            Ok(Some(candidacy)) => candidacy,
            Ok(None) => {
                if let Err(err) = session.close().await {
                    warn!(namespace = %namespace, id = %id, error = %err, "failed to close unused session");
                }
                return CandidateExistsSnafu { namespace, id }.fail();
            }
            Err(err) => {
                if let Err(close_err) = session.close().await {
                    warn!(namespace = %namespace, id = %id, error = %close_err, "failed to close unused session");
                }
                return Err(err);
            }
        };

        let (state_tx, _) = watch::channel(CandidacyState::Campaigning);
        let state = Arc::new(state_tx);
        let cancel = CancellationToken::new();

        let task = CampaignTask {
            id: id.clone(),
            namespace: namespace.clone(),
            election: election.clone(),
            candidacy: candidacy.clone(),
            lease: session.lease(),
            primary_record,
            state: state.clone(),
            cancel: cancel.clone(),
            session_done: session.done(),
        };
        tokio::spawn(task.run());

        info!(
            namespace = %namespace,
            id = %id,
            lease = %session.lease(),
            ttl_secs = session.ttl_secs(),
            "candidacy registered"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                namespace,
                candidacy,
                session,
                election,
                state,
                cancel,
                resigned: AtomicBool::new(false),
            }),
        })
    }

    /// Candidate id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Election namespace.
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CandidacyState {
        *self.inner.state.borrow()
    }

    /// Whether this candidate currently holds the election.
    pub fn is_leader(&self) -> bool {
        self.state() == CandidacyState::Elected
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<CandidacyState> {
        self.inner.state.subscribe()
    }

    /// Wait until elected.
    ///
    /// Fails with [`SyncError::ElectionLost`] if the candidacy ends first.
    pub async fn wait_elected(&self) -> Result<(), SyncError> {
        let mut states = self.inner.state.subscribe();
        let settled = match states.wait_for(|state| *state != CandidacyState::Campaigning).await {
            Ok(state) => *state,
            Err(_) => CandidacyState::Resigned,
        };
        match settled {
            CandidacyState::Elected => Ok(()),
            _ => ElectionLostSnafu {
                namespace: self.inner.namespace.clone(),
                id: self.inner.id.clone(),
            }
            .fail(),
        }
    }

    /// Fires once, when this candidate is observed as the namespace leader.
    ///
    /// The sender is dropped without firing if the candidacy ends first.
    pub fn status(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let election = self.inner.election.clone();
        let cancel = self.inner.cancel.clone();
        let id = self.inner.id.clone();
        let namespace = self.inner.namespace.clone();

        tokio::spawn(async move {
            if cancel.is_cancelled() {
                return;
            }
            let mut leaders = match election.observe().await {
                Ok(leaders) => leaders,
                Err(err) => {
                    warn!(namespace = %namespace, id = %id, error = %err, "status watch failed to start");
                    return;
                }
            };
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = leaders.next() => next,
                };
                match next {
                    Some(Ok(kv)) => {
                        if leader_id(&kv) == id {
                            let _ = tx.send(());
                            return;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(namespace = %namespace, id = %id, error = %err, "status watch failed");
                        return;
                    }
                    None => return,
                }
            }
        });

        rx
    }

    /// Leadership changes in this namespace, one item per new leader id.
    ///
    /// The channel closes when this candidacy resigns or loses its session.
    pub fn observe(&self) -> mpsc::Receiver<ObserveResult> {
        let (tx, rx) = mpsc::channel(OBSERVE_CHANNEL_CAPACITY);
        let election = self.inner.election.clone();
        let cancel = self.inner.cancel.clone();
        let namespace = self.inner.namespace.clone();

        tokio::spawn(async move {
            if cancel.is_cancelled() {
                return;
            }
            let mut leaders = match election.observe().await {
                Ok(leaders) => leaders,
                Err(err) => {
                    warn!(namespace = %namespace, error = %err, "leader observation failed to start");
                    return;
                }
            };
            let mut last_id: Option<String> = None;
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = leaders.next() => next,
                };
                let kv = match next {
                    Some(Ok(kv)) => kv,
                    Some(Err(err)) => {
                        warn!(namespace = %namespace, error = %err, "leader observation failed");
                        return;
                    }
                    None => return,
                };
                let id = leader_id(&kv);
                if last_id.as_deref() == Some(id.as_str()) {
                    continue;
                }
                last_id = Some(id.clone());
                debug!(namespace = %namespace, leader = %id, "leader changed");
                let result = ObserveResult {
                    namespace: namespace.clone(),
                    id,
                };
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(result) => sent,
                };
                if sent.is_err() {
                    return;
                }
            }
        });

        rx
    }

    /// The current leader of this namespace, read from the store.
    pub async fn primary(&self) -> Result<Member, SyncError> {
        if self.inner.resigned.load(Ordering::SeqCst) || self.state() == CandidacyState::Resigned {
            return NotLeadingSnafu {
                namespace: self.inner.namespace.clone(),
                id: self.inner.id.clone(),
            }
            .fail();
        }
        let Some(kv) = self.inner.election.leader().await? else {
            return NoLeaderSnafu {
                namespace: self.inner.namespace.clone(),
            }
            .fail();
        };
        Ok(Member::decode(&kv.key, &kv.value)?.with_role(Role::Primary))
    }

    /// Withdraw the candidacy and close the session.
    ///
    /// Safe to call before the candidate was elected and more than once.
    pub async fn resign(&self) -> Result<(), SyncError> {
        let inner = &self.inner;
        if inner.resigned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.cancel.cancel();
        let withdrawn = inner.election.resign(&inner.candidacy).await;
        inner.state.send_replace(CandidacyState::Resigned);
        let closed = inner.session.close().await;
        info!(namespace = %inner.namespace, id = %inner.id, "resigned");
        withdrawn?;
        closed
    }
}

struct CampaignTask {
    id: String,
    namespace: String,
    election: StoreElection,
    candidacy: Candidacy,
    lease: LeaseId,
    primary_record: String,
    state: Arc<watch::Sender<CandidacyState>>,
    cancel: CancellationToken,
    session_done: CancellationToken,
}

fn jittered(backoff_ms: u64) -> Duration {
    let jitter_ms = rand::rng().random_range(0..=backoff_ms / 2);
    Duration::from_millis(backoff_ms + jitter_ms)
}

impl CampaignTask {
    async fn run(self) {
        let won = tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = self.session_done.cancelled() => false,
            won = self.campaign() => won,
        };

        if won && self.proclaim().await {
            let promoted = self.state.send_if_modified(|state| {
                if *state == CandidacyState::Campaigning {
                    *state = CandidacyState::Elected;
                    true
                } else {
                    false
                }
            });
            if promoted {
                info!(namespace = %self.namespace, id = %self.id, "elected leader");
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = self.session_done.cancelled() => {}
                _ = self.hold() => {}
            }
        }

        if !self.cancel.is_cancelled() {
            warn!(namespace = %self.namespace, id = %self.id, "candidacy lost");
        }
        self.state.send_replace(CandidacyState::Resigned);
        self.cancel.cancel();
    }

    /// Wait for our turn, retrying store failures. False if the candidacy vanished.
    async fn campaign(&self) -> bool {
        let mut backoff_ms = CAMPAIGN_RETRY_INITIAL_BACKOFF_MS;
        loop {
            match self.election.campaign(&self.candidacy).await {
                Ok(won) => return won,
                Err(err) => {
                    debug!(
                        namespace = %self.namespace,
                        id = %self.id,
                        error = %err,
                        backoff_ms,
                        "campaign interrupted, retrying"
                    );
                    tokio::time::sleep(jittered(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(CAMPAIGN_RETRY_MAX_BACKOFF_MS);
                }
            }
        }
    }

    /// Returns once the candidacy key is deleted or recreated, retrying store failures.
    async fn hold(&self) {
        let mut backoff_ms = CAMPAIGN_RETRY_INITIAL_BACKOFF_MS;
        loop {
            match self.election.wait_withdrawn(&self.candidacy).await {
                Ok(()) => {
                    debug!(namespace = %self.namespace, id = %self.id, key = %self.candidacy.key, "candidacy key removed");
                    return;
                }
                Err(err) => {
                    debug!(
                        namespace = %self.namespace,
                        id = %self.id,
                        error = %err,
                        backoff_ms,
                        "candidacy watch interrupted, retrying"
                    );
                    tokio::time::sleep(jittered(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(CAMPAIGN_RETRY_MAX_BACKOFF_MS);
                }
            }
        }
    }

    /// Mark our record as primary. False if the candidacy vanished first.
    async fn proclaim(&self) -> bool {
        match self.election.proclaim(&self.candidacy, &self.primary_record, self.lease).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(namespace = %self.namespace, id = %self.id, "candidacy vanished before proclaim");
                false
            }
            Err(err) => {
                // Still first in line; only the stored role is stale.
                warn!(namespace = %self.namespace, id = %self.id, error = %err, "failed to publish primary record");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use conclave_kv::InMemoryStore;

    use super::*;

    async fn candidate(store: &Arc<InMemoryStore>, id: &str) -> Leadership {
        let options = LeaderOptions::default().namespace("svc").id(id).ttl_secs(30);
        Leadership::start(store.clone(), "/t", &options).await.unwrap()
    }

    #[tokio::test]
    async fn sole_candidate_is_elected() {
        let store = InMemoryStore::new();
        let leader = candidate(&store, "a").await;
        tokio::time::timeout(Duration::from_secs(1), leader.wait_elected()).await.unwrap().unwrap();
        assert!(leader.is_leader());

        let primary = leader.primary().await.unwrap();
        assert_eq!(primary.id, "a");
        assert!(primary.is_primary());

        let stored = store.get("/t/leaders/svc/a").await.unwrap().unwrap();
        assert!(Member::decode(&stored.key, &stored.value).unwrap().is_primary());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let store = InMemoryStore::new();
        let _first = candidate(&store, "a").await;
        let options = LeaderOptions::default().namespace("svc").id("a");
        let err = Leadership::start(store.clone(), "/t", &options).await.err().unwrap();
        assert!(matches!(err, SyncError::CandidateExists { .. }));
        // The rejected attempt's session was revoked.
        assert_eq!(store.lease_count(), 1);
    }

    #[tokio::test]
    async fn resign_is_idempotent_and_ends_primary() {
        let store = InMemoryStore::new();
        let leader = candidate(&store, "a").await;
        leader.wait_elected().await.unwrap();

        leader.resign().await.unwrap();
        leader.resign().await.unwrap();

        assert_eq!(leader.state(), CandidacyState::Resigned);
        assert!(matches!(leader.primary().await, Err(SyncError::NotLeading { .. })));
        assert!(store.get("/t/leaders/svc/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resign_before_election_fails_wait() {
        let store = InMemoryStore::new();
        let first = candidate(&store, "a").await;
        let second = candidate(&store, "b").await;
        first.wait_elected().await.unwrap();
        assert_eq!(second.state(), CandidacyState::Campaigning);

        second.resign().await.unwrap();
        let err = second.wait_elected().await.unwrap_err();
        assert!(matches!(err, SyncError::ElectionLost { .. }));
        assert!(first.is_leader());
    }

    #[tokio::test]
    async fn empty_options_use_defaults() {
        let store = InMemoryStore::new();
        let options = LeaderOptions::default().id("").namespace("").ttl_secs(0);
        let leader = Leadership::start(store.clone(), "/t", &options).await.unwrap();

        assert_eq!(leader.namespace(), "default");
        assert!(uuid::Uuid::parse_str(leader.id()).is_ok());
        let key = format!("/t/leaders/default/{}", leader.id());
        assert!(store.get(&key).await.unwrap().is_some());
        assert_eq!(leader.inner.session.ttl_secs(), crate::constants::DEFAULT_TTL_SECS);
    }

    #[tokio::test]
    async fn session_loss_resigns() {
        let store = InMemoryStore::new();
        let options = LeaderOptions::default().namespace("svc").id("a").ttl_secs(1);
        let leader = Leadership::start(store.clone(), "/t", &options).await.unwrap();
        leader.wait_elected().await.unwrap();

        let mut states = leader.subscribe();
        store.expire_lease(leader.inner.session.lease());

        tokio::time::timeout(
            Duration::from_secs(3),
            states.wait_for(|state| *state == CandidacyState::Resigned),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn observe_reports_handover() {
        let store = InMemoryStore::new();
        let first = candidate(&store, "a").await;
        let second = candidate(&store, "b").await;
        first.wait_elected().await.unwrap();

        let mut changes = second.observe();
        let seen = tokio::time::timeout(Duration::from_secs(1), changes.recv()).await.unwrap().unwrap();
        assert_eq!(seen.id, "a");

        first.resign().await.unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(1), changes.recv()).await.unwrap().unwrap();
        assert_eq!(seen, ObserveResult {
            namespace: "svc".to_string(),
            id: "b".to_string(),
        });

        second.resign().await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(1), changes.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn no_leader_after_everyone_left() {
        let store = InMemoryStore::new();
        let first = candidate(&store, "a").await;
        let second = candidate(&store, "b").await;
        second.resign().await.unwrap();
        assert_eq!(first.primary().await.unwrap().id, "a");

        store.delete("/t/leaders/svc/a").await.unwrap();
        // The handle is still live locally until the campaign task notices.
        match first.primary().await {
            Err(SyncError::NoLeader { .. }) | Err(SyncError::NotLeading { .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn deleted_key_ends_leadership() {
        let store = InMemoryStore::new();
        let first = candidate(&store, "a").await;
        let second = candidate(&store, "b").await;
        first.wait_elected().await.unwrap();

        let mut states = first.subscribe();
        store.delete("/t/leaders/svc/a").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), second.wait_elected()).await.unwrap().unwrap();
        tokio::time::timeout(
            Duration::from_secs(1),
            states.wait_for(|state| *state == CandidacyState::Resigned),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!first.is_leader());
        assert!(second.is_leader());
    }

    #[test]
    fn leader_id_falls_back_to_key() {
        let kv = KeyValue {
            key: "/t/leaders/svc/a%2Fb".to_string(),
            value: "garbage".to_string(),
            create_revision: 1,
            mod_revision: 1,
            version: 1,
            lease: None,
        };
        assert_eq!(leader_id(&kv), "a/b");
    }
}
