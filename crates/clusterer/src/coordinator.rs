//! Drives rejoin attempts and answers peers on the node's behalf
//!
//! The coordinator runs at most one [`RejoinTransitioner`] at a time. Each
//! attempt is a session: a single loop that feeds the transitioner one
//! event at a time, while the commands it emits run on spawned tasks whose
//! results come back through the session channel. Node locks taken during
//! a session are owned by it, so ending the session for any reason (success,
//! restart, error or cancellation) releases them.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use proven_topology::{ClusterConfig, ConfigComparison, LocalNode, NodeIdentity, NodeName};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::comms::{LockAcquisition, Messaging, Multicall, PeerHandler};
use crate::config::RejoinConfig;
use crate::error::{Error, Result};
use crate::messages::{AwaitingReply, PeerCast, PeerReply, PeerRequest, PeerStatus, StatusReply};
use crate::rejoin::{
    Command, Event, LockOutcome, Outcome, Phase, RejoinProgress, RejoinTransitioner, Round,
};
use crate::storage::StorageLayer;

/// How a completed rejoin ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejoinResult {
    /// The node is a full member under this config
    Joined(ClusterConfig),
    /// The config lineage broke; the node must fresh-join under this config
    RequiresJoin(ClusterConfig),
}

enum SessionEvent<G> {
    Transitioner(Event),
    Locks {
        round: Round,
        acquisition: LockAcquisition<G>,
    },
}

struct Session<G> {
    events: flume::Sender<SessionEvent<G>>,
    casts: flume::Sender<(BTreeSet<NodeName>, PeerCast)>,
    tasks: JoinSet<()>,
    guards: Vec<G>,
}

/// Marks the node as rejoining for as long as a session runs, including
/// sessions whose future is dropped mid-attempt.
struct Registration<'a, M: Messaging, S> {
    inner: &'a Inner<M, S>,
}

impl<'a, M: Messaging, S> Registration<'a, M, S> {
    fn new(inner: &'a Inner<M, S>, events: flume::Sender<SessionEvent<M::Guard>>) -> Self {
        let mut state = inner.state.lock();
        state.status = PeerStatus::Rejoining;
        state.session = Some(events);
        drop(state);

        Self { inner }
    }
}

impl<M: Messaging, S> Drop for Registration<'_, M, S> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.session = None;
        state.progress = None;
        if state.status == PeerStatus::Rejoining {
            state.status = PeerStatus::Preboot;
        }
    }
}

struct NodeState<G> {
    local: LocalNode,
    status: PeerStatus,
    config: Option<ClusterConfig>,
    session: Option<flume::Sender<SessionEvent<G>>>,
    progress: Option<RejoinProgress>,
}

struct Inner<M: Messaging, S> {
    messaging: M,
    storage: Arc<S>,
    settings: RejoinConfig,
    state: Mutex<NodeState<M::Guard>>,
    running: tokio::sync::Mutex<()>,
}

/// Rejoin driver for one node.
pub struct RejoinCoordinator<M: Messaging, S> {
    inner: Arc<Inner<M, S>>,
}

impl<M: Messaging, S> Clone for RejoinCoordinator<M, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Messaging, S> fmt::Debug for RejoinCoordinator<M, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RejoinCoordinator")
            .field("local", &state.local)
            .field("status", &state.status)
            .field("version", &state.config.as_ref().map(ClusterConfig::version))
            .finish_non_exhaustive()
    }
}

impl<M: Messaging, S: StorageLayer> RejoinCoordinator<M, S> {
    /// Create a coordinator for the node `messaging` sends from, whose
    /// persistent state currently carries `identity`.
    pub fn new(
        messaging: M,
        storage: Arc<S>,
        identity: NodeIdentity,
        settings: RejoinConfig,
    ) -> Self {
        let local = LocalNode::new(messaging.local_node().clone(), identity);

        Self {
            inner: Arc::new(Inner {
                messaging,
                storage,
                settings,
                state: Mutex::new(NodeState {
                    local,
                    status: PeerStatus::Preboot,
                    config: None,
                    session: None,
                    progress: None,
                }),
                running: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// The local node and its current identity
    #[must_use]
    pub fn local_node(&self) -> LocalNode {
        self.inner.state.lock().local.clone()
    }

    /// What the node reports to peers
    #[must_use]
    pub fn status(&self) -> PeerStatus {
        self.inner.state.lock().status
    }

    /// Config currently in use
    #[must_use]
    pub fn config(&self) -> Option<ClusterConfig> {
        self.inner.state.lock().config.clone()
    }

    /// Snapshot of the running attempt, or of the idle node
    #[must_use]
    pub fn progress(&self) -> RejoinProgress {
        let state = self.inner.state.lock();
        state.progress.clone().unwrap_or_else(|| RejoinProgress {
            phase: None,
            config_version: state.config.as_ref().map(ClusterConfig::version),
            awaiting: BTreeSet::new(),
            consecutive_retries: 0,
        })
    }

    /// Rejoin the cluster described by `config`.
    ///
    /// Restarts on younger configs as long as they continue the same
    /// lineage. Only one call may run at a time.
    pub async fn run(&self, config: ClusterConfig) -> Result<RejoinResult> {
        let _running = self
            .inner
            .running
            .try_lock()
            .map_err(|_| Error::AlreadyRunning)?;

        let mut config = config;
        loop {
            let (outcome, last) = self.run_session(config).await?;
            match outcome {
                Outcome::Success(joined) => return Ok(RejoinResult::Joined(joined)),
                Outcome::InvalidConfig(invalid) => {
                    error!(version = invalid.version(), "peers disagree on cluster config");
                    self.inner.state.lock().status = PeerStatus::Preboot;
                    return Err(Error::InvalidConfig(Box::new(invalid)));
                }
                Outcome::ConfigChanged(next) => {
                    if next.version() < last.version() {
                        return Err(Error::ConfigRegression {
                            current: last.version(),
                            offered: next.version(),
                        });
                    }
                    if ClusterConfig::detect_continuity(&next, Some(&last)) {
                        info!(
                            from = last.version(),
                            to = next.version(),
                            "restarting rejoin under new config"
                        );
                        config = next;
                    } else {
                        info!(
                            version = next.version(),
                            "config lineage broken, fresh join required"
                        );
                        let mut state = self.inner.state.lock();
                        state.status = PeerStatus::Preboot;
                        state.config = Some(next.clone());
                        return Ok(RejoinResult::RequiresJoin(next));
                    }
                }
                Outcome::Continue => config = last,
            }
        }
    }

    /// Wipe local storage ahead of a fresh join under `config`.
    ///
    /// The node gets a new identity and reports itself as joining until
    /// [`complete_fresh_join`](Self::complete_fresh_join) is called.
    pub async fn begin_fresh_join(&self, config: ClusterConfig) -> Result<NodeIdentity> {
        self.inner
            .storage
            .wipe_and_reinitialize()
            .await
            .map_err(Error::storage)?;

        let identity = NodeIdentity::generate();
        let mut state = self.inner.state.lock();
        state.local.identity = identity;
        state.status = PeerStatus::Joining;
        state.config = Some(ClusterConfig::merge_identities(&state.local, &config, &config));
        info!(node = %state.local.name, %identity, "storage wiped for fresh join");

        Ok(identity)
    }

    /// Record the end of a fresh join: the node is a full member under
    /// `config`.
    pub async fn complete_fresh_join(&self, config: ClusterConfig) -> Result<()> {
        let local = self.local_node();
        if !config.contains_node(&local.name) {
            return Err(proven_topology::TopologyError::NotAMember(local.name.to_string()).into());
        }

        self.inner
            .storage
            .configure_cluster_membership(config.nodes())
            .await
            .map_err(Error::storage)?;

        let mut state = self.inner.state.lock();
        state.status = PeerStatus::Running;
        state.config = Some(ClusterConfig::merge_identities(&local, &config, &config));
        info!(node = %local.name, version = config.version(), "fresh join complete");

        Ok(())
    }

    async fn run_session(&self, config: ClusterConfig) -> Result<(Outcome, ClusterConfig)> {
        let local = self.local_node();
        let mut transitioner = RejoinTransitioner::new(
            local,
            config,
            self.inner.storage.clone(),
            self.inner.settings.clone(),
        )?;

        let (events, inbox) = flume::unbounded();
        let (casts, outbox) = flume::unbounded::<(BTreeSet<NodeName>, PeerCast)>();
        let mut tasks = JoinSet::new();

        // One sender for the whole session keeps casts to a peer in order.
        let messaging = self.inner.messaging.clone();
        tasks.spawn(async move {
            while let Ok((nodes, cast)) = outbox.recv_async().await {
                if let Err(error) = messaging.multicast(nodes, cast).await {
                    warn!(%error, "multicast failed");
                }
            }
        });

        let mut session = Session {
            events,
            casts,
            tasks,
            guards: Vec::new(),
        };
        let registration = Registration::new(&self.inner, session.events.clone());

        let result = self.drive(&mut transitioner, &mut session, &inbox).await;

        if let Ok(Outcome::Success(joined)) = &result {
            let mut state = self.inner.state.lock();
            info!(node = %state.local.name, version = joined.version(), "rejoined cluster");
            state.status = PeerStatus::Running;
            state.config = Some(joined.clone());
        }
        drop(registration);
        if !session.guards.is_empty() {
            debug!(locks = session.guards.len(), "releasing node locks");
        }
        drop(session);

        result.map(|outcome| (outcome, transitioner.prior_config().clone()))
    }

    async fn drive(
        &self,
        transitioner: &mut RejoinTransitioner<S>,
        session: &mut Session<M::Guard>,
        inbox: &flume::Receiver<SessionEvent<M::Guard>>,
    ) -> Result<Outcome> {
        let mut transition = transitioner.init().await?;

        loop {
            self.publish(transitioner);
            if transition.outcome != Outcome::Continue {
                return Ok(transition.outcome);
            }
            for command in transition.commands {
                self.dispatch(command, session);
            }

            let event = match inbox.recv_async().await.map_err(|_| Error::SessionClosed)? {
                SessionEvent::Transitioner(event) => event,
                SessionEvent::Locks { round, acquisition } => {
                    let outcome = match acquisition {
                        LockAcquisition::Acquired(guards) => {
                            if transitioner.phase() == Phase::AwaitingLock
                                && transitioner.round() == round
                            {
                                session.guards.extend(guards);
                            }
                            LockOutcome::Acquired
                        }
                        LockAcquisition::Rejected => LockOutcome::Rejected,
                    };
                    Event::LockResult { round, outcome }
                }
            };

            transition = transitioner.handle(event).await?;
        }
    }

    fn publish(&self, transitioner: &RejoinTransitioner<S>) {
        let mut state = self.inner.state.lock();
        state.config = Some(transitioner.config().clone());
        state.progress = Some(transitioner.progress());
    }

    fn dispatch(&self, command: Command, session: &mut Session<M::Guard>) {
        while session.tasks.try_join_next().is_some() {}

        let messaging = self.inner.messaging.clone();
        let events = session.events.clone();
        let timeout = self.inner.settings.request_timeout;

        match command {
            Command::RequestStatus { round, nodes } => {
                let request = {
                    let state = self.inner.state.lock();
                    PeerRequest::Status {
                        from: state.local.name.clone(),
                        identity: state.local.identity,
                    }
                };
                session.tasks.spawn(async move {
                    let replies = multicall(&messaging, nodes, request, timeout).await;
                    let _ = events.send(SessionEvent::Transitioner(Event::StatusReplies {
                        round,
                        replies,
                    }));
                });
            }
            Command::RequestAwaiting { round, nodes } => {
                session.tasks.spawn(async move {
                    let replies =
                        multicall(&messaging, nodes, PeerRequest::Awaiting, timeout).await;
                    let _ = events.send(SessionEvent::Transitioner(Event::AwaitingReplies {
                        round,
                        replies,
                    }));
                });
            }
            Command::Multicast { nodes, cast } => {
                if session.casts.send((nodes, cast)).is_err() {
                    warn!("cast queue closed, dropping cast");
                }
            }
            Command::AcquireLocks { round, nodes } => {
                session.tasks.spawn(async move {
                    let acquisition = messaging.acquire_locks(nodes).await.unwrap_or_else(|error| {
                        warn!(%error, "lock acquisition failed");
                        LockAcquisition::Rejected
                    });
                    let _ = events.send(SessionEvent::Locks { round, acquisition });
                });
            }
            Command::ScheduleRetry { token, after } => {
                session.tasks.spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = events.send(SessionEvent::Transitioner(Event::RetryElapsed(token)));
                });
            }
        }
    }

    /// Hand `event` to the running session, if there is one.
    fn forward(&self, event: Event) -> bool {
        let Some(session) = self.inner.state.lock().session.clone() else {
            return false;
        };
        session.send(SessionEvent::Transitioner(event)).is_ok()
    }

    fn idle_status_reply(&self) -> StatusReply {
        let state = self.inner.state.lock();
        StatusReply {
            node: state.local.name.clone(),
            identity: state.local.identity,
            config: state.config.clone(),
            status: state.status,
            awaiting: None,
            joining: BTreeSet::new(),
        }
    }

    fn adopt_if_younger(&self, from: &NodeName, config: &ClusterConfig) {
        let mut state = self.inner.state.lock();
        let merged = match state.config.as_ref() {
            Some(current) if current.compare(config) == ConfigComparison::Older => Some(
                ClusterConfig::merge_identities(&state.local, config, current),
            ),
            _ => None,
        };

        match merged {
            Some(merged) => {
                info!(peer = %from, version = merged.version(), "adopting pushed config");
                state.config = Some(merged);
            }
            None => debug!(peer = %from, version = config.version(), "ignoring pushed config"),
        }
    }
}

async fn multicall<M: Messaging>(
    messaging: &M,
    nodes: BTreeSet<NodeName>,
    request: PeerRequest,
    timeout: Duration,
) -> Multicall<PeerReply> {
    match messaging.multicall(nodes.clone(), request, timeout).await {
        Ok(replies) => replies,
        Err(error) => {
            warn!(%error, "multicall failed, treating peers as unreachable");
            Multicall::all_unreachable(nodes)
        }
    }
}

#[async_trait]
impl<M: Messaging, S: StorageLayer> PeerHandler for RejoinCoordinator<M, S> {
    async fn handle_request(&self, request: PeerRequest) -> PeerReply {
        match request {
            PeerRequest::Status { from, identity } => {
                let (respond, reply) = oneshot::channel();
                if self.forward(Event::StatusRequested {
                    from,
                    identity,
                    respond,
                }) {
                    if let Ok(reply) = reply.await {
                        return PeerReply::Status(reply);
                    }
                }
                PeerReply::Status(self.idle_status_reply())
            }
            PeerRequest::Awaiting => {
                let (respond, reply) = oneshot::channel();
                if self.forward(Event::AwaitingRequested { respond }) {
                    if let Ok(reply) = reply.await {
                        return PeerReply::Awaiting(reply);
                    }
                }
                PeerReply::Awaiting(AwaitingReply::NotRejoining)
            }
        }
    }

    async fn handle_cast(&self, cast: PeerCast) {
        match cast {
            PeerCast::NewConfig { from, config } => {
                let pushed = Event::ConfigPushed {
                    from: from.clone(),
                    config: config.clone(),
                };
                if !self.forward(pushed) {
                    self.adopt_if_younger(&from, &config);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::MessagingError;
    use crate::storage::{ClusterStatus, StorageError};

    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use proven_topology::{ClusterNode, Gospel, ShutdownTimeout};
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("stub failure")]
    struct StubError;

    impl MessagingError for StubError {}
    impl StorageError for StubError {}

    /// Answers every status request from a fixed table and records the
    /// recipients of every cast. The first cast is held back by
    /// `first_cast_delay`.
    #[derive(Clone)]
    struct StubMessaging {
        local: NodeName,
        replies: Arc<BTreeMap<NodeName, StatusReply>>,
        calls: Arc<AtomicUsize>,
        casts: Arc<Mutex<Vec<BTreeSet<NodeName>>>>,
        first_cast_delay: Duration,
    }

    impl StubMessaging {
        fn new(replies: Vec<StatusReply>) -> Self {
            Self {
                local: n("a"),
                replies: Arc::new(replies.into_iter().map(|r| (r.node.clone(), r)).collect()),
                calls: Arc::new(AtomicUsize::new(0)),
                casts: Arc::default(),
                first_cast_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Messaging for StubMessaging {
        type Error = StubError;
        type Guard = ();

        fn local_node(&self) -> &NodeName {
            &self.local
        }

        async fn multicall(
            &self,
            nodes: BTreeSet<NodeName>,
            _request: PeerRequest,
            _timeout: Duration,
        ) -> std::result::Result<Multicall<PeerReply>, StubError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut result = Multicall::default();
            for node in nodes {
                match self.replies.get(&node) {
                    Some(reply) => {
                        result.replies.insert(node, PeerReply::Status(reply.clone()));
                    }
                    None => {
                        result.unreachable.insert(node);
                    }
                }
            }
            Ok(result)
        }

        async fn multicast(
            &self,
            nodes: BTreeSet<NodeName>,
            _cast: PeerCast,
        ) -> std::result::Result<(), StubError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.casts.lock().is_empty() {
                tokio::time::sleep(self.first_cast_delay).await;
            }
            self.casts.lock().push(nodes);
            Ok(())
        }

        async fn acquire_locks(
            &self,
            _nodes: BTreeSet<NodeName>,
        ) -> std::result::Result<LockAcquisition<()>, StubError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LockAcquisition::Acquired(Vec::new()))
        }
    }

    #[derive(Debug, Default)]
    struct StubStorage;

    #[async_trait]
    impl StorageLayer for StubStorage {
        type Error = StubError;

        async fn force_load_tables(&self) -> std::result::Result<(), StubError> {
            Ok(())
        }
        async fn reset_cluster_status(&self) -> std::result::Result<(), StubError> {
            Ok(())
        }
        async fn read_cluster_status(&self) -> std::result::Result<ClusterStatus, StubError> {
            Ok(ClusterStatus::default())
        }
        async fn wipe_and_reinitialize(&self) -> std::result::Result<(), StubError> {
            Ok(())
        }
        async fn configure_cluster_membership(
            &self,
            _nodes: &[ClusterNode],
        ) -> std::result::Result<(), StubError> {
            Ok(())
        }
        async fn forget_nodes(
            &self,
            _nodes: &BTreeSet<NodeName>,
        ) -> std::result::Result<(), StubError> {
            Ok(())
        }
    }

    fn n(name: &str) -> NodeName {
        NodeName::new(name)
    }

    fn config(version: u64, nodes: &[&str], gospel: Gospel) -> ClusterConfig {
        ClusterConfig::new(
            version,
            nodes.iter().map(|name| ClusterNode::disk(*name)).collect(),
            gospel,
            ShutdownTimeout::Infinite,
        )
        .unwrap()
    }

    fn peer(node: &str, config: ClusterConfig, status: PeerStatus) -> StatusReply {
        StatusReply {
            node: n(node),
            identity: NodeIdentity::generate(),
            config: Some(config),
            status,
            awaiting: None,
            joining: BTreeSet::new(),
        }
    }

    fn coordinator(
        replies: Vec<StatusReply>,
    ) -> (RejoinCoordinator<StubMessaging, StubStorage>, Arc<AtomicUsize>) {
        let messaging = StubMessaging::new(replies);
        let calls = messaging.calls.clone();
        let settings = RejoinConfig::default().with_retry_interval(Duration::from_millis(10));
        let coordinator = RejoinCoordinator::new(
            messaging,
            Arc::new(StubStorage),
            NodeIdentity::generate(),
            settings,
        );
        (coordinator, calls)
    }

    #[tokio::test]
    async fn test_single_node_joins_without_messages() {
        let (coordinator, calls) = coordinator(vec![]);
        let config = config(1, &["a"], Gospel::Node(n("a")));

        let result = coordinator.run(config).await.unwrap();
        assert_matches!(result, RejoinResult::Joined(config) if config.version() == 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.status(), PeerStatus::Running);
    }

    #[tokio::test]
    async fn test_restarts_under_younger_config() {
        let gospel = Gospel::Node(n("a"));
        let younger = config(2, &["a", "b"], gospel.clone());
        let (coordinator, _) = coordinator(vec![peer("b", younger, PeerStatus::Running)]);

        let result = coordinator
            .run(config(1, &["a", "b"], gospel))
            .await
            .unwrap();
        assert_matches!(result, RejoinResult::Joined(config) if config.version() == 2);
    }

    #[tokio::test]
    async fn test_reset_gospel_requires_fresh_join() {
        let younger = config(2, &["a", "b"], Gospel::Reset);
        let (coordinator, _) = coordinator(vec![peer("b", younger, PeerStatus::Running)]);

        let result = coordinator
            .run(config(1, &["a", "b"], Gospel::Node(n("a"))))
            .await
            .unwrap();
        assert_matches!(result, RejoinResult::RequiresJoin(config) if config.version() == 2);
        assert_eq!(coordinator.status(), PeerStatus::Preboot);
    }

    #[tokio::test]
    async fn test_invalid_config_is_surfaced() {
        let conflicting = config(1, &["a", "b", "c"], Gospel::Reset);
        let (coordinator, _) = coordinator(vec![peer("b", conflicting, PeerStatus::Rejoining)]);

        let result = coordinator.run(config(1, &["a", "b"], Gospel::Reset)).await;
        assert_matches!(result, Err(Error::InvalidConfig(config)) if config.version() == 1);
    }

    #[tokio::test]
    async fn test_idle_node_answers_directly() {
        let (coordinator, _) = coordinator(vec![]);

        let reply = coordinator
            .handle_request(PeerRequest::Status {
                from: n("b"),
                identity: NodeIdentity::generate(),
            })
            .await;
        assert_matches!(
            reply,
            PeerReply::Status(StatusReply { status: PeerStatus::Preboot, config: None, .. })
        );
        assert_eq!(
            coordinator.handle_request(PeerRequest::Awaiting).await,
            PeerReply::Awaiting(AwaitingReply::NotRejoining)
        );
        assert_eq!(coordinator.progress().phase, None);
    }

    #[tokio::test]
    async fn test_running_node_adopts_pushed_younger_config() {
        let (coordinator, _) = coordinator(vec![]);
        coordinator
            .run(config(1, &["a"], Gospel::Node(n("a"))))
            .await
            .unwrap();

        coordinator
            .handle_cast(PeerCast::NewConfig {
                from: n("b"),
                config: config(2, &["a", "b"], Gospel::Node(n("a"))),
            })
            .await;
        assert_eq!(coordinator.config().map(|c| c.version()), Some(2));

        coordinator
            .handle_cast(PeerCast::NewConfig {
                from: n("b"),
                config: config(1, &["a"], Gospel::Node(n("a"))),
            })
            .await;
        assert_eq!(coordinator.config().map(|c| c.version()), Some(2));
    }

    #[tokio::test]
    async fn test_fresh_join_changes_identity() {
        let (coordinator, _) = coordinator(vec![]);
        let before = coordinator.local_node().identity;
        let config = config(3, &["a", "b"], Gospel::Node(n("b")));

        let identity = coordinator.begin_fresh_join(config.clone()).await.unwrap();
        assert_ne!(identity, before);
        assert_eq!(coordinator.status(), PeerStatus::Joining);

        coordinator.complete_fresh_join(config).await.unwrap();
        assert_eq!(coordinator.status(), PeerStatus::Running);
        assert_eq!(
            coordinator.config().unwrap().identity_of(&n("a")),
            Some(identity)
        );
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_gospel_reset_mid_rejoin_requires_fresh_join() {
        let gospel = Gospel::Node(n("b"));
        let older = config(1, &["a", "b"], gospel.clone());
        let (coordinator, _) = coordinator(vec![peer("b", older, PeerStatus::Rejoining)]);

        let run = tokio::spawn({
            let coordinator = coordinator.clone();
            let ours = config(2, &["a", "b"], gospel);
            async move { coordinator.run(ours).await }
        });
        wait_until(|| {
            coordinator
                .config()
                .and_then(|config| config.identity_of(&n("b")))
                .is_some()
        })
        .await;

        // b comes back with wiped storage
        let reset = NodeIdentity::generate();
        coordinator
            .handle_request(PeerRequest::Status {
                from: n("b"),
                identity: reset,
            })
            .await;

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_matches!(
            result,
            RejoinResult::RequiresJoin(config) if config.identity_of(&n("b")) == Some(reset)
        );
        assert_eq!(coordinator.status(), PeerStatus::Preboot);
    }

    #[tokio::test]
    async fn test_casts_are_sent_in_dispatch_order() {
        let older = config(1, &["a", "b", "c"], Gospel::Reset);
        let mut messaging =
            StubMessaging::new(vec![peer("b", older.clone(), PeerStatus::Rejoining)]);
        messaging.first_cast_delay = Duration::from_millis(50);
        let casts = messaging.casts.clone();
        let coordinator = RejoinCoordinator::new(
            messaging,
            Arc::new(StubStorage),
            NodeIdentity::generate(),
            RejoinConfig::default().with_retry_interval(Duration::from_secs(10)),
        );

        let run = tokio::spawn({
            let coordinator = coordinator.clone();
            let ours = config(2, &["a", "b", "c"], Gospel::Reset);
            async move { coordinator.run(ours).await }
        });
        wait_until(|| matches!(coordinator.progress().phase, Some(Phase::Delayed(_)))).await;

        // b's push is still in flight when c needs one too
        coordinator
            .handle_cast(PeerCast::NewConfig {
                from: n("c"),
                config: older,
            })
            .await;
        wait_until(|| casts.lock().len() == 2).await;

        assert_eq!(
            *casts.lock(),
            vec![BTreeSet::from([n("b")]), BTreeSet::from([n("c")])]
        );
        run.abort();
    }
}
