//! The rejoin state machine
//!
//! A [`RejoinTransitioner`] decides whether a restarting node may resume
//! cluster membership. It performs no messaging itself: every call returns a
//! [`Transition`] holding an [`Outcome`] and the [`Command`]s the driver must
//! execute, whose results come back later as [`Event`]s. Storage-layer calls
//! are awaited inline.
//!
//! Phases follow each other as
//! `AwaitingStatus -> AwaitingAwaiting -> AwaitingLock -> Confirming -> terminal`,
//! and any phase may fall back to `Delayed`, after which the procedure starts
//! over at the status round.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use proven_topology::{
    ClusterConfig, ConfigComparison, LocalNode, NodeIdentity, NodeName, NodeRole, TopologyError,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::analysis::{
    ConfigVerdict, classify_configs, dependency_set, joining_nodes, rejoining_peers,
};
use crate::comms::Multicall;
use crate::config::RejoinConfig;
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::messages::{AwaitingReply, PeerCast, PeerReply, PeerStatus, StatusReply};
use crate::storage::{StorageLayer, discharge_dependencies};

/// Tag of a scheduled retry. Only the most recent one is honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RetryToken(u64);

/// Tag of an outstanding request round. Replies for any other round are
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Round(u64);

impl fmt::Display for RetryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retry-{}", self.0)
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "round-{}", self.0)
    }
}

/// What the transitioner is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Status replies from every other configured node
    AwaitingStatus,
    /// Awaiting sets from the rejoining nodes we depend on
    AwaitingAwaiting,
    /// The result of taking every node lock
    AwaitingLock,
    /// Status replies gathered while holding every node lock
    Confirming,
    /// The retry timer tagged with this token
    Delayed(RetryToken),
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Keep running
    Continue,
    /// The node may start as a full member under this config
    Success(ClusterConfig),
    /// Abandon this attempt and start over with this config
    ConfigChanged(ClusterConfig),
    /// Peers disagree on the contents of this config
    InvalidConfig(ClusterConfig),
}

/// Work the driver must perform on the transitioner's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Multicall a status request; answer with [`Event::StatusReplies`]
    RequestStatus {
        /// Round to echo back
        round: Round,
        /// Nodes to ask
        nodes: BTreeSet<NodeName>,
    },
    /// Multicall an awaiting request; answer with [`Event::AwaitingReplies`]
    RequestAwaiting {
        /// Round to echo back
        round: Round,
        /// Nodes to ask
        nodes: BTreeSet<NodeName>,
    },
    /// Fire-and-forget `cast` to `nodes`
    Multicast {
        /// Recipients
        nodes: BTreeSet<NodeName>,
        /// Message
        cast: PeerCast,
    },
    /// Take every node lock; answer with [`Event::LockResult`]
    AcquireLocks {
        /// Round to echo back
        round: Round,
        /// Locks to take
        nodes: BTreeSet<NodeName>,
    },
    /// Deliver [`Event::RetryElapsed`] after `after`
    ScheduleRetry {
        /// Token to echo back
        token: RetryToken,
        /// Delay
        after: Duration,
    },
}

/// Whether an [`Command::AcquireLocks`] succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// Every lock is held by the driver
    Acquired,
    /// Another node holds a lock
    Rejected,
}

/// Input to the transitioner.
#[derive(Debug)]
pub enum Event {
    /// Result of [`Command::RequestStatus`]
    StatusReplies {
        /// Round the request was issued in
        round: Round,
        /// Replies and unreachable nodes
        replies: Multicall<PeerReply>,
    },
    /// Result of [`Command::RequestAwaiting`]
    AwaitingReplies {
        /// Round the request was issued in
        round: Round,
        /// Replies and unreachable nodes
        replies: Multicall<PeerReply>,
    },
    /// Result of [`Command::AcquireLocks`]
    LockResult {
        /// Round the request was issued in
        round: Round,
        /// Lock outcome
        outcome: LockOutcome,
    },
    /// A scheduled retry fired
    RetryElapsed(RetryToken),
    /// A peer asks for our status
    StatusRequested {
        /// Requesting node
        from: NodeName,
        /// Requesting node's identity
        identity: NodeIdentity,
        /// Where to send the reply
        respond: oneshot::Sender<StatusReply>,
    },
    /// A peer asks for our awaiting set
    AwaitingRequested {
        /// Where to send the reply
        respond: oneshot::Sender<AwaitingReply>,
    },
    /// A peer pushed its config
    ConfigPushed {
        /// Pushing node
        from: NodeName,
        /// Its config
        config: ClusterConfig,
    },
}

/// Outcome plus the commands to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// What happened
    pub outcome: Outcome,
    /// What the driver must do next
    pub commands: Vec<Command>,
}

impl Transition {
    const fn proceed(commands: Vec<Command>) -> Self {
        Self {
            outcome: Outcome::Continue,
            commands,
        }
    }

    const fn idle() -> Self {
        Self::proceed(Vec::new())
    }

    const fn finish(outcome: Outcome) -> Self {
        Self {
            outcome,
            commands: Vec::new(),
        }
    }

    fn with_command(mut self, command: Command) -> Self {
        self.commands.insert(0, command);
        self
    }
}

/// Snapshot of a rejoin attempt for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejoinProgress {
    /// Current phase, if an attempt is running
    pub phase: Option<Phase>,
    /// Version of the config being rejoined under
    pub config_version: Option<u64>,
    /// Nodes the local node waits on
    pub awaiting: BTreeSet<NodeName>,
    /// Retries since the attempt started
    pub consecutive_retries: u32,
}

/// One rejoin attempt under one config.
pub struct RejoinTransitioner<S> {
    local: LocalNode,
    config: ClusterConfig,
    storage: Arc<S>,
    settings: RejoinConfig,
    phase: Phase,
    round: Round,
    awaiting: BTreeSet<NodeName>,
    joining: BTreeSet<NodeName>,
    next_tag: u64,
    consecutive_retries: u32,
    prior: Option<ClusterConfig>,
}

impl<S> fmt::Debug for RejoinTransitioner<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejoinTransitioner")
            .field("local", &self.local)
            .field("version", &self.config.version())
            .field("phase", &self.phase)
            .field("awaiting", &self.awaiting)
            .field("joining", &self.joining)
            .finish_non_exhaustive()
    }
}

impl<S: StorageLayer> RejoinTransitioner<S> {
    /// Create a transitioner for `local` under `config`.
    ///
    /// Fails if `config` does not name the local node.
    pub fn new(
        local: LocalNode,
        config: ClusterConfig,
        storage: Arc<S>,
        settings: RejoinConfig,
    ) -> Result<Self> {
        if !config.contains_node(&local.name) {
            return Err(TopologyError::NotAMember(local.name.to_string()).into());
        }

        Ok(Self {
            local,
            config,
            storage,
            settings,
            phase: Phase::AwaitingStatus,
            round: Round(0),
            awaiting: BTreeSet::new(),
            joining: BTreeSet::new(),
            next_tag: 0,
            consecutive_retries: 0,
            prior: None,
        })
    }

    /// Current phase
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Round of the outstanding request, if any
    #[must_use]
    pub const fn round(&self) -> Round {
        self.round
    }

    /// Config as updated by the attempt so far
    #[must_use]
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Config as it stood before the change that ended the attempt.
    ///
    /// Identities learned while deciding on a [`Outcome::ConfigChanged`] are
    /// not part of it, so it can be checked for continuity against the new
    /// config. Without such a change this is the current config.
    #[must_use]
    pub fn prior_config(&self) -> &ClusterConfig {
        self.prior.as_ref().unwrap_or(&self.config)
    }

    /// Nodes the local node waits on
    #[must_use]
    pub const fn awaiting(&self) -> &BTreeSet<NodeName> {
        &self.awaiting
    }

    /// Nodes known to be fresh-joining
    #[must_use]
    pub const fn joining(&self) -> &BTreeSet<NodeName> {
        &self.joining
    }

    /// Snapshot for observers
    #[must_use]
    pub fn progress(&self) -> RejoinProgress {
        RejoinProgress {
            phase: Some(self.phase),
            config_version: Some(self.config.version()),
            awaiting: self.awaiting.clone(),
            consecutive_retries: self.consecutive_retries,
        }
    }

    /// What we tell a peer asking for our status
    #[must_use]
    pub fn status_reply(&self) -> StatusReply {
        StatusReply {
            node: self.local.name.clone(),
            identity: self.local.identity,
            config: Some(self.config.clone()),
            status: PeerStatus::Rejoining,
            awaiting: Some(self.awaiting.clone()),
            joining: self.joining.clone(),
        }
    }

    /// Start the attempt.
    pub async fn init(&mut self) -> Result<Transition> {
        if self.config.is_sole_disk_node(&self.local.name) {
            info!(node = %self.local.name, "sole disk node, nothing to wait for");
            return self.succeed(true).await;
        }

        info!(
            node = %self.local.name,
            version = self.config.version(),
            "starting rejoin"
        );
        Ok(self.request_status())
    }

    /// Handle one event.
    pub async fn handle(&mut self, event: Event) -> Result<Transition> {
        match event {
            Event::StatusReplies { round, replies } => {
                if self.is_current(Phase::AwaitingStatus, round) {
                    self.on_status_replies(replies).await
                } else if self.is_current(Phase::Confirming, round) {
                    self.on_confirmation_replies(replies).await
                } else {
                    debug!(%round, phase = ?self.phase, "ignoring stale status replies");
                    Ok(Transition::idle())
                }
            }
            Event::AwaitingReplies { round, replies } => {
                if self.is_current(Phase::AwaitingAwaiting, round) {
                    Ok(self.on_awaiting_replies(replies))
                } else {
                    debug!(%round, phase = ?self.phase, "ignoring stale awaiting replies");
                    Ok(Transition::idle())
                }
            }
            Event::LockResult { round, outcome } => {
                if !self.is_current(Phase::AwaitingLock, round) {
                    debug!(%round, phase = ?self.phase, "ignoring stale lock result");
                    return Ok(Transition::idle());
                }
                match outcome {
                    LockOutcome::Acquired => {
                        info!(node = %self.local.name, joining = ?self.joining, "locks acquired");
                        Ok(self.confirm())
                    }
                    LockOutcome::Rejected => {
                        debug!(node = %self.local.name, "lock rejected");
                        Ok(self.delay())
                    }
                }
            }
            Event::RetryElapsed(token) => {
                if self.phase == Phase::Delayed(token) {
                    Ok(self.request_status())
                } else {
                    debug!(%token, phase = ?self.phase, "ignoring stale retry");
                    Ok(Transition::idle())
                }
            }
            Event::StatusRequested {
                from,
                identity,
                respond,
            } => Ok(self.on_status_requested(&from, identity, respond)),
            Event::AwaitingRequested { respond } => {
                let _ = respond.send(AwaitingReply::Awaiting(self.awaiting.clone()));
                Ok(Transition::idle())
            }
            Event::ConfigPushed { from, config } => Ok(self.on_config_pushed(from, &config)),
        }
    }

    fn is_current(&self, phase: Phase, round: Round) -> bool {
        self.phase == phase && self.round == round
    }

    const fn next_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }

    fn peers(&self) -> BTreeSet<NodeName> {
        let mut nodes = self.config.node_names();
        nodes.remove(&self.local.name);
        nodes
    }

    fn request_status(&mut self) -> Transition {
        self.phase = Phase::AwaitingStatus;
        self.round = Round(self.next_tag());
        Transition::proceed(vec![Command::RequestStatus {
            round: self.round,
            nodes: self.peers(),
        }])
    }

    fn request_awaiting(&mut self, nodes: BTreeSet<NodeName>) -> Transition {
        debug!(?nodes, "collecting awaiting sets");
        self.phase = Phase::AwaitingAwaiting;
        self.round = Round(self.next_tag());
        Transition::proceed(vec![Command::RequestAwaiting {
            round: self.round,
            nodes,
        }])
    }

    fn lock(&mut self) -> Transition {
        self.phase = Phase::AwaitingLock;
        self.round = Round(self.next_tag());
        Transition::proceed(vec![Command::AcquireLocks {
            round: self.round,
            nodes: self.config.node_names(),
        }])
    }

    fn confirm(&mut self) -> Transition {
        self.phase = Phase::Confirming;
        self.round = Round(self.next_tag());
        Transition::proceed(vec![Command::RequestStatus {
            round: self.round,
            nodes: self.peers(),
        }])
    }

    fn change_config(&mut self, before: ClusterConfig, next: ClusterConfig) -> Transition {
        self.prior = Some(before);
        Transition::finish(Outcome::ConfigChanged(next))
    }

    fn delay(&mut self) -> Transition {
        let token = RetryToken(self.next_tag());
        self.phase = Phase::Delayed(token);
        self.consecutive_retries += 1;

        if self.consecutive_retries >= self.settings.stuck_retry_threshold {
            warn!(
                node = %self.local.name,
                retries = self.consecutive_retries,
                awaiting = ?self.awaiting,
                "rejoin still waiting on peers"
            );
        } else {
            debug!(%token, retries = self.consecutive_retries, "retrying after backoff");
        }

        Transition::proceed(vec![Command::ScheduleRetry {
            token,
            after: self.settings.retry_interval,
        }])
    }

    async fn succeed(&mut self, discharge: bool) -> Result<Transition> {
        if discharge {
            discharge_dependencies(self.storage.as_ref(), &self.joining)
                .await
                .map_err(Error::storage)?;
        }
        self.storage
            .configure_cluster_membership(self.config.nodes())
            .await
            .map_err(Error::storage)?;

        Ok(Transition::finish(Outcome::Success(self.config.clone())))
    }

    async fn on_status_replies(&mut self, multicall: Multicall<PeerReply>) -> Result<Transition> {
        let mut unreachable = multicall.unreachable;
        let mut statuses = BTreeMap::new();
        for (node, reply) in multicall.replies {
            match reply {
                PeerReply::Status(status) => {
                    statuses.insert(node, status);
                }
                PeerReply::Awaiting(_) => {
                    unreachable.insert(node);
                }
            }
        }

        let before = self.config.clone();
        let mut reset = BTreeSet::new();
        for (node, status) in &statuses {
            let (changed, config) = self
                .config
                .record_peer_identity(node, status.identity, &self.local);
            if changed {
                reset.insert(node.clone());
            }
            self.config = config;
        }

        match classify_configs(&self.config, &statuses) {
            ConfigVerdict::Invalid => {
                warn!(
                    version = self.config.version(),
                    "peers disagree on cluster config"
                );
                Ok(Transition::finish(Outcome::InvalidConfig(
                    self.config.clone(),
                )))
            }
            ConfigVerdict::Younger(younger) => {
                info!(
                    current = self.config.version(),
                    younger = younger.version(),
                    "found younger cluster config"
                );
                let merged = ClusterConfig::merge_identities(&self.local, &younger, &self.config);
                Ok(self.change_config(before, merged))
            }
            _ if !reset.is_empty() => {
                info!(peers = ?reset, "peers were reset since last seen");
                let next = self.config.clone();
                Ok(self.change_config(before, next))
            }
            ConfigVerdict::Older(nodes) => {
                debug!(?nodes, "pushing our config to peers that are behind");
                let push = Command::Multicast {
                    nodes,
                    cast: PeerCast::NewConfig {
                        from: self.local.name.clone(),
                        config: self.config.clone(),
                    },
                };
                Ok(self.delay().with_command(push))
            }
            ConfigVerdict::Coeval => self.maybe_rejoin(&statuses, &unreachable).await,
        }
    }

    async fn maybe_rejoin(
        &mut self,
        statuses: &BTreeMap<NodeName, StatusReply>,
        unreachable: &BTreeSet<NodeName>,
    ) -> Result<Transition> {
        if let Some(running) = statuses
            .values()
            .find(|status| status.status == PeerStatus::Running)
        {
            info!(peer = %running.node, "peer is running, joining it");
            return self.succeed(false).await;
        }

        if self.config.role_of(&self.local.name) == Some(NodeRole::Ram) {
            debug!("ram node cannot seed the cluster, waiting for a disk node");
            return Ok(self.delay());
        }

        let cluster = self
            .storage
            .read_cluster_status()
            .await
            .map_err(Error::storage)?;
        self.joining = joining_nodes(statuses);
        self.awaiting = dependency_set(&self.local.name, &self.config, &cluster, &self.joining);

        if !self.awaiting.is_disjoint(unreachable) {
            debug!(awaiting = ?self.awaiting, ?unreachable, "waiting on unreachable nodes");
            return Ok(self.delay());
        }

        if self.awaiting.is_empty() {
            debug!(joining = ?self.joining, "nothing to wait for");
            return Ok(self.lock());
        }

        let rejoining = rejoining_peers(&self.awaiting, statuses);
        if rejoining.is_empty() {
            debug!(awaiting = ?self.awaiting, "no awaited node is rejoining yet");
            return Ok(self.delay());
        }

        Ok(self.request_awaiting(rejoining))
    }

    async fn on_confirmation_replies(
        &mut self,
        multicall: Multicall<PeerReply>,
    ) -> Result<Transition> {
        let mut running = None;
        for (node, reply) in multicall.replies {
            if let PeerReply::Status(status) = reply {
                let (_, config) = self
                    .config
                    .record_peer_identity(&node, status.identity, &self.local);
                self.config = config;
                if status.status == PeerStatus::Running {
                    running = Some(node);
                }
            }
        }

        match running {
            Some(peer) => {
                info!(%peer, "peer started while locks were taken, joining it");
                self.succeed(false).await
            }
            None => self.succeed(true).await,
        }
    }

    fn on_awaiting_replies(&mut self, multicall: Multicall<PeerReply>) -> Transition {
        if !multicall.unreachable.is_empty() {
            debug!(unreachable = ?multicall.unreachable, "awaiting round incomplete");
            return self.delay();
        }

        let mut graph = DependencyGraph::new();
        graph.add_waiter(self.local.name.clone(), self.awaiting.iter().cloned());
        for (node, reply) in multicall.replies {
            match reply {
                PeerReply::Awaiting(AwaitingReply::Awaiting(awaiting)) => {
                    graph.add_waiter(node, awaiting);
                }
                PeerReply::Awaiting(AwaitingReply::NotRejoining) | PeerReply::Status(_) => {
                    debug!(%node, "peer no longer rejoining");
                    return self.delay();
                }
            }
        }

        if graph.is_closed_component(&self.local.name) {
            debug!(
                component = ?graph.component_of(&self.local.name),
                "dependency component is closed"
            );
            self.lock()
        } else {
            debug!(
                component = ?graph.component_of(&self.local.name),
                "dependency component waits on outside nodes"
            );
            self.delay()
        }
    }

    fn on_status_requested(
        &mut self,
        from: &NodeName,
        identity: NodeIdentity,
        respond: oneshot::Sender<StatusReply>,
    ) -> Transition {
        let (changed, config) = self
            .config
            .record_peer_identity(from, identity, &self.local);
        let before = std::mem::replace(&mut self.config, config);
        let _ = respond.send(self.status_reply());

        if changed {
            info!(peer = %from, %identity, "peer was reset since last seen");
            let next = self.config.clone();
            self.change_config(before, next)
        } else {
            Transition::idle()
        }
    }

    fn on_config_pushed(&mut self, from: NodeName, config: &ClusterConfig) -> Transition {
        match self.config.compare(config) {
            ConfigComparison::Older => {
                info!(peer = %from, version = config.version(), "peer pushed a younger config");
                let merged = ClusterConfig::merge_identities(&self.local, config, &self.config);
                self.change_config(self.config.clone(), merged)
            }
            ConfigComparison::Younger => {
                debug!(peer = %from, version = config.version(), "peer pushed an older config");
                Transition::proceed(vec![Command::Multicast {
                    nodes: BTreeSet::from([from]),
                    cast: PeerCast::NewConfig {
                        from: self.local.name.clone(),
                        config: self.config.clone(),
                    },
                }])
            }
            ConfigComparison::Coeval => {
                self.config = ClusterConfig::merge_identities(&self.local, &self.config, config);
                Transition::idle()
            }
            ConfigComparison::Invalid => {
                warn!(peer = %from, version = config.version(), "ignoring conflicting config");
                Transition::idle()
            }
        }
    }
}
