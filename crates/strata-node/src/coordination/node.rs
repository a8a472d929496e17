//! Coordination node: the membership state machine.
//!
//! `CoordinationNode` is a cheap handle. `join()` opens the coordination
//! transport and spawns one actor task that owns the role, the peer table and
//! every timer (discovery, heartbeat, cleanup, promotion). Timers and inbound
//! messages are multiplexed with `select!`, so all state changes happen in a
//! single ordering domain. Observers read state through a `watch` snapshot and
//! an event broadcast channel.
//!
//! ```text
//! disconnected ──join──▶ discovering ──accepted join──▶ participant
//!                            │  ▲                           │
//!                  promotion │  └──── coordinator lost ─────┘
//!                            ▼        (election lost)
//!                       coordinator
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_common::constants::CLEANUP_INTERVAL;
use strata_common::{
    CoordinationConfig, CoordinationEvent, CoordinationMessage, HeartbeatStatus, MessageBody,
    Metadata, NetworkNode, NodeRole, NodeSnapshot, Result, StrataError, StreamProvider,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use super::election::{ElectionContext, LeaderElectionStrategy, LowestIdElection};
use super::transport::CoordinationTransport;
use crate::codec::MessageBuilder;

/// How long `leave` waits for the actor to finish its teardown
const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Generate a random node id
pub fn generate_node_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("node-{:08x}", rng.random::<u32>())
}

/// Node counters
#[derive(Default)]
pub struct NodeStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub stale_dropped: AtomicU64,
    pub elections: AtomicU64,
    pub promotions: AtomicU64,
}

/// Snapshot of node counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeStatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub stale_dropped: u64,
    pub elections: u64,
    pub promotions: u64,
}

enum Command {
    Leave,
    Application {
        application_type: String,
        payload: serde_json::Value,
        reply: oneshot::Sender<Result<()>>,
    },
}

struct Running {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Handle to one member of the coordination group
pub struct CoordinationNode {
    node_id: String,
    node_name: String,
    config: CoordinationConfig,
    provider: Arc<dyn StreamProvider>,
    election: Arc<dyn LeaderElectionStrategy>,
    events: broadcast::Sender<CoordinationEvent>,
    snapshot: watch::Sender<NodeSnapshot>,
    /// Coordinator that refused our last join request
    rejection: watch::Sender<Option<String>>,
    stats: Arc<NodeStats>,
    running: Mutex<Option<Running>>,
}

impl CoordinationNode {
    pub fn new(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        config: CoordinationConfig,
        provider: Arc<dyn StreamProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let node_id = node_id.into();
        if node_id.is_empty() {
            return Err(StrataError::Config("node id must not be empty".into()));
        }

        let (events, _) = broadcast::channel(strata_common::constants::EVENT_CHANNEL_CAPACITY);
        let (snapshot, _) = watch::channel(NodeSnapshot::default());
        let (rejection, _) = watch::channel(None);

        Ok(Self {
            node_id,
            node_name: node_name.into(),
            config,
            provider,
            election: Arc::new(LowestIdElection),
            events,
            snapshot,
            rejection,
            stats: Arc::new(NodeStats::default()),
            running: Mutex::new(None),
        })
    }

    /// Replace the default lowest-id election strategy
    pub fn with_election_strategy(mut self, strategy: Arc<dyn LeaderElectionStrategy>) -> Self {
        self.election = strategy;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn provider(&self) -> Arc<dyn StreamProvider> {
        self.provider.clone()
    }

    pub fn role(&self) -> NodeRole {
        self.snapshot.borrow().role
    }

    pub fn coordinator_id(&self) -> Option<String> {
        self.snapshot.borrow().coordinator_id.clone()
    }

    pub fn is_coordinator(&self) -> bool {
        self.role() == NodeRole::Coordinator
    }

    /// Known nodes (self included once a member)
    pub fn nodes(&self) -> Vec<NetworkNode> {
        self.snapshot.borrow().nodes.clone()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch membership state changes
    pub fn watch(&self) -> watch::Receiver<NodeSnapshot> {
        self.snapshot.subscribe()
    }

    /// Subscribe to coordination events
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            stale_dropped: self.stats.stale_dropped.load(Ordering::Relaxed),
            elections: self.stats.elections.load(Ordering::Relaxed),
            promotions: self.stats.promotions.load(Ordering::Relaxed),
        }
    }

    /// Enter the network and start discovering a coordinator
    pub async fn join(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(StrataError::InvalidState(format!(
                "node {} already joined",
                self.node_id
            )));
        }

        let transport = CoordinationTransport::open(
            self.provider.clone(),
            &self.node_id,
            self.config.discovery_interval,
            self.config.receive_own_messages,
        )?;

        self.rejection.send_replace(None);
        self.snapshot.send_replace(NodeSnapshot {
            role: NodeRole::Discovering,
            coordinator_id: None,
            nodes: Vec::new(),
        });
        let _ = self.events.send(CoordinationEvent::RoleChanged {
            old: NodeRole::Disconnected,
            new: NodeRole::Discovering,
        });

        let (commands, command_rx) = mpsc::channel(32);
        let actor = NodeActor::new(self, transport);
        let task = tokio::spawn(actor.run(command_rx));

        tracing::info!(node = %self.node_id, name = %self.node_name, "Joining coordination network");
        *running = Some(Running { commands, task });
        Ok(())
    }

    /// Leave the network: stop timers, close streams, forget every peer
    pub async fn leave(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        let _ = running.commands.send(Command::Leave).await;
        let mut task = running.task;
        if tokio::time::timeout(LEAVE_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!(node = %self.node_id, "Node actor did not stop in time, aborting");
            task.abort();
            let old = self.role();
            self.snapshot.send_replace(NodeSnapshot::default());
            if old != NodeRole::Disconnected {
                let _ = self.events.send(CoordinationEvent::RoleChanged {
                    old,
                    new: NodeRole::Disconnected,
                });
            }
        }

        tracing::info!(node = %self.node_id, "Left coordination network");
        Ok(())
    }

    /// Broadcast an application message to the group
    pub async fn send_application_message(
        &self,
        application_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<()> {
        let commands = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.commands.clone())
            .ok_or_else(|| StrataError::InvalidState("node has not joined".into()))?;

        let (reply, reply_rx) = oneshot::channel();
        commands
            .send(Command::Application {
                application_type: application_type.into(),
                payload,
                reply,
            })
            .await
            .map_err(|_| StrataError::InvalidState("node is shutting down".into()))?;
        reply_rx
            .await
            .map_err(|_| StrataError::InvalidState("node is shutting down".into()))?
    }

    /// Wait until the node settled as participant or coordinator
    pub async fn wait_until_joined(&self, timeout: Duration) -> Result<NodeRole> {
        let mut snapshot = self.snapshot.subscribe();
        let mut rejection = self.rejection.subscribe();

        let wait = async {
            loop {
                if let Some(coordinator) = rejection.borrow_and_update().clone() {
                    return Err(StrataError::JoinRejected(coordinator));
                }
                let role = snapshot.borrow_and_update().role;
                if role.is_member() {
                    return Ok(role);
                }
                if role == NodeRole::Disconnected {
                    return Err(StrataError::InvalidState("node has not joined".into()));
                }
                tokio::select! {
                    changed = snapshot.changed() => changed.map_err(|_| StrataError::InvalidState("node dropped".into()))?,
                    changed = rejection.changed() => changed.map_err(|_| StrataError::InvalidState("node dropped".into()))?,
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            StrataError::Timeout(format!("node {} did not join within {:?}", self.node_id, timeout))
        })?
    }

    /// Wait until the node holds `role`
    pub async fn wait_for_role(&self, role: NodeRole, timeout: Duration) -> Result<()> {
        let mut snapshot = self.snapshot.subscribe();
        tokio::time::timeout(timeout, snapshot.wait_for(|s| s.role == role))
            .await
            .map_err(|_| StrataError::Timeout(format!("role {role} not reached within {timeout:?}")))?
            .map_err(|_| StrataError::InvalidState("node dropped".into()))?;
        Ok(())
    }
}

/// Owns all mutable membership state of one node
struct NodeActor {
    node_id: String,
    node_name: String,
    config: CoordinationConfig,
    provider: Arc<dyn StreamProvider>,
    election: Arc<dyn LeaderElectionStrategy>,
    events: broadcast::Sender<CoordinationEvent>,
    snapshot: watch::Sender<NodeSnapshot>,
    rejection: watch::Sender<Option<String>>,
    stats: Arc<NodeStats>,
    transport: CoordinationTransport,
    messages: MessageBuilder,

    role: NodeRole,
    peers: HashMap<String, NetworkNode>,
    coordinator_id: Option<String>,
    /// Newest applied heartbeat/topology timestamp per sender
    newest_applied: HashMap<String, f64>,

    discovery: Interval,
    heartbeat: Interval,
    cleanup: Interval,
    discovery_active: bool,
    promotion_deadline: Option<Instant>,
}

impl NodeActor {
    fn new(node: &CoordinationNode, transport: CoordinationTransport) -> Self {
        let mut discovery = tokio::time::interval(node.config.discovery_interval);
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(node.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup =
            tokio::time::interval_at(Instant::now() + CLEANUP_INTERVAL, CLEANUP_INTERVAL);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            node_id: node.node_id.clone(),
            node_name: node.node_name.clone(),
            config: node.config.clone(),
            provider: node.provider.clone(),
            election: node.election.clone(),
            events: node.events.clone(),
            snapshot: node.snapshot.clone(),
            rejection: node.rejection.clone(),
            stats: node.stats.clone(),
            transport,
            messages: MessageBuilder::new(node.node_id.clone()),
            role: NodeRole::Discovering,
            peers: HashMap::new(),
            coordinator_id: None,
            newest_applied: HashMap::new(),
            discovery,
            heartbeat,
            cleanup,
            discovery_active: false,
            promotion_deadline: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        self.start_discovery();

        loop {
            let promotion_at = self
                .promotion_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Application { application_type, payload, reply }) => {
                        let result = self.send(MessageBody::Application { application_type, payload });
                        let _ = reply.send(result);
                    }
                    Some(Command::Leave) | None => break,
                },
                message = self.transport.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => {
                        tracing::error!(node = %self.node_id, "Coordination transport stopped");
                        break;
                    }
                },
                _ = self.discovery.tick(), if self.discovery_active => self.broadcast_discovery(),
                _ = self.heartbeat.tick(), if self.role.is_member() => self.send_heartbeat(),
                _ = self.cleanup.tick() => self.cleanup_stale(),
                _ = tokio::time::sleep_until(promotion_at), if self.promotion_deadline.is_some() => {
                    self.promotion_check();
                }
            }
        }

        self.shutdown().await;
    }

    /// Teardown after the loop: timers are gone with the loop, then streams, then peers
    async fn shutdown(self) {
        let NodeActor {
            node_id,
            transport,
            mut peers,
            role,
            events,
            snapshot,
            ..
        } = self;

        transport.close().await;
        peers.clear();

        snapshot.send_replace(NodeSnapshot::default());
        if role != NodeRole::Disconnected {
            let _ = events.send(CoordinationEvent::RoleChanged {
                old: role,
                new: NodeRole::Disconnected,
            });
        }
        tracing::debug!(node = %node_id, "Node actor stopped");
    }

    fn now(&self) -> f64 {
        self.provider.local_clock()
    }

    fn send(&mut self, body: MessageBody) -> Result<()> {
        let message = self.messages.build(self.now(), body);
        match self.transport.send(&message) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(node = %self.node_id, kind = message.message_type(), error = %e, "Failed to send coordination message");
                Err(e)
            }
        }
    }

    fn emit(&self, event: CoordinationEvent) {
        let _ = self.events.send(event);
    }

    fn set_role(&mut self, new: NodeRole) {
        let old = self.role;
        if old == new {
            return;
        }
        self.role = new;
        tracing::info!(node = %self.node_id, old = %old, new = %new, "Role changed");
        self.emit(CoordinationEvent::RoleChanged { old, new });
    }

    fn sorted_nodes(&self) -> Vec<NetworkNode> {
        let mut nodes: Vec<_> = self.peers.values().cloned().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(NodeSnapshot {
            role: self.role,
            coordinator_id: self.coordinator_id.clone(),
            nodes: self.sorted_nodes(),
        });
    }

    fn publish_topology(&self) {
        self.publish_snapshot();
        self.emit(CoordinationEvent::TopologyChanged {
            nodes: self.sorted_nodes(),
            coordinator_id: self.coordinator_id.clone(),
        });
    }

    fn self_entry(&self) -> NetworkNode {
        NetworkNode::new(&self.node_id, &self.node_name, self.role)
            .with_last_seen(self.now())
            .with_metadata(self.config.capabilities.clone())
    }

    fn refresh_self(&mut self) {
        let entry = self.self_entry();
        self.peers.insert(self.node_id.clone(), entry);
    }

    /// Apply-if-newer gate; only members get an entry
    fn accept_newer(&mut self, sender: &str, timestamp: f64) -> bool {
        if !self.peers.contains_key(sender) {
            return true;
        }
        let newest = self
            .newest_applied
            .entry(sender.to_string())
            .or_insert(f64::MIN);
        if timestamp < *newest {
            self.stats.stale_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        *newest = timestamp;
        true
    }

    // === Timers ===

    fn start_discovery(&mut self) {
        self.set_role(NodeRole::Discovering);
        self.discovery_active = true;
        self.discovery.reset();
        self.promotion_deadline = self
            .config
            .auto_promote
            .then(|| Instant::now() + self.config.join_timeout);
        self.broadcast_discovery();
        self.publish_snapshot();
    }

    fn broadcast_discovery(&mut self) {
        let body = MessageBody::Discovery {
            node_name: self.node_name.clone(),
            role: self.role,
            capabilities: self.config.capabilities.clone(),
        };
        let _ = self.send(body);
    }

    fn send_heartbeat(&mut self) {
        self.refresh_self();
        let status = HeartbeatStatus {
            role: self.role,
            known_nodes: self.peers.len(),
        };
        let _ = self.send(MessageBody::Heartbeat { status });
        if self.role == NodeRole::Coordinator {
            // Newcomers find the coordinator through its advertisements
            self.broadcast_discovery();
        }
    }

    fn promotion_check(&mut self) {
        self.promotion_deadline = None;
        if self.role != NodeRole::Discovering || !self.config.auto_promote {
            return;
        }
        if self.rejection.borrow().is_some() {
            tracing::info!(node = %self.node_id, "Join was rejected, not self-promoting");
            return;
        }
        tracing::info!(node = %self.node_id, "No coordinator found, promoting self");
        self.promote();
    }

    fn promote(&mut self) {
        self.discovery_active = false;
        self.promotion_deadline = None;
        self.coordinator_id = Some(self.node_id.clone());
        self.set_role(NodeRole::Coordinator);
        self.refresh_self();
        self.stats.promotions.fetch_add(1, Ordering::Relaxed);

        self.heartbeat.reset();
        self.broadcast_discovery();
        self.broadcast_topology();
        self.publish_topology();
    }

    fn broadcast_topology(&mut self) {
        self.refresh_self();
        let nodes = self.sorted_nodes();
        let _ = self.send(MessageBody::TopologyUpdate { nodes });
    }

    fn cleanup_stale(&mut self) {
        let now = self.now();
        let timeout = self.config.node_timeout.as_secs_f64();
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.node_id != self.node_id && p.age(now) > timeout)
            .map(|p| p.node_id.clone())
            .collect();

        for node_id in &stale {
            self.peers.remove(node_id);
            tracing::info!(node = %self.node_id, peer = %node_id, "Evicted stale peer");
            self.emit(CoordinationEvent::NodeLeft {
                node_id: node_id.clone(),
                timestamp: chrono::Utc::now(),
            });
        }

        self.newest_applied.retain(|id, _| self.peers.contains_key(id));

        let lost_coordinator = self
            .coordinator_id
            .clone()
            .filter(|id| stale.contains(id));

        if !stale.is_empty() {
            self.publish_topology();
        }

        if let Some(lost) = lost_coordinator {
            match self.role {
                NodeRole::Participant => self.recover_from_coordinator_loss(&lost),
                _ => self.coordinator_id = None,
            }
        }

        if self.role == NodeRole::Coordinator {
            self.prune_duplicate_coordinators();
        }

        if self.role == NodeRole::Coordinator && !stale.is_empty() {
            self.broadcast_topology();
        }
    }

    /// Run the election after the coordinator went away
    fn recover_from_coordinator_loss(&mut self, lost: &str) {
        self.coordinator_id = None;
        self.peers.remove(lost);
        self.refresh_self();
        self.stats.elections.fetch_add(1, Ordering::Relaxed);

        let candidates = self.sorted_nodes();
        let context = ElectionContext::coordinator_lost(lost);
        let won = self
            .election
            .should_become_leader(&self.node_id, &candidates, &context);

        tracing::info!(
            node = %self.node_id,
            lost = %lost,
            candidates = candidates.len(),
            strategy = self.election.name(),
            won,
            "Coordinator lost, election held"
        );

        if won {
            self.promote();
        } else {
            self.start_discovery();
            self.publish_topology();
        }
    }

    /// Step down if another live coordinator wins the election among claimants
    fn prune_duplicate_coordinators(&mut self) {
        let claimants: Vec<NetworkNode> = self
            .peers
            .values()
            .filter(|p| p.role == NodeRole::Coordinator)
            .cloned()
            .collect();
        if claimants.iter().all(|p| p.node_id == self.node_id) {
            return;
        }

        self.stats.elections.fetch_add(1, Ordering::Relaxed);
        let context = ElectionContext::duplicate_coordinator();
        if self
            .election
            .should_become_leader(&self.node_id, &claimants, &context)
        {
            tracing::warn!(node = %self.node_id, claimants = claimants.len(), "Duplicate coordinators detected, keeping role");
            return;
        }

        tracing::warn!(node = %self.node_id, "Duplicate coordinators detected, stepping down");
        self.coordinator_id = None;
        self.peers.clear();
        self.newest_applied.clear();
        self.start_discovery();
        self.publish_topology();
    }

    // === Messages ===

    fn handle_message(&mut self, message: CoordinationMessage) {
        let from_self = message.sender_id == self.node_id;
        if from_self && !self.config.receive_own_messages {
            return;
        }
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        let now = self.now();
        if !from_self {
            if let Some(peer) = self.peers.get_mut(&message.sender_id) {
                peer.last_seen = now;
            }
        }

        let CoordinationMessage {
            sender_id,
            timestamp,
            body,
            ..
        } = message;

        match body {
            MessageBody::Discovery {
                node_name,
                role,
                capabilities,
            } if !from_self => self.on_discovery(sender_id, node_name, role, capabilities),
            MessageBody::JoinRequest {
                node_name,
                capabilities,
            } if !from_self => self.on_join_request(sender_id, node_name, capabilities),
            MessageBody::JoinResponse {
                target_id,
                accepted,
                current_nodes,
            } if !from_self => self.on_join_response(sender_id, target_id, accepted, current_nodes),
            MessageBody::Heartbeat { status } if !from_self => {
                self.on_heartbeat(sender_id, timestamp, status)
            }
            MessageBody::TopologyUpdate { nodes } if !from_self => {
                self.on_topology_update(sender_id, timestamp, nodes)
            }
            MessageBody::Application {
                application_type,
                payload,
            } => self.emit(CoordinationEvent::Application {
                sender_id,
                application_type,
                data: payload,
            }),
            MessageBody::Unknown => {
                tracing::debug!(node = %self.node_id, sender = %sender_id, "Ignoring unknown message type");
            }
            _ => {}
        }
    }

    fn on_discovery(&mut self, sender: String, node_name: String, role: NodeRole, capabilities: Metadata) {
        if role == NodeRole::Coordinator {
            match self.role {
                NodeRole::Discovering | NodeRole::Coordinator => {
                    let now = self.now();
                    let peer = self
                        .peers
                        .entry(sender.clone())
                        .or_insert_with(|| NetworkNode::new(&sender, &node_name, role));
                    peer.node_name = node_name;
                    peer.role = role;
                    peer.last_seen = now;
                    peer.metadata = capabilities;
                }
                _ => {}
            }

            if self.role == NodeRole::Discovering {
                if self.coordinator_id.as_deref() != Some(sender.as_str()) {
                    tracing::debug!(node = %self.node_id, coordinator = %sender, "Adopting advertised coordinator");
                }
                self.coordinator_id = Some(sender);
                let body = MessageBody::JoinRequest {
                    node_name: self.node_name.clone(),
                    capabilities: self.config.capabilities.clone(),
                };
                let _ = self.send(body);
            }
            // A second coordinator is resolved by the next cleanup pass
            self.publish_snapshot();
            return;
        }

        if let Some(peer) = self.peers.get_mut(&sender) {
            peer.role = role;
        }

        // Our own coordinator stopped claiming the role
        if self.role == NodeRole::Participant && self.coordinator_id.as_deref() == Some(sender.as_str()) {
            tracing::warn!(node = %self.node_id, coordinator = %sender, "Coordinator stepped down");
            self.recover_from_coordinator_loss(&sender);
            return;
        }

        if self.role == NodeRole::Coordinator && role == NodeRole::Discovering {
            // Answer newcomers right away instead of waiting for the next heartbeat
            self.broadcast_discovery();
        }
    }

    fn on_join_request(&mut self, sender: String, node_name: String, capabilities: Metadata) {
        if self.role != NodeRole::Coordinator {
            tracing::trace!(node = %self.node_id, from = %sender, "Ignoring join request, not coordinator");
            return;
        }

        let previous_role = self.peers.get(&sender).map(|p| p.role);
        let known = previous_role.is_some();
        if !known && self.peers.len() >= self.config.max_nodes {
            tracing::warn!(node = %self.node_id, from = %sender, max = self.config.max_nodes, "Group full, rejecting join");
            let _ = self.send(MessageBody::JoinResponse {
                target_id: sender,
                accepted: false,
                current_nodes: Vec::new(),
            });
            return;
        }

        let peer = NetworkNode::new(&sender, &node_name, NodeRole::Participant)
            .with_last_seen(self.now())
            .with_metadata(capabilities);
        self.peers.insert(sender.clone(), peer);
        self.refresh_self();

        let current_nodes = self.sorted_nodes();
        let _ = self.send(MessageBody::JoinResponse {
            target_id: sender.clone(),
            accepted: true,
            current_nodes,
        });
        self.broadcast_topology();
        self.publish_topology();

        // Repeated requests from a settled participant are not a new admission
        if previous_role != Some(NodeRole::Participant) {
            if known {
                tracing::info!(node = %self.node_id, peer = %sender, name = %node_name, "Re-admitted node");
            } else {
                tracing::info!(node = %self.node_id, peer = %sender, name = %node_name, "Admitted node");
            }
            self.emit(CoordinationEvent::NodeJoined {
                node_id: sender,
                node_name,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    fn on_join_response(
        &mut self,
        sender: String,
        target_id: String,
        accepted: bool,
        current_nodes: Vec<NetworkNode>,
    ) {
        if target_id != self.node_id {
            return;
        }
        if self.role != NodeRole::Discovering {
            tracing::debug!(node = %self.node_id, from = %sender, role = %self.role, "Ignoring join response, not discovering");
            return;
        }
        if self.coordinator_id.as_deref() != Some(sender.as_str()) {
            tracing::warn!(
                node = %self.node_id,
                from = %sender,
                coordinator = ?self.coordinator_id,
                "Join response from a node that is not our coordinator"
            );
            return;
        }

        if !accepted {
            tracing::warn!(node = %self.node_id, coordinator = %sender, "Join rejected");
            self.rejection.send_replace(Some(sender));
            return;
        }

        let now = self.now();
        for mut node in current_nodes {
            if node.node_id == self.node_id {
                continue;
            }
            node.last_seen = now;
            self.peers.insert(node.node_id.clone(), node);
        }

        self.discovery_active = false;
        self.promotion_deadline = None;
        self.rejection.send_replace(None);
        self.set_role(NodeRole::Participant);
        self.refresh_self();
        self.heartbeat.reset();

        tracing::info!(node = %self.node_id, coordinator = %sender, peers = self.peers.len(), "Joined as participant");
        self.publish_topology();
    }

    fn on_heartbeat(&mut self, sender: String, timestamp: f64, status: HeartbeatStatus) {
        if !self.peers.contains_key(&sender) || !self.accept_newer(&sender, timestamp) {
            return;
        }
        let Some(peer) = self.peers.get_mut(&sender) else {
            return;
        };
        let role_changed = peer.role != status.role;
        peer.role = status.role;

        if role_changed {
            if self.role == NodeRole::Participant
                && self.coordinator_id.as_deref() == Some(sender.as_str())
                && status.role != NodeRole::Coordinator
            {
                tracing::warn!(node = %self.node_id, coordinator = %sender, "Coordinator stepped down");
                self.recover_from_coordinator_loss(&sender);
                return;
            }
            self.publish_snapshot();
        }
    }

    fn on_topology_update(&mut self, sender: String, timestamp: f64, nodes: Vec<NetworkNode>) {
        if self.coordinator_id.as_deref() != Some(sender.as_str()) {
            tracing::trace!(node = %self.node_id, from = %sender, "Ignoring topology from non-coordinator");
            return;
        }
        if self.role != NodeRole::Participant {
            return;
        }
        if !self.accept_newer(&sender, timestamp) {
            return;
        }

        if !nodes.iter().any(|n| n.node_id == self.node_id) {
            tracing::warn!(node = %self.node_id, coordinator = %sender, "Dropped from topology, rejoining");
            self.peers.retain(|id, _| *id == sender);
            self.newest_applied.retain(|id, _| *id == sender);
            self.start_discovery();
            self.publish_topology();
            return;
        }

        let now = self.now();
        let before: Vec<String> = self.sorted_nodes().into_iter().map(|n| n.node_id).collect();
        let mut replaced: HashMap<String, NetworkNode> = nodes
            .into_iter()
            .filter(|n| n.node_id != self.node_id)
            .map(|mut n| {
                n.last_seen = now;
                (n.node_id.clone(), n)
            })
            .collect();
        replaced.insert(self.node_id.clone(), self.self_entry());

        let membership_changed = before.len() != replaced.len()
            || before.iter().any(|id| !replaced.contains_key(id))
            || replaced.iter().any(|(id, n)| {
                self.peers.get(id).is_none_or(|old| old.role != n.role)
            });

        for id in &before {
            if !replaced.contains_key(id) {
                self.emit(CoordinationEvent::NodeLeft {
                    node_id: id.clone(),
                    timestamp: chrono::Utc::now(),
                });
            }
        }
        for (id, node) in &replaced {
            if !self.peers.contains_key(id) {
                self.emit(CoordinationEvent::NodeJoined {
                    node_id: id.clone(),
                    node_name: node.node_name.clone(),
                    timestamp: chrono::Utc::now(),
                });
            }
        }

        self.peers = replaced;
        if membership_changed {
            self.publish_topology();
        } else {
            self.publish_snapshot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_sim::SimNetwork;
    use tokio_test::{assert_err, assert_ok};

    fn fast_config() -> CoordinationConfig {
        CoordinationConfig {
            discovery_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(100),
            node_timeout: Duration::from_millis(1500),
            join_timeout: Duration::from_millis(400),
            ..Default::default()
        }
    }

    fn node(network: &SimNetwork, id: &str, config: CoordinationConfig) -> CoordinationNode {
        CoordinationNode::new(id, id.to_uppercase(), config, Arc::new(network.endpoint())).unwrap()
    }

    #[test]
    fn test_generate_node_id() {
        let id = generate_node_id();
        assert!(id.starts_with("node-"));
        assert_eq!(id.len(), 13);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let network = SimNetwork::new();
        let config = CoordinationConfig {
            max_nodes: 0,
            ..Default::default()
        };
        assert!(CoordinationNode::new("a", "A", config, Arc::new(network.endpoint())).is_err());
        assert!(CoordinationNode::new("", "A", fast_config(), Arc::new(network.endpoint())).is_err());
    }

    #[tokio::test]
    async fn test_starts_disconnected() {
        let network = SimNetwork::new();
        let a = node(&network, "node-a", fast_config());
        assert_eq!(a.role(), NodeRole::Disconnected);
        assert!(a.nodes().is_empty());
        assert_err!(a.wait_until_joined(Duration::from_millis(10)).await);
        assert_err!(a.send_application_message("x", serde_json::Value::Null).await);
    }

    #[tokio::test]
    async fn test_join_twice_fails() {
        let network = SimNetwork::new();
        let a = node(&network, "node-a", fast_config());
        assert_ok!(a.join().await);
        assert!(matches!(a.join().await, Err(StrataError::InvalidState(_))));
        assert_ok!(a.leave().await);
    }

    #[tokio::test]
    async fn test_lonely_node_promotes_once() {
        let network = SimNetwork::new();
        let a = node(&network, "node-a", fast_config());
        let mut events = a.subscribe();

        a.join().await.unwrap();
        assert_eq!(a.role(), NodeRole::Discovering);
        let role = a.wait_until_joined(Duration::from_secs(2)).await.unwrap();
        assert_eq!(role, NodeRole::Coordinator);
        assert_eq!(a.coordinator_id().as_deref(), Some("node-a"));
        assert_eq!(a.nodes().len(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(a.stats().promotions, 1);

        let mut promotions = 0;
        while let Ok(event) = events.try_recv() {
            if let CoordinationEvent::RoleChanged { new: NodeRole::Coordinator, .. } = event {
                promotions += 1;
            }
        }
        assert_eq!(promotions, 1);
        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_promotion_without_auto_promote() {
        let network = SimNetwork::new();
        let config = CoordinationConfig {
            auto_promote: false,
            ..fast_config()
        };
        let a = node(&network, "node-a", config);
        a.join().await.unwrap();
        let result = a.wait_until_joined(Duration::from_millis(700)).await;
        assert!(matches!(result, Err(StrataError::Timeout(_))));
        assert_eq!(a.role(), NodeRole::Discovering);
        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_resets_state() {
        let network = SimNetwork::new();
        let a = node(&network, "node-a", fast_config());
        a.join().await.unwrap();
        a.wait_until_joined(Duration::from_secs(2)).await.unwrap();

        a.leave().await.unwrap();
        assert_eq!(a.role(), NodeRole::Disconnected);
        assert!(a.nodes().is_empty());
        assert!(a.coordinator_id().is_none());
        assert_eq!(network.stats().live_outlets, 0);

        // Leaving is terminal until join is called again
        a.join().await.unwrap();
        assert_eq!(a.wait_until_joined(Duration::from_secs(2)).await.unwrap(), NodeRole::Coordinator);
        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_node_joins_as_participant() {
        let network = SimNetwork::new();
        let a = node(&network, "node-a", fast_config());
        a.join().await.unwrap();
        a.wait_until_joined(Duration::from_secs(2)).await.unwrap();

        let b = node(&network, "node-b", CoordinationConfig {
            join_timeout: Duration::from_secs(5),
            ..fast_config()
        });
        let mut a_events = a.subscribe();
        b.join().await.unwrap();
        assert_eq!(b.wait_until_joined(Duration::from_secs(3)).await.unwrap(), NodeRole::Participant);
        assert_eq!(b.coordinator_id().as_deref(), Some("node-a"));

        let joined = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(CoordinationEvent::NodeJoined { node_id, .. }) = a_events.recv().await {
                    return node_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(joined, "node-b");
        assert_eq!(a.nodes().len(), 2);

        b.leave().await.unwrap();
        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_group_rejects_join() {
        let network = SimNetwork::new();
        let a = node(&network, "node-a", CoordinationConfig {
            max_nodes: 1,
            ..fast_config()
        });
        a.join().await.unwrap();
        a.wait_until_joined(Duration::from_secs(2)).await.unwrap();

        let b = node(&network, "node-b", CoordinationConfig {
            join_timeout: Duration::from_secs(5),
            ..fast_config()
        });
        b.join().await.unwrap();
        let result = b.wait_until_joined(Duration::from_secs(3)).await;
        assert!(matches!(result, Err(StrataError::JoinRejected(ref by)) if by == "node-a"));
        assert_eq!(b.role(), NodeRole::Discovering);

        b.leave().await.unwrap();
        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_application_messages_reach_peers() {
        let network = SimNetwork::new();
        let a = node(&network, "node-a", fast_config());
        a.join().await.unwrap();
        a.wait_until_joined(Duration::from_secs(2)).await.unwrap();
        let b = node(&network, "node-b", CoordinationConfig {
            join_timeout: Duration::from_secs(5),
            ..fast_config()
        });
        b.join().await.unwrap();
        b.wait_until_joined(Duration::from_secs(3)).await.unwrap();

        let mut b_events = b.subscribe();
        a.send_application_message("greeting", serde_json::json!({"hello": "b"}))
            .await
            .unwrap();

        let (sender, data) = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(CoordinationEvent::Application { sender_id, application_type, data }) = b_events.recv().await {
                    if application_type == "greeting" {
                        return (sender_id, data);
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(sender, "node-a");
        assert_eq!(data["hello"], "b");

        b.leave().await.unwrap();
        a.leave().await.unwrap();
    }

    fn joiner_config() -> CoordinationConfig {
        CoordinationConfig {
            join_timeout: Duration::from_secs(5),
            ..fast_config()
        }
    }

    /// Coordinator node-a with participant node-b
    async fn settled_pair(network: &SimNetwork) -> (CoordinationNode, CoordinationNode) {
        let a = node(network, "node-a", fast_config());
        a.join().await.unwrap();
        a.wait_until_joined(Duration::from_secs(2)).await.unwrap();
        let b = node(network, "node-b", joiner_config());
        b.join().await.unwrap();
        assert_eq!(b.wait_until_joined(Duration::from_secs(3)).await.unwrap(), NodeRole::Participant);
        (a, b)
    }

    /// Extra outlet on the coordination stream that can speak for any sender
    async fn impersonator(network: &SimNetwork) -> CoordinationTransport {
        let transport =
            CoordinationTransport::open(Arc::new(network.endpoint()), "node-x", Duration::from_millis(20), false)
                .unwrap();
        // Peers pick the new outlet up on their next rediscovery pass
        tokio::time::sleep(Duration::from_millis(300)).await;
        transport
    }

    #[tokio::test]
    async fn test_stale_heartbeat_is_dropped() {
        let network = SimNetwork::new();
        let (a, b) = settled_pair(&network).await;
        // Let a few heartbeats from node-a land first
        tokio::time::sleep(Duration::from_millis(300)).await;
        let fake = impersonator(&network).await;

        let before = b.stats().stale_dropped;
        let mut messages = MessageBuilder::new("node-a");
        let old = messages.build(
            0.0,
            MessageBody::Heartbeat {
                status: HeartbeatStatus {
                    role: NodeRole::Discovering,
                    known_nodes: 1,
                },
            },
        );
        fake.send(&old).unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while b.stats().stale_dropped == before {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Applying it would have demoted our coordinator
        assert_eq!(b.role(), NodeRole::Participant);
        assert_eq!(b.coordinator_id().as_deref(), Some("node-a"));
        assert_eq!(b.snapshot().node("node-a").map(|n| n.role), Some(NodeRole::Coordinator));
        assert_eq!(b.stats().elections, 0);

        fake.close().await;
        b.leave().await.unwrap();
        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_participant_missing_from_topology_rejoins() {
        let network = SimNetwork::new();
        let (a, b) = settled_pair(&network).await;
        let fake = impersonator(&network).await;
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        let mut messages = MessageBuilder::new("node-a");
        let coordinator_only = vec![NetworkNode::new("node-a", "NODE-A", NodeRole::Coordinator)];
        let update = messages.build(
            a.provider().local_clock(),
            MessageBody::TopologyUpdate {
                nodes: coordinator_only,
            },
        );
        fake.send(&update).unwrap();

        let roles = tokio::time::timeout(Duration::from_secs(3), async {
            let mut roles = Vec::new();
            loop {
                if let Ok(CoordinationEvent::RoleChanged { new, .. }) = b_events.recv().await {
                    roles.push(new);
                    if new == NodeRole::Participant {
                        return roles;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(roles, vec![NodeRole::Discovering, NodeRole::Participant]);
        assert_eq!(b.coordinator_id().as_deref(), Some("node-a"));

        // The coordinator treats the rejoin as a fresh admission
        let rejoined = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(CoordinationEvent::NodeJoined { node_id, .. }) = a_events.recv().await {
                    return node_id;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(rejoined, "node-b");
        assert_eq!(a.nodes().len(), 2);

        fake.close().await;
        b.leave().await.unwrap();
        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_coordinator_steps_down() {
        let network = SimNetwork::new();
        let a = node(&network, "node-a", fast_config());
        let b = node(&network, "node-b", fast_config());

        // Partitioned: each side promotes itself
        network.silence("node-a");
        network.silence("node-b");
        a.join().await.unwrap();
        b.join().await.unwrap();
        assert_eq!(a.wait_until_joined(Duration::from_secs(2)).await.unwrap(), NodeRole::Coordinator);
        assert_eq!(b.wait_until_joined(Duration::from_secs(2)).await.unwrap(), NodeRole::Coordinator);

        let mut a_events = a.subscribe();
        network.restore("node-a");
        network.restore("node-b");

        let mut b_state = b.watch();
        tokio::time::timeout(
            Duration::from_secs(4),
            b_state.wait_for(|s| s.role == NodeRole::Participant && s.coordinator_id.as_deref() == Some("node-a")),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(a.role(), NodeRole::Coordinator);
        assert_eq!(a.stats().promotions, 1);
        assert_eq!(b.stats().promotions, 1);
        assert!(b.stats().elections >= 1);

        let mut readmitted = false;
        while let Ok(event) = a_events.try_recv() {
            if matches!(event, CoordinationEvent::NodeJoined { ref node_id, .. } if node_id == "node-b") {
                readmitted = true;
            }
        }
        assert!(readmitted);

        b.leave().await.unwrap();
        a.leave().await.unwrap();
    }
}
