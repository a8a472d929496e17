//! Multi-layer coordinator.
//!
//! Binds a coordination node to a protocol. The coordinator distributes its
//! protocol to every member; participants check the protocol id and then all
//! members bring up the same data layers. Topology changes are forwarded to
//! every active layer.

use std::sync::Arc;
use std::time::Duration;
use strata_common::constants::{EVENT_CHANNEL_CAPACITY, PROTOCOL_CONFIG_MESSAGE};
use strata_common::{
    CoordinationEvent, NodeRole, NodeSnapshot, ProtocolConfig, Result, SampleData, StrataError,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{LayerManager, LayerStatsSnapshot};
use crate::coordination::CoordinationNode;

/// Local protocol state
#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Mismatch { expected: String, received: String },
    Violation(String),
}

struct Shared {
    node: Arc<CoordinationNode>,
    protocol: ProtocolConfig,
    events: broadcast::Sender<CoordinationEvent>,
    layers: RwLock<Vec<LayerManager>>,
    readiness: watch::Sender<Readiness>,
}

pub struct MultiLayerCoordinator {
    shared: Arc<Shared>,
    shutdown: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MultiLayerCoordinator {
    pub fn new(node: Arc<CoordinationNode>, protocol: ProtocolConfig) -> Result<Self> {
        protocol.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (readiness, _) = watch::channel(Readiness::Pending);
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            shared: Arc::new(Shared {
                node,
                protocol,
                events,
                layers: RwLock::new(Vec::new()),
                readiness,
            }),
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn node(&self) -> &Arc<CoordinationNode> {
        &self.shared.node
    }

    pub fn protocol(&self) -> &ProtocolConfig {
        &self.shared.protocol
    }

    /// Join the network and start reacting to membership events
    pub async fn initialize(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(StrataError::InvalidState("coordinator already initialized".into()));
        }

        // Subscribe before joining so the first role change is not missed
        let node_events = self.shared.node.subscribe();
        *task = Some(tokio::spawn(run(
            self.shared.clone(),
            node_events,
            self.shutdown.subscribe(),
        )));

        if let Err(e) = self.shared.node.join().await {
            let _ = self.shutdown.send(());
            task.take();
            return Err(e);
        }
        tracing::info!(
            node = %self.shared.node.node_id(),
            protocol = %self.shared.protocol.protocol_id,
            "Multi-layer coordinator initialized"
        );
        Ok(())
    }

    /// Resolve once the protocol is active locally
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let mut readiness = self.shared.readiness.subscribe();
        let state = tokio::time::timeout(timeout, readiness.wait_for(|r| *r != Readiness::Pending))
            .await
            .map_err(|_| StrataError::Timeout(format!("protocol not active within {timeout:?}")))?
            .map_err(|_| StrataError::InvalidState("coordinator dropped".into()))?
            .clone();

        match state {
            Readiness::Ready => Ok(()),
            Readiness::Mismatch { expected, received } => {
                Err(StrataError::ProtocolMismatch { expected, received })
            }
            Readiness::Violation(reason) => Err(StrataError::ProtocolViolation(reason)),
            Readiness::Pending => Err(StrataError::InvalidState("protocol pending".into())),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.shared.readiness.borrow() == Readiness::Ready
    }

    /// Coordination events and layer data in one stream
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinationEvent> {
        self.shared.events.subscribe()
    }

    pub async fn send_layer_data(&self, layer_id: &str, data: SampleData) -> Result<()> {
        let layers = self.shared.layers.read().await;
        match layers.iter().find(|l| l.layer_id() == layer_id) {
            Some(layer) => layer.send_data(data),
            None => Err(self.missing_layer(layer_id)),
        }
    }

    pub async fn pause_layer(&self, layer_id: &str) -> Result<()> {
        let mut layers = self.shared.layers.write().await;
        match layers.iter_mut().find(|l| l.layer_id() == layer_id) {
            Some(layer) => layer.pause(),
            None => Err(self.missing_layer(layer_id)),
        }
    }

    pub async fn resume_layer(&self, layer_id: &str) -> Result<()> {
        let mut layers = self.shared.layers.write().await;
        match layers.iter_mut().find(|l| l.layer_id() == layer_id) {
            Some(layer) => layer.resume(),
            None => Err(self.missing_layer(layer_id)),
        }
    }

    /// Ids of the active layers, in declaration order
    pub async fn layer_ids(&self) -> Vec<String> {
        self.shared
            .layers
            .read()
            .await
            .iter()
            .map(|l| l.layer_id().to_string())
            .collect()
    }

    pub async fn layer_stats(&self) -> Vec<LayerStatsSnapshot> {
        self.shared
            .layers
            .read()
            .await
            .iter()
            .map(LayerManager::stats)
            .collect()
    }

    fn missing_layer(&self, layer_id: &str) -> StrataError {
        if self.shared.protocol.data_layers().any(|l| l.layer_id == layer_id) {
            StrataError::InvalidState(format!("layer '{layer_id}' is not active yet"))
        } else {
            StrataError::UnknownLayer(layer_id.to_string())
        }
    }

    /// Tear down layers, then leave the network
    pub async fn dispose(&self) -> Result<()> {
        let _ = self.shutdown.send(());
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }

        let mut layers = self.shared.layers.write().await;
        for layer in layers.iter_mut() {
            layer.dispose().await;
        }
        layers.clear();
        drop(layers);

        self.shared.readiness.send_replace(Readiness::Pending);
        self.shared.node.leave().await?;
        tracing::info!(node = %self.shared.node.node_id(), "Multi-layer coordinator disposed");
        Ok(())
    }
}

async fn run(
    shared: Arc<Shared>,
    mut node_events: broadcast::Receiver<CoordinationEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => break,
            event = node_events.recv() => event,
        };

        match event {
            Ok(event) => {
                let _ = shared.events.send(event.clone());
                shared.handle(event).await;
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(node = %shared.node.node_id(), missed, "Coordination events lagged, resyncing topology");
                shared.update_layers(&shared.node.snapshot()).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

impl Shared {
    async fn handle(&self, event: CoordinationEvent) {
        match event {
            CoordinationEvent::RoleChanged {
                new: NodeRole::Coordinator,
                ..
            } => {
                self.activate_layers().await;
                self.broadcast_protocol().await;
            }
            CoordinationEvent::NodeJoined { node_id, .. } => {
                if self.node.is_coordinator() {
                    tracing::debug!(peer = %node_id, "Sending protocol to new member");
                    self.broadcast_protocol().await;
                }
            }
            CoordinationEvent::Application {
                sender_id,
                application_type,
                data,
            } if application_type == PROTOCOL_CONFIG_MESSAGE => {
                self.on_protocol_config(&sender_id, data).await;
            }
            CoordinationEvent::TopologyChanged {
                nodes,
                coordinator_id,
            } => {
                let snapshot = NodeSnapshot {
                    role: self.node.role(),
                    coordinator_id,
                    nodes,
                };
                self.update_layers(&snapshot).await;
            }
            _ => {}
        }
    }

    async fn broadcast_protocol(&self) {
        let payload = match serde_json::to_value(&self.protocol) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode protocol");
                return;
            }
        };
        if let Err(e) = self
            .node
            .send_application_message(PROTOCOL_CONFIG_MESSAGE, payload)
            .await
        {
            tracing::warn!(node = %self.node.node_id(), error = %e, "Failed to distribute protocol");
        }
    }

    async fn on_protocol_config(&self, sender_id: &str, payload: serde_json::Value) {
        if self.node.is_coordinator() {
            return;
        }
        if self.node.coordinator_id().as_deref() != Some(sender_id) {
            tracing::debug!(from = %sender_id, "Ignoring protocol from a node that is not our coordinator");
            return;
        }

        let announced: ProtocolConfig = match serde_json::from_value(payload) {
            Ok(protocol) => protocol,
            Err(e) => {
                tracing::error!(from = %sender_id, error = %e, "Undecodable protocol announcement");
                self.readiness.send_replace(Readiness::Violation(format!(
                    "coordinator {sender_id} announced an undecodable protocol: {e}"
                )));
                return;
            }
        };

        if announced.protocol_id != self.protocol.protocol_id {
            tracing::error!(
                node = %self.node.node_id(),
                expected = %self.protocol.protocol_id,
                received = %announced.protocol_id,
                "Protocol mismatch with coordinator"
            );
            self.readiness.send_replace(Readiness::Mismatch {
                expected: self.protocol.protocol_id.clone(),
                received: announced.protocol_id,
            });
            return;
        }

        self.activate_layers().await;
    }

    /// Bring up every declared data layer once; failures stay per layer
    async fn activate_layers(&self) {
        if *self.readiness.borrow() == Readiness::Ready {
            return;
        }

        let mut layers = self.layers.write().await;
        for config in self.protocol.data_layers() {
            if layers.iter().any(|l| l.layer_id() == config.layer_id) {
                continue;
            }
            let mut layer = LayerManager::new(
                config.clone(),
                self.node.node_id(),
                self.node.provider(),
                self.events.clone(),
            );
            match layer.initialize().await {
                Ok(()) => layers.push(layer),
                Err(e) => {
                    tracing::error!(layer = %config.layer_id, error = %e, "Layer failed to activate");
                }
            }
        }

        let snapshot = self.node.snapshot();
        for layer in layers.iter() {
            if let Err(e) = layer.update_known_nodes(&snapshot.nodes, snapshot.coordinator_id.as_deref()) {
                tracing::warn!(layer = %layer.layer_id(), error = %e, "Layer topology update failed");
            }
        }
        drop(layers);

        tracing::info!(node = %self.node.node_id(), protocol = %self.protocol.protocol_id, "Protocol active");
        self.readiness.send_replace(Readiness::Ready);
    }

    async fn update_layers(&self, snapshot: &NodeSnapshot) {
        let layers = self.layers.read().await;
        for layer in layers.iter() {
            if let Err(e) = layer.update_known_nodes(&snapshot.nodes, snapshot.coordinator_id.as_deref()) {
                tracing::warn!(layer = %layer.layer_id(), error = %e, "Layer topology update failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::CoordinationConfig;
    use strata_sim::SimNetwork;

    fn config() -> CoordinationConfig {
        CoordinationConfig {
            discovery_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(100),
            node_timeout: Duration::from_millis(1500),
            join_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    fn coordinator(network: &SimNetwork, id: &str, protocol: ProtocolConfig) -> MultiLayerCoordinator {
        let node = CoordinationNode::new(id, id, config(), Arc::new(network.endpoint())).unwrap();
        MultiLayerCoordinator::new(Arc::new(node), protocol).unwrap()
    }

    #[tokio::test]
    async fn test_lone_coordinator_activates_layers() {
        let network = SimNetwork::new();
        let mlc = coordinator(&network, "node-a", ProtocolConfig::multimodal());
        assert!(matches!(
            mlc.send_layer_data("sensor", SampleData::Float32(vec![0.0; 8])).await,
            Err(StrataError::InvalidState(_))
        ));

        mlc.initialize().await.unwrap();
        mlc.wait_until_ready(Duration::from_secs(2)).await.unwrap();
        assert_eq!(mlc.node().role(), NodeRole::Coordinator);
        assert_eq!(mlc.layer_ids().await, vec!["sensor".to_string(), "events".to_string()]);

        mlc.send_layer_data("events", SampleData::text("start")).await.unwrap();
        assert!(matches!(
            mlc.send_layer_data("nope", SampleData::text("x")).await,
            Err(StrataError::UnknownLayer(_))
        ));
        assert!(matches!(mlc.pause_layer("events").await, Err(StrataError::NotPausable(_))));
        mlc.pause_layer("sensor").await.unwrap();
        assert!(mlc.layer_stats().await.iter().any(|s| s.layer_id == "sensor" && s.paused));

        mlc.dispose().await.unwrap();
        assert!(!mlc.is_ready());
        assert_eq!(mlc.node().role(), NodeRole::Disconnected);
        assert_eq!(network.stats().live_outlets, 0);
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let network = SimNetwork::new();
        let mlc = coordinator(&network, "node-a", ProtocolConfig::basic());
        mlc.initialize().await.unwrap();
        assert!(mlc.initialize().await.is_err());
        mlc.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_participant_detects_protocol_mismatch() {
        let network = SimNetwork::new();
        let a = coordinator(&network, "node-a", ProtocolConfig::basic());
        a.initialize().await.unwrap();
        a.wait_until_ready(Duration::from_secs(2)).await.unwrap();

        let node = CoordinationNode::new(
            "node-b",
            "B",
            CoordinationConfig {
                join_timeout: Duration::from_secs(5),
                ..config()
            },
            Arc::new(network.endpoint()),
        )
        .unwrap();
        let b = MultiLayerCoordinator::new(Arc::new(node), ProtocolConfig::gaming()).unwrap();
        b.initialize().await.unwrap();

        let result = b.wait_until_ready(Duration::from_secs(3)).await;
        match result {
            Err(StrataError::ProtocolMismatch { expected, received }) => {
                assert_eq!(expected, "gaming");
                assert_eq!(received, "basic");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
        assert!(b.layer_ids().await.is_empty());

        b.dispose().await.unwrap();
        a.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_protocol_is_a_violation() {
        let network = SimNetwork::new();
        // Bare node as coordinator, so the only announcement is the broken one
        let a = CoordinationNode::new("node-a", "A", config(), Arc::new(network.endpoint())).unwrap();
        a.join().await.unwrap();
        a.wait_until_joined(Duration::from_secs(2)).await.unwrap();

        let node = CoordinationNode::new(
            "node-b",
            "B",
            CoordinationConfig {
                join_timeout: Duration::from_secs(5),
                ..config()
            },
            Arc::new(network.endpoint()),
        )
        .unwrap();
        let b = MultiLayerCoordinator::new(Arc::new(node), ProtocolConfig::basic()).unwrap();
        b.initialize().await.unwrap();
        b.node().wait_for_role(NodeRole::Participant, Duration::from_secs(3)).await.unwrap();

        a.send_application_message(PROTOCOL_CONFIG_MESSAGE, serde_json::json!({"protocol_id": 7}))
            .await
            .unwrap();

        let result = b.wait_until_ready(Duration::from_secs(2)).await;
        assert!(matches!(result, Err(StrataError::ProtocolViolation(_))), "{result:?}");
        assert!(b.layer_ids().await.is_empty());

        b.dispose().await.unwrap();
        a.leave().await.unwrap();
    }
}
