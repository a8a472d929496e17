//! Multi-node scenarios over one in-memory network.

use std::sync::Arc;
use std::time::Duration;

use strata_common::{
    ChannelFormat, CoordinationConfig, CoordinationEvent, Metadata, NodeRole, ProtocolConfig,
    SampleData, StreamConfig, StreamLayerConfig,
};
use strata_node::coordination::{CoordinationNode, MetadataPriorityElection};
use strata_node::layers::MultiLayerCoordinator;
use strata_sim::SimNetwork;

fn fast_config(join_timeout: Duration) -> CoordinationConfig {
    CoordinationConfig {
        discovery_interval: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(100),
        node_timeout: Duration::from_millis(1500),
        join_timeout,
        ..Default::default()
    }
}

/// First node of a group: promotes quickly
fn founder(network: &SimNetwork, id: &str) -> CoordinationNode {
    let config = fast_config(Duration::from_millis(300));
    CoordinationNode::new(id, id, config, Arc::new(network.endpoint())).unwrap()
}

/// Later nodes: long join timeout so they never race the founder
fn joiner(network: &SimNetwork, id: &str) -> CoordinationNode {
    let config = fast_config(Duration::from_secs(5));
    CoordinationNode::new(id, id, config, Arc::new(network.endpoint())).unwrap()
}

async fn start(node: &CoordinationNode, expected: NodeRole) {
    node.join().await.unwrap();
    let role = node.wait_until_joined(Duration::from_secs(3)).await.unwrap();
    assert_eq!(role, expected, "{}", node.node_id());
}

#[tokio::test]
async fn test_solo_node_promotes_within_join_timeout() {
    let network = SimNetwork::new();
    let config = CoordinationConfig {
        join_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let a = CoordinationNode::new("node-a", "A", config, Arc::new(network.endpoint())).unwrap();

    a.join().await.unwrap();
    let role = a.wait_until_joined(Duration::from_millis(1100)).await.unwrap();
    assert_eq!(role, NodeRole::Coordinator);
    assert_eq!(a.coordinator_id().as_deref(), Some("node-a"));
    a.leave().await.unwrap();
}

#[tokio::test]
async fn test_participant_adopts_existing_coordinator() {
    let network = SimNetwork::new();
    let a = founder(&network, "node-a");
    let b = joiner(&network, "node-b");

    start(&a, NodeRole::Coordinator).await;
    start(&b, NodeRole::Participant).await;

    assert_eq!(b.coordinator_id().as_deref(), Some("node-a"));
    let snapshot = b.snapshot();
    assert!(snapshot.node("node-a").is_some());
    assert!(snapshot.node("node-b").is_some());

    // The coordinator keeps one coordinator and sees both members
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.role(), NodeRole::Coordinator);
    assert_eq!(a.nodes().len(), 2);

    b.leave().await.unwrap();
    a.leave().await.unwrap();
}

#[tokio::test]
async fn test_sole_survivor_takes_over() {
    let network = SimNetwork::new();
    let a = founder(&network, "node-a");
    let b = joiner(&network, "node-b");
    start(&a, NodeRole::Coordinator).await;
    start(&b, NodeRole::Participant).await;

    let mut events = b.subscribe();
    // A hangs: its streams stay open but nothing it sends arrives
    network.silence("node-a");

    // node_timeout plus one cleanup tick, with slack
    b.wait_for_role(NodeRole::Coordinator, Duration::from_secs(4)).await.unwrap();
    assert_eq!(b.coordinator_id().as_deref(), Some("node-b"));
    assert!(b.snapshot().node("node-a").is_none());

    let mut saw_left = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CoordinationEvent::NodeLeft { ref node_id, .. } if node_id == "node-a") {
            saw_left = true;
        }
    }
    assert!(saw_left);

    network.restore("node-a");
    b.leave().await.unwrap();
    a.leave().await.unwrap();
}

#[tokio::test]
async fn test_failover_elects_lowest_surviving_id() {
    let network = SimNetwork::new();
    let a = founder(&network, "node-a");
    let b = joiner(&network, "node-b");
    let c = joiner(&network, "node-c");
    start(&a, NodeRole::Coordinator).await;
    start(&b, NodeRole::Participant).await;
    start(&c, NodeRole::Participant).await;

    network.silence("node-a");

    b.wait_for_role(NodeRole::Coordinator, Duration::from_secs(4)).await.unwrap();
    c.wait_for_role(NodeRole::Participant, Duration::from_secs(4)).await.unwrap();
    // c may still be finishing its own eviction pass
    let mut c_state = c.watch();
    tokio::time::timeout(
        Duration::from_secs(4),
        c_state.wait_for(|s| {
            s.role == NodeRole::Participant && s.coordinator_id.as_deref() == Some("node-b")
        }),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(b.stats().promotions, 1);
    assert_eq!(c.stats().promotions, 0);

    network.restore("node-a");
    for node in [&c, &b, &a] {
        node.leave().await.unwrap();
    }
}

#[tokio::test]
async fn test_metadata_priority_picks_successor() {
    let network = SimNetwork::new();
    let ranked = |id: &str, priority: Option<&str>, join_timeout: Duration| {
        let mut config = fast_config(join_timeout);
        if let Some(priority) = priority {
            config.capabilities = Metadata::from([("priority".to_string(), priority.to_string())]);
        }
        CoordinationNode::new(id, id, config, Arc::new(network.endpoint()))
            .unwrap()
            .with_election_strategy(Arc::new(MetadataPriorityElection::default()))
    };

    let a = ranked("node-a", Some("1"), Duration::from_millis(300));
    let b = ranked("node-b", None, Duration::from_secs(5));
    let c = ranked("node-c", Some("10"), Duration::from_secs(5));
    start(&a, NodeRole::Coordinator).await;
    start(&b, NodeRole::Participant).await;
    start(&c, NodeRole::Participant).await;

    // Capabilities travel through join requests and topology updates
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        b.snapshot().node("node-c").and_then(|n| n.metadata.get("priority").cloned()),
        Some("10".to_string())
    );

    network.silence("node-a");
    c.wait_for_role(NodeRole::Coordinator, Duration::from_secs(4)).await.unwrap();
    let mut b_state = b.watch();
    tokio::time::timeout(
        Duration::from_secs(4),
        b_state.wait_for(|s| {
            s.coordinator_id.as_deref() == Some("node-c") && s.role == NodeRole::Participant
        }),
    )
    .await
    .unwrap()
    .unwrap();

    network.restore("node-a");
    for node in [&c, &b, &a] {
        node.leave().await.unwrap();
    }
}

/// The group's single coordinator once every member follows it
fn settled_leader(nodes: &[CoordinationNode]) -> Option<String> {
    let coordinators: Vec<&str> = nodes
        .iter()
        .filter(|n| n.is_coordinator())
        .map(|n| n.node_id())
        .collect();
    if coordinators.len() != 1 {
        return None;
    }
    let leader = coordinators[0];
    nodes
        .iter()
        .all(|n| n.role().is_member() && n.coordinator_id().as_deref() == Some(leader))
        .then(|| leader.to_string())
}

#[tokio::test]
async fn test_simultaneous_start_converges_on_one_coordinator() {
    let network = SimNetwork::new();
    let nodes: Vec<CoordinationNode> = ["node-a", "node-b", "node-c"]
        .into_iter()
        .map(|id| founder(&network, id))
        .collect();
    for node in &nodes {
        node.join().await.unwrap();
    }

    let leader = tokio::time::timeout(Duration::from_secs(6), async {
        loop {
            if let Some(leader) = settled_leader(&nodes) {
                return leader;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("group converged");

    // Still one coordinator after further cleanup passes
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(settled_leader(&nodes), Some(leader.clone()));
    let coordinator = nodes.iter().find(|n| n.node_id() == leader).unwrap();
    assert_eq!(coordinator.nodes().len(), 3);

    for node in nodes.iter().rev() {
        node.leave().await.unwrap();
    }
}

fn motion_protocol() -> ProtocolConfig {
    ProtocolConfig::new(
        "motion",
        "Motion capture",
        vec![
            StreamLayerConfig::new(
                "motion",
                "Motion",
                StreamConfig::new("strata_motion", "Motion", 3, 100.0, ChannelFormat::Float32),
            )
            .pausable(true),
        ],
    )
}

async fn coordinated_pair(network: &SimNetwork) -> (MultiLayerCoordinator, MultiLayerCoordinator) {
    let a = Arc::new(founder(network, "node-a"));
    let a = MultiLayerCoordinator::new(a, motion_protocol()).unwrap();
    a.initialize().await.unwrap();
    a.wait_until_ready(Duration::from_secs(3)).await.unwrap();

    let b = Arc::new(joiner(network, "node-b"));
    let b = MultiLayerCoordinator::new(b, motion_protocol()).unwrap();
    b.initialize().await.unwrap();
    b.wait_until_ready(Duration::from_secs(3)).await.unwrap();
    (a, b)
}

/// Keep publishing from `from` until `rx` sees a sample from it
async fn deliver(
    from: &MultiLayerCoordinator,
    rx: &mut tokio::sync::broadcast::Receiver<CoordinationEvent>,
    data: SampleData,
    within: Duration,
) -> Option<(String, SampleData)> {
    let sender = from.node().node_id().to_string();
    let attempt = async {
        loop {
            from.send_layer_data("motion", data.clone()).await.unwrap();
            let wait = tokio::time::timeout(Duration::from_millis(50), async {
                loop {
                    match rx.recv().await {
                        Ok(CoordinationEvent::LayerData {
                            source_node_id,
                            data,
                            ..
                        }) if source_node_id == sender => {
                            return Some((source_node_id, data));
                        }
                        Ok(_) => continue,
                        Err(_) => return None,
                    }
                }
            });
            if let Ok(Some(found)) = wait.await {
                return found;
            }
        }
    };
    tokio::time::timeout(within, attempt).await.ok()
}

#[tokio::test]
async fn test_layer_samples_reach_peer() {
    let network = SimNetwork::new();
    let (a, b) = coordinated_pair(&network).await;
    assert_eq!(b.node().role(), NodeRole::Participant);
    assert_eq!(b.layer_ids().await, vec!["motion".to_string()]);

    let mut b_events = b.subscribe();
    let sample = SampleData::Float32(vec![0.25, -1.5, 3.0]);
    let (source, data) = deliver(&a, &mut b_events, sample.clone(), Duration::from_secs(2))
        .await
        .expect("sample from node-a");
    assert_eq!(source, "node-a");
    assert_eq!(data, sample);

    // The coordinator also receives from the participant once its inlet is resynced
    let mut a_events = a.subscribe();
    let reply = SampleData::Float32(vec![1.0, 2.0, 3.0]);
    let (source, _) = deliver(&b, &mut a_events, reply, Duration::from_secs(2))
        .await
        .expect("sample from node-b");
    assert_eq!(source, "node-b");

    b.dispose().await.unwrap();
    a.dispose().await.unwrap();
    assert_eq!(network.stats().live_outlets, 0);
}

#[tokio::test]
async fn test_paused_layer_resumes_without_rediscovery() {
    let network = SimNetwork::new();
    let (a, b) = coordinated_pair(&network).await;
    let mut b_events = b.subscribe();
    deliver(&a, &mut b_events, SampleData::Float32(vec![0.0; 3]), Duration::from_secs(2))
        .await
        .expect("layer connected");
    let mut a_events = a.subscribe();
    deliver(&b, &mut a_events, SampleData::Float32(vec![0.0; 3]), Duration::from_secs(2))
        .await
        .expect("reverse direction connected");

    b.pause_layer("motion").await.unwrap();
    let inlets_before = network.stats().inlets_created;
    // Let any in-flight samples drain before checking for silence
    tokio::time::sleep(Duration::from_millis(50)).await;
    while b_events.try_recv().is_ok() {}

    a.send_layer_data("motion", SampleData::Float32(vec![9.0; 3])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let leaked = std::iter::from_fn(|| b_events.try_recv().ok())
        .any(|e| matches!(e, CoordinationEvent::LayerData { .. }));
    assert!(!leaked);
    assert!(b.layer_stats().await[0].paused);
    assert_eq!(b.layer_stats().await[0].inlets, 1);

    b.resume_layer("motion").await.unwrap();
    let sample = SampleData::Float32(vec![7.0; 3]);
    let resumed = deliver(&a, &mut b_events, sample, Duration::from_secs(2)).await;
    assert!(resumed.is_some());
    assert_eq!(network.stats().inlets_created, inlets_before);

    b.dispose().await.unwrap();
    a.dispose().await.unwrap();
}
