//! Core types shared across Strata components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::stream::SampleData;

/// Free-form key/value map (capabilities, node metadata)
pub type Metadata = BTreeMap<String, String>;

/// Role of a node inside the coordination group
///
/// - Disconnected: not part of any group (initial and post-leave state)
/// - Discovering: looking for a coordinator to join
/// - Participant: admitted member of a group
/// - Coordinator: admits members and broadcasts topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Disconnected,
    Discovering,
    Participant,
    Coordinator,
}

impl NodeRole {
    /// Returns true once the node settled inside a group
    pub fn is_member(&self) -> bool {
        matches!(self, Self::Participant | Self::Coordinator)
    }
}

impl Default for NodeRole {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Discovering => "discovering",
            Self::Participant => "participant",
            Self::Coordinator => "coordinator",
        };
        f.write_str(name)
    }
}

/// A peer as seen by the local node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkNode {
    /// Unique, stable node identifier
    pub node_id: String,

    /// Human readable name
    pub node_name: String,

    /// Last known role
    pub role: NodeRole,

    /// Local monotonic clock (seconds) when we last heard from this node
    pub last_seen: f64,

    /// Opaque metadata (capabilities advertised by the node)
    #[serde(default)]
    pub metadata: Metadata,
}

impl NetworkNode {
    pub fn new(node_id: impl Into<String>, node_name: impl Into<String>, role: NodeRole) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            role,
            last_seen: 0.0,
            metadata: Metadata::new(),
        }
    }

    pub fn with_last_seen(mut self, last_seen: f64) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Seconds since this node was last heard from
    pub fn age(&self, now: f64) -> f64 {
        now - self.last_seen
    }
}

/// Status carried by heartbeats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatStatus {
    pub role: NodeRole,
    pub known_nodes: usize,
}

/// Message exchanged on the coordination stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationMessage {
    /// Unique per sender
    pub message_id: String,
    pub sender_id: String,
    /// Sender's local clock (seconds)
    pub timestamp: f64,
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Type-specific part of a coordination message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Discovery {
        node_name: String,
        role: NodeRole,
        #[serde(default)]
        capabilities: Metadata,
    },
    JoinRequest {
        node_name: String,
        #[serde(default)]
        capabilities: Metadata,
    },
    JoinResponse {
        /// Node the response is addressed to (the stream is broadcast)
        target_id: String,
        accepted: bool,
        #[serde(default)]
        current_nodes: Vec<NetworkNode>,
    },
    Heartbeat {
        status: HeartbeatStatus,
    },
    TopologyUpdate {
        nodes: Vec<NetworkNode>,
    },
    Application {
        application_type: String,
        payload: serde_json::Value,
    },
    /// Message type this build does not understand
    #[serde(other)]
    Unknown,
}

impl CoordinationMessage {
    pub fn new(
        message_id: impl Into<String>,
        sender_id: impl Into<String>,
        timestamp: f64,
        body: MessageBody,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            sender_id: sender_id.into(),
            timestamp,
            body,
        }
    }

    /// Wire name of the message type
    pub fn message_type(&self) -> &'static str {
        match self.body {
            MessageBody::Discovery { .. } => "discovery",
            MessageBody::JoinRequest { .. } => "join_request",
            MessageBody::JoinResponse { .. } => "join_response",
            MessageBody::Heartbeat { .. } => "heartbeat",
            MessageBody::TopologyUpdate { .. } => "topology_update",
            MessageBody::Application { .. } => "application",
            MessageBody::Unknown => "unknown",
        }
    }
}

/// Event emitted to subscribers of a node or multi-layer coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinationEvent {
    RoleChanged {
        old: NodeRole,
        new: NodeRole,
    },
    NodeJoined {
        node_id: String,
        node_name: String,
        timestamp: DateTime<Utc>,
    },
    NodeLeft {
        node_id: String,
        timestamp: DateTime<Utc>,
    },
    TopologyChanged {
        nodes: Vec<NetworkNode>,
        coordinator_id: Option<String>,
    },
    Application {
        sender_id: String,
        application_type: String,
        data: serde_json::Value,
    },
    LayerData {
        layer_id: String,
        source_node_id: String,
        data: SampleData,
        /// Sample time mapped onto the local clock where an offset is known
        timestamp: f64,
    },
}

/// Read-only view of a node's membership state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub role: NodeRole,
    pub coordinator_id: Option<String>,
    pub nodes: Vec<NetworkNode>,
}

impl NodeSnapshot {
    pub fn node(&self, node_id: &str) -> Option<&NetworkNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&NodeRole::Coordinator).unwrap(), r#""coordinator""#);
        assert_eq!(NodeRole::default(), NodeRole::Disconnected);
        assert!(NodeRole::Participant.is_member());
        assert!(!NodeRole::Discovering.is_member());
    }

    #[test]
    fn test_message_flat_wire_shape() {
        let msg = CoordinationMessage::new(
            "node-1-7",
            "node-1",
            12.5,
            MessageBody::Heartbeat {
                status: HeartbeatStatus {
                    role: NodeRole::Participant,
                    known_nodes: 3,
                },
            },
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["sender_id"], "node-1");
        assert_eq!(value["status"]["known_nodes"], 3);
        assert_eq!(msg.message_type(), "heartbeat");
    }

    #[test]
    fn test_unknown_message_type() {
        let raw = r#"{"message_id":"x-1","sender_id":"x","timestamp":1.0,"type":"vote","term":4}"#;
        let msg: CoordinationMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.body, MessageBody::Unknown);
        assert_eq!(msg.sender_id, "x");
    }

    #[test]
    fn test_node_age() {
        let node = NetworkNode::new("a", "A", NodeRole::Participant).with_last_seen(10.0);
        assert_eq!(node.age(12.5), 2.5);
    }
}
