//! Coordination layer: membership, heartbeats, topology and leader election.
//!
//! Nodes talk over one reserved string stream. Every node publishes a single
//! outlet on it and subscribes to the outlets of every peer it discovers, so
//! each message is effectively broadcast to the whole group.

mod election;
mod node;
mod transport;

pub use election::{ElectionContext, ElectionReason, LeaderElectionStrategy, LowestIdElection, MetadataPriorityElection};
pub use node::{generate_node_id, CoordinationNode, NodeStats, NodeStatsSnapshot};
pub use transport::{coordination_source_id, CoordinationTransport, TransportStats, TransportStatsSnapshot};
