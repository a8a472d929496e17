//! # strata-node
//!
//! Layered peer coordination over time-synchronized pub/sub streams.
//!
//! - [`coordination`]: discovery, join, heartbeats, topology and leader election
//! - [`layers`]: protocol distribution and per-layer data transports
//! - [`codec`]: wire format of coordination messages

pub mod codec;
pub mod coordination;
pub mod layers;

pub use coordination::{CoordinationNode, LeaderElectionStrategy, LowestIdElection, MetadataPriorityElection};
pub use layers::{LayerManager, MultiLayerCoordinator};
