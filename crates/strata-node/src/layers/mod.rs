//! Data layers.
//!
//! A protocol declares several independent layers besides coordination. Each
//! layer gets its own stream name and a `{layer_id}_{node_id}` source id per
//! node, so discovery can select exactly the peers relevant to that layer.
//! Regular layers are polled every 10ms; critical layers run on the
//! high-frequency worker threads.

mod coordinator;
mod high_frequency;
mod inlets;
mod manager;

pub use coordinator::MultiLayerCoordinator;
pub use high_frequency::{precise_sleep_until, HighFrequencyLayer, OutletCounters, PollMetrics};
pub use inlets::{wanted_sources, InletPool, PoolChange};
pub use manager::LayerManager;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-layer counters
#[derive(Default)]
pub struct LayerStats {
    pub samples_sent: AtomicU64,
    pub samples_received: AtomicU64,
    /// Sends swallowed while paused
    pub samples_discarded: AtomicU64,
    pub send_errors: AtomicU64,
    /// Failed pulls and poll deadline overruns
    pub drops: AtomicU64,
    pub inlets: AtomicU64,
}

impl LayerStats {
    pub fn snapshot(&self, layer_id: &str, paused: bool) -> LayerStatsSnapshot {
        LayerStatsSnapshot {
            layer_id: layer_id.to_string(),
            samples_sent: self.samples_sent.load(Ordering::Relaxed),
            samples_received: self.samples_received.load(Ordering::Relaxed),
            samples_discarded: self.samples_discarded.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            inlets: self.inlets.load(Ordering::Relaxed),
            paused,
        }
    }
}

/// Snapshot of layer counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LayerStatsSnapshot {
    pub layer_id: String,
    pub samples_sent: u64,
    pub samples_received: u64,
    pub samples_discarded: u64,
    pub send_errors: u64,
    pub drops: u64,
    pub inlets: u64,
    pub paused: bool,
}
