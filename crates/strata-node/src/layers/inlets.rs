//! Per-layer inlet bookkeeping.
//!
//! An `InletPool` tracks which peer sources a layer wants to receive from and
//! which inlets are actually open. Sources whose outlet is not published yet
//! stay pending and are retried by `connect_missing`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use strata_common::{
    NetworkNode, Result, Sample, StrataError, StreamInlet, StreamLayerConfig, StreamProvider,
    StreamQuery,
};

/// Outcome of reconciling the wanted set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolChange {
    pub opened: usize,
    pub closed: usize,
}

/// Samples pulled in one sweep over all inlets
#[derive(Debug, Default)]
pub struct Sweep {
    pub samples: Vec<(String, Sample)>,
    /// Inlets whose pull failed; they are reopened on the next resync
    pub failed: usize,
}

/// Source ids a node should hold inlets for on `layer`.
///
/// Every peer when the layer requires inlets from all; otherwise hub and
/// spoke: the coordinator receives from every participant, participants
/// only from the coordinator.
pub fn wanted_sources(
    layer: &StreamLayerConfig,
    self_id: &str,
    nodes: &[NetworkNode],
    coordinator_id: Option<&str>,
) -> BTreeSet<String> {
    let self_is_coordinator = coordinator_id == Some(self_id);
    let mut wanted: BTreeSet<String> = nodes
        .iter()
        .map(|n| n.node_id.as_str())
        .filter(|id| *id != self_id)
        .filter(|id| {
            layer.requires_inlet_from_all || self_is_coordinator || Some(*id) == coordinator_id
        })
        .map(|id| layer.source_id_for(id))
        .collect();

    if layer.receive_own_data {
        wanted.insert(layer.source_id_for(self_id));
    }
    wanted
}

pub struct InletPool {
    layer: StreamLayerConfig,
    provider: Arc<dyn StreamProvider>,
    wanted: BTreeSet<String>,
    inlets: BTreeMap<String, Box<dyn StreamInlet>>,
}

impl InletPool {
    pub fn new(layer: StreamLayerConfig, provider: Arc<dyn StreamProvider>) -> Self {
        Self {
            layer,
            provider,
            wanted: BTreeSet::new(),
            inlets: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inlets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inlets.is_empty()
    }

    /// Wanted sources without an open inlet
    pub fn pending(&self) -> usize {
        self.wanted
            .iter()
            .filter(|s| !self.inlets.contains_key(*s))
            .count()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.inlets.keys().cloned().collect()
    }

    /// Close inlets no longer wanted and open the newly wanted ones
    pub fn set_wanted(&mut self, wanted: BTreeSet<String>) -> PoolChange {
        let before = self.inlets.len();
        self.inlets.retain(|source, _| wanted.contains(source));
        let closed = before - self.inlets.len();
        if closed > 0 {
            tracing::debug!(layer = %self.layer.layer_id, closed, "Closed inlets for departed peers");
        }

        self.wanted = wanted;
        let opened = self.connect_missing();
        PoolChange { opened, closed }
    }

    /// Try to open inlets for every pending source; returns how many opened
    pub fn connect_missing(&mut self) -> usize {
        if self.pending() == 0 {
            return 0;
        }

        let query = StreamQuery::by_name(&self.layer.stream_config.name)
            .with_source_prefix(self.layer.source_prefix());
        let found = match self.provider.discover_streams(&query, Duration::ZERO, 0) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(layer = %self.layer.layer_id, error = %e, "Layer discovery failed");
                return 0;
            }
        };

        let mut opened = 0;
        for info in found {
            if !self.wanted.contains(&info.source_id) || self.inlets.contains_key(&info.source_id) {
                continue;
            }
            let stream = &self.layer.stream_config;
            match self
                .provider
                .create_inlet(&info, stream.buffer_size, stream.chunk_size, false)
            {
                Ok(inlet) => {
                    tracing::debug!(layer = %self.layer.layer_id, source_id = %info.source_id, "Layer inlet opened");
                    self.inlets.insert(info.source_id.clone(), inlet);
                    opened += 1;
                }
                Err(e) => {
                    tracing::debug!(layer = %self.layer.layer_id, source_id = %info.source_id, error = %e, "Layer inlet unavailable, will retry");
                }
            }
        }
        opened
    }

    /// Drain up to `max_per_inlet` samples from every inlet without blocking
    pub fn sweep(&mut self, max_per_inlet: usize) -> Sweep {
        let mut sweep = Sweep::default();
        let mut lost = Vec::new();

        for (source_id, inlet) in self.inlets.iter_mut() {
            for _ in 0..max_per_inlet {
                match inlet.pull(Duration::ZERO) {
                    Ok(Some(sample)) => sweep.samples.push((source_id.clone(), sample)),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(layer = %self.layer.layer_id, source_id = %source_id, error = %e, "Layer inlet lost");
                        lost.push(source_id.clone());
                        break;
                    }
                }
            }
        }

        sweep.failed = lost.len();
        for source_id in lost {
            self.inlets.remove(&source_id);
        }
        sweep
    }

    /// Clock offset of one source's outlet relative to the local clock
    pub fn time_correction(&mut self, source_id: &str, timeout: Duration) -> Result<f64> {
        self.inlets
            .get_mut(source_id)
            .ok_or_else(|| StrataError::Transport(format!("no inlet for '{source_id}'")))?
            .time_correction(timeout)
    }

    pub fn clear(&mut self) {
        self.wanted.clear();
        self.inlets.clear();
    }
}
