//! Layer manager: one instance per data layer of the active protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use strata_common::constants::{LAYER_POLL_INTERVAL, LAYER_RESYNC_INTERVAL};
use strata_common::{
    CoordinationEvent, NetworkNode, Result, SampleData, StrataError, StreamInfo,
    StreamLayerConfig, StreamOutlet, StreamProvider,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::high_frequency::{HighFrequencyLayer, PollMetrics};
use super::inlets::{wanted_sources, InletPool};
use super::{LayerStats, LayerStatsSnapshot};

/// Samples drained from one inlet per poll tick
const MAX_PULLS_PER_TICK: usize = 64;

/// Regular layer: owner-held outlet plus a 10ms poll task over the inlets
struct PolledLayer {
    outlet: Option<Box<dyn StreamOutlet>>,
    pool: Arc<Mutex<InletPool>>,
    paused: Arc<AtomicBool>,
    shutdown: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

enum Backend {
    Polled(PolledLayer),
    HighFrequency(HighFrequencyLayer),
}

pub struct LayerManager {
    config: StreamLayerConfig,
    node_id: String,
    provider: Arc<dyn StreamProvider>,
    events: broadcast::Sender<CoordinationEvent>,
    stats: Arc<LayerStats>,
    paused: bool,
    backend: Option<Backend>,
}

impl LayerManager {
    pub fn new(
        config: StreamLayerConfig,
        node_id: impl Into<String>,
        provider: Arc<dyn StreamProvider>,
        events: broadcast::Sender<CoordinationEvent>,
    ) -> Self {
        Self {
            config,
            node_id: node_id.into(),
            provider,
            events,
            stats: Arc::new(LayerStats::default()),
            paused: false,
            backend: None,
        }
    }

    pub fn layer_id(&self) -> &str {
        &self.config.layer_id
    }

    pub fn config(&self) -> &StreamLayerConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Create the outlet and start receiving
    pub async fn initialize(&mut self) -> Result<()> {
        if self.backend.is_some() {
            return Ok(());
        }

        let backend = if self.config.uses_high_frequency() {
            let layer = HighFrequencyLayer::start(
                &self.config,
                &self.node_id,
                self.provider.clone(),
                self.events.clone(),
                self.stats.clone(),
            )
            .await?;
            Backend::HighFrequency(layer)
        } else {
            Backend::Polled(self.start_polled()?)
        };

        tracing::info!(
            layer = %self.config.layer_id,
            node = %self.node_id,
            high_frequency = self.config.uses_high_frequency(),
            outlet = self.config.requires_outlet,
            "Layer initialized"
        );
        self.backend = Some(backend);
        Ok(())
    }

    fn start_polled(&self) -> Result<PolledLayer> {
        let outlet = if self.config.requires_outlet {
            let stream = &self.config.stream_config;
            let info = StreamInfo::new(
                &stream.name,
                &stream.content_type,
                stream.channel_count,
                stream.sample_rate,
                stream.channel_format,
                self.config.source_id_for(&self.node_id),
            );
            Some(
                self.provider
                    .create_outlet(info, stream.chunk_size, stream.buffer_size)?,
            )
        } else {
            None
        };

        let pool = Arc::new(Mutex::new(InletPool::new(
            self.config.clone(),
            self.provider.clone(),
        )));
        let paused = Arc::new(AtomicBool::new(false));
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(poll_loop(
            self.config.clone(),
            pool.clone(),
            paused.clone(),
            self.events.clone(),
            self.stats.clone(),
            shutdown_rx,
        ));

        Ok(PolledLayer {
            outlet,
            pool,
            paused,
            shutdown,
            task: Some(task),
        })
    }

    /// Reconcile inlets with the current topology; repeated calls with the
    /// same nodes change nothing
    pub fn update_known_nodes(&self, nodes: &[NetworkNode], coordinator_id: Option<&str>) -> Result<()> {
        let wanted = wanted_sources(&self.config, &self.node_id, nodes, coordinator_id);
        match &self.backend {
            Some(Backend::Polled(polled)) => {
                let mut pool = polled.pool.lock().unwrap_or_else(PoisonError::into_inner);
                let change = pool.set_wanted(wanted);
                self.stats.inlets.store(pool.len() as u64, Ordering::Relaxed);
                if change.opened > 0 || change.closed > 0 {
                    tracing::debug!(
                        layer = %self.config.layer_id,
                        opened = change.opened,
                        closed = change.closed,
                        pending = pool.pending(),
                        "Layer inlets updated"
                    );
                }
                Ok(())
            }
            Some(Backend::HighFrequency(hf)) => hf.update_peers(wanted),
            None => Err(StrataError::InvalidState(format!(
                "layer '{}' is not initialized",
                self.config.layer_id
            ))),
        }
    }

    /// Publish one sample on this node's outlet
    pub fn send_data(&self, data: SampleData) -> Result<()> {
        if !self.config.requires_outlet {
            return Err(StrataError::NoOutlet(self.config.layer_id.clone()));
        }
        let stream = &self.config.stream_config;
        if data.format() != stream.channel_format || data.channel_count() != stream.channel_count {
            return Err(StrataError::Transport(format!(
                "layer '{}' expects {:?} x{}, got {:?} x{}",
                self.config.layer_id,
                stream.channel_format,
                stream.channel_count,
                data.format(),
                data.channel_count()
            )));
        }

        match &self.backend {
            Some(Backend::Polled(polled)) => {
                let outlet = polled
                    .outlet
                    .as_ref()
                    .ok_or_else(|| StrataError::NoOutlet(self.config.layer_id.clone()))?;
                match outlet.push(data) {
                    Ok(()) => {
                        self.stats.samples_sent.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(e) => {
                        self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                        Err(e)
                    }
                }
            }
            Some(Backend::HighFrequency(hf)) => hf.send(data),
            None => Err(StrataError::InvalidState(format!(
                "layer '{}' is not initialized",
                self.config.layer_id
            ))),
        }
    }

    /// Stop emitting layer data; inlets stay open
    pub fn pause(&mut self) -> Result<()> {
        self.set_paused(true)
    }

    pub fn resume(&mut self) -> Result<()> {
        self.set_paused(false)
    }

    fn set_paused(&mut self, paused: bool) -> Result<()> {
        if !self.config.is_pausable {
            return Err(StrataError::NotPausable(self.config.layer_id.clone()));
        }
        match &self.backend {
            Some(Backend::Polled(polled)) => polled.paused.store(paused, Ordering::Relaxed),
            Some(Backend::HighFrequency(hf)) if paused => hf.pause()?,
            Some(Backend::HighFrequency(hf)) => hf.resume()?,
            None => {}
        }
        self.paused = paused;
        tracing::info!(layer = %self.config.layer_id, paused, "Layer pause state changed");
        Ok(())
    }

    /// Stop polling, close inlets, destroy the outlet
    pub async fn dispose(&mut self) {
        match self.backend.take() {
            Some(Backend::Polled(mut polled)) => {
                let _ = polled.shutdown.send(());
                if let Some(task) = polled.task.take() {
                    let _ = task.await;
                }
                polled
                    .pool
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
                drop(polled.outlet.take());
            }
            Some(Backend::HighFrequency(mut hf)) => hf.shutdown().await,
            None => return,
        }
        self.stats.inlets.store(0, Ordering::Relaxed);
        tracing::info!(layer = %self.config.layer_id, "Layer disposed");
    }

    /// Latest metrics window of a high-frequency layer
    pub fn poll_metrics(&self) -> Option<PollMetrics> {
        match &self.backend {
            Some(Backend::HighFrequency(hf)) => hf.metrics(),
            _ => None,
        }
    }

    pub fn stats(&self) -> LayerStatsSnapshot {
        self.stats.snapshot(&self.config.layer_id, self.paused)
    }
}

impl Drop for LayerManager {
    fn drop(&mut self) {
        if let Some(Backend::Polled(polled)) = &mut self.backend {
            if let Some(task) = polled.task.take() {
                task.abort();
            }
        }
    }
}

async fn poll_loop(
    layer: StreamLayerConfig,
    pool: Arc<Mutex<InletPool>>,
    paused: Arc<AtomicBool>,
    events: broadcast::Sender<CoordinationEvent>,
    stats: Arc<LayerStats>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut poll = tokio::time::interval(LAYER_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut resync = tokio::time::interval(LAYER_RESYNC_INTERVAL);
    resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = resync.tick() => {
                let mut pool = pool.lock().unwrap_or_else(PoisonError::into_inner);
                if pool.connect_missing() > 0 {
                    tracing::debug!(layer = %layer.layer_id, inlets = pool.len(), "Layer inlets resynced");
                }
                stats.inlets.store(pool.len() as u64, Ordering::Relaxed);
            }
            _ = poll.tick() => {
                if paused.load(Ordering::Relaxed) {
                    continue;
                }
                let sweep = pool
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .sweep(MAX_PULLS_PER_TICK);
                if sweep.failed > 0 {
                    stats.drops.fetch_add(sweep.failed as u64, Ordering::Relaxed);
                }
                for (source_id, sample) in sweep.samples {
                    stats.samples_received.fetch_add(1, Ordering::Relaxed);
                    let source_node_id = layer
                        .node_id_from_source(&source_id)
                        .unwrap_or(source_id.as_str())
                        .to_string();
                    let _ = events.send(CoordinationEvent::LayerData {
                        layer_id: layer.layer_id.clone(),
                        source_node_id,
                        data: sample.data,
                        timestamp: sample.timestamp,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use strata_common::{ChannelFormat, LayerPriority, NodeRole, StreamConfig};
    use strata_sim::SimNetwork;
    use tokio_test::assert_ok;

    fn motion_layer() -> StreamLayerConfig {
        StreamLayerConfig::new(
            "motion",
            "Motion",
            StreamConfig::new("strata_motion", "Motion", 3, 100.0, ChannelFormat::Float32),
        )
        .pausable(true)
    }

    fn topology() -> Vec<NetworkNode> {
        vec![
            NetworkNode::new("node-a", "A", NodeRole::Coordinator),
            NetworkNode::new("node-b", "B", NodeRole::Participant),
        ]
    }

    async fn pair(network: &SimNetwork, layer: StreamLayerConfig) -> (LayerManager, LayerManager, broadcast::Receiver<CoordinationEvent>) {
        let (a_events, _) = broadcast::channel(64);
        let (b_events, b_rx) = broadcast::channel(64);
        let mut a = LayerManager::new(layer.clone(), "node-a", Arc::new(network.endpoint()), a_events);
        let mut b = LayerManager::new(layer, "node-b", Arc::new(network.endpoint()), b_events);
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();
        a.update_known_nodes(&topology(), Some("node-a")).unwrap();
        b.update_known_nodes(&topology(), Some("node-a")).unwrap();
        (a, b, b_rx)
    }

    async fn next_data(rx: &mut broadcast::Receiver<CoordinationEvent>, wait: Duration) -> Option<(String, SampleData)> {
        let event = tokio::time::timeout(wait, rx.recv()).await.ok()?.ok()?;
        match event {
            CoordinationEvent::LayerData { source_node_id, data, .. } => Some((source_node_id, data)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_delivers_samples_between_nodes() {
        let network = SimNetwork::new();
        let (mut a, mut b, mut rx) = pair(&network, motion_layer()).await;

        a.send_data(SampleData::Float32(vec![0.1, 0.2, 0.3])).unwrap();
        let (source, data) = next_data(&mut rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(source, "node-a");
        assert_eq!(data, SampleData::Float32(vec![0.1, 0.2, 0.3]));

        let stats = b.stats();
        assert_eq!(stats.samples_received, 1);
        assert_eq!(stats.inlets, 1);
        assert_eq!(a.stats().samples_sent, 1);

        a.dispose().await;
        b.dispose().await;
        assert_eq!(network.stats().live_outlets, 0);
    }

    #[tokio::test]
    async fn test_send_validates_shape_and_outlet() {
        let network = SimNetwork::new();
        let mut layer = motion_layer();
        let mut a = LayerManager::new(layer.clone(), "node-a", Arc::new(network.endpoint()), broadcast::channel(8).0);
        assert!(matches!(a.send_data(SampleData::Float32(vec![0.0; 3])), Err(StrataError::InvalidState(_))));
        a.initialize().await.unwrap();
        assert!(a.send_data(SampleData::Float32(vec![0.0; 2])).is_err());
        assert_ok!(a.send_data(SampleData::Float32(vec![0.0; 3])));
        a.dispose().await;

        layer.requires_outlet = false;
        let mut listener = LayerManager::new(layer, "node-c", Arc::new(network.endpoint()), broadcast::channel(8).0);
        listener.initialize().await.unwrap();
        assert!(matches!(listener.send_data(SampleData::Float32(vec![0.0; 3])), Err(StrataError::NoOutlet(_))));
        listener.dispose().await;
    }

    #[tokio::test]
    async fn test_pause_keeps_inlets() {
        let network = SimNetwork::new();
        let (mut a, mut b, mut rx) = pair(&network, motion_layer()).await;
        let inlets_created = network.stats().inlets_created;

        b.pause().unwrap();
        assert!(b.is_paused());
        a.send_data(SampleData::Float32(vec![1.0, 1.0, 1.0])).unwrap();
        assert!(next_data(&mut rx, Duration::from_millis(100)).await.is_none());
        assert_eq!(b.stats().inlets, 1);

        b.resume().unwrap();
        a.send_data(SampleData::Float32(vec![2.0, 2.0, 2.0])).unwrap();
        assert!(next_data(&mut rx, Duration::from_secs(1)).await.is_some());
        assert_eq!(network.stats().inlets_created, inlets_created);
        assert_eq!(network.stats().inlets_closed, 0);

        a.dispose().await;
        b.dispose().await;
    }

    #[tokio::test]
    async fn test_non_pausable_layer() {
        let network = SimNetwork::new();
        let layer = motion_layer().pausable(false);
        let mut a = LayerManager::new(layer, "node-a", Arc::new(network.endpoint()), broadcast::channel(8).0);
        a.initialize().await.unwrap();
        assert!(matches!(a.pause(), Err(StrataError::NotPausable(_))));
        assert!(!a.is_paused());
        a.dispose().await;
    }

    #[tokio::test]
    async fn test_update_known_nodes_is_idempotent() {
        let network = SimNetwork::new();
        let (mut a, mut b, _rx) = pair(&network, motion_layer()).await;
        let before = network.stats();

        b.update_known_nodes(&topology(), Some("node-a")).unwrap();
        a.update_known_nodes(&topology(), Some("node-a")).unwrap();
        let after = network.stats();
        assert_eq!(after.inlets_created, before.inlets_created);
        assert_eq!(after.inlets_closed, before.inlets_closed);

        // Peer leaves: its inlet is closed
        b.update_known_nodes(&topology()[1..], Some("node-a")).unwrap();
        assert_eq!(b.stats().inlets, 0);

        a.dispose().await;
        b.dispose().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_critical_layer_uses_high_frequency() {
        let network = SimNetwork::new();
        let layer = motion_layer().with_priority(LayerPriority::Critical);
        let (mut a, mut b, mut rx) = pair(&network, layer).await;
        assert!(b.poll_metrics().is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        a.send_data(SampleData::Float32(vec![4.0, 5.0, 6.0])).unwrap();
        let (source, data) = next_data(&mut rx, Duration::from_secs(2)).await.unwrap();
        assert_eq!(source, "node-a");
        assert_eq!(data, SampleData::Float32(vec![4.0, 5.0, 6.0]));

        a.dispose().await;
        b.dispose().await;
        assert_eq!(network.stats().live_outlets, 0);
    }
}
