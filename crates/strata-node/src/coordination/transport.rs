//! Coordination transport.
//!
//! Wraps one outlet on the reserved coordination stream plus one inlet per
//! discovered peer. A background receiver task polls the inlets, decodes
//! samples and hands messages to the owning node over a channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_common::constants::{
    COORDINATION_CONTENT_TYPE, COORDINATION_POLL_INTERVAL, COORDINATION_SOURCE_PREFIX,
    COORDINATION_STREAM_NAME,
};
use strata_common::{
    ChannelFormat, CoordinationMessage, Result, StrataError, StreamInfo, StreamInlet,
    StreamOutlet, StreamProvider, StreamQuery,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::codec;

/// Upper bound on how long peers wait to be discovered
const MAX_REDISCOVERY_INTERVAL: Duration = Duration::from_millis(500);

/// How long `close` waits for the receiver task
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

const INBOX_CAPACITY: usize = 1024;

/// Source id of a node's coordination outlet
pub fn coordination_source_id(node_id: &str) -> String {
    format!("{COORDINATION_SOURCE_PREFIX}{node_id}")
}

/// Transport counters
#[derive(Default)]
pub struct TransportStats {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub decode_errors: AtomicU64,
    pub peers: AtomicU64,
}

/// Snapshot of transport counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub decode_errors: u64,
    pub peers: u64,
}

/// Message pipe over the coordination stream
pub struct CoordinationTransport {
    node_id: String,
    outlet: Box<dyn StreamOutlet>,
    inbox: mpsc::Receiver<CoordinationMessage>,
    shutdown: broadcast::Sender<()>,
    receiver: Option<JoinHandle<()>>,
    stats: Arc<TransportStats>,
}

impl CoordinationTransport {
    /// Create the outlet and start receiving from peers
    pub fn open(
        provider: Arc<dyn StreamProvider>,
        node_id: &str,
        rediscovery_interval: Duration,
        receive_own: bool,
    ) -> Result<Self> {
        let source_id = coordination_source_id(node_id);
        let info = StreamInfo::new(
            COORDINATION_STREAM_NAME,
            COORDINATION_CONTENT_TYPE,
            1,
            0.0,
            ChannelFormat::String,
            source_id.clone(),
        );
        let outlet = provider.create_outlet(
            info,
            0,
            strata_common::constants::coordination::BUFFER_SIZE,
        )?;

        let (inbox_tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);
        let stats = Arc::new(TransportStats::default());

        let receiver = CoordinationReceiver {
            provider,
            own_source_id: source_id,
            receive_own,
            inlets: HashMap::new(),
            inbox: inbox_tx,
            stats: stats.clone(),
        };
        let task = tokio::spawn(receiver.run(
            rediscovery_interval.min(MAX_REDISCOVERY_INTERVAL),
            shutdown.subscribe(),
        ));

        tracing::debug!(node = %node_id, "Coordination transport open");

        Ok(Self {
            node_id: node_id.to_string(),
            outlet,
            inbox,
            shutdown,
            receiver: Some(task),
            stats,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Broadcast one message to every peer
    pub fn send(&self, message: &CoordinationMessage) -> Result<()> {
        let sample = codec::to_sample(message)?;
        self.outlet.push(sample)?;
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Next message from any peer; `None` once the receiver stopped
    pub async fn recv(&mut self) -> Option<CoordinationMessage> {
        self.inbox.recv().await
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            sent: self.stats.sent.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
            decode_errors: self.stats.decode_errors.load(Ordering::Relaxed),
            peers: self.stats.peers.load(Ordering::Relaxed),
        }
    }

    /// Stop the receiver, then destroy inlets and the outlet
    pub async fn close(mut self) {
        let _ = self.shutdown.send(());
        if let Some(task) = self.receiver.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                tracing::warn!(node = %self.node_id, "Coordination receiver did not stop in time");
            }
        }
        tracing::debug!(node = %self.node_id, "Coordination transport closed");
    }
}

impl Drop for CoordinationTransport {
    fn drop(&mut self) {
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
    }
}

/// Receiver task state; owns every coordination inlet
struct CoordinationReceiver {
    provider: Arc<dyn StreamProvider>,
    own_source_id: String,
    receive_own: bool,
    inlets: HashMap<String, Box<dyn StreamInlet>>,
    inbox: mpsc::Sender<CoordinationMessage>,
    stats: Arc<TransportStats>,
}

impl CoordinationReceiver {
    async fn run(mut self, rediscovery: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut poll = tokio::time::interval(COORDINATION_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut discover = tokio::time::interval(rediscovery);
        discover.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = discover.tick() => self.discover_peers().await,
                _ = poll.tick() => {
                    if !self.poll_inlets().await {
                        break;
                    }
                }
            }
        }

        self.inlets.clear();
    }

    async fn discover_peers(&mut self) {
        let provider = self.provider.clone();
        let query = StreamQuery::by_name(COORDINATION_STREAM_NAME)
            .with_source_prefix(COORDINATION_SOURCE_PREFIX);
        let found = tokio::task::spawn_blocking(move || {
            provider.discover_streams(&query, Duration::ZERO, 0)
        })
        .await
        .map_err(|e| StrataError::Transport(e.to_string()))
        .and_then(|r| r);

        let streams = match found {
            Ok(streams) => streams,
            Err(e) => {
                tracing::warn!(error = %e, "Coordination discovery failed");
                return;
            }
        };

        for info in streams {
            if self.inlets.contains_key(&info.source_id) {
                continue;
            }
            if info.source_id == self.own_source_id && !self.receive_own {
                continue;
            }
            match self.provider.create_inlet(&info, 360, 0, false) {
                Ok(inlet) => {
                    tracing::debug!(source_id = %info.source_id, "Coordination inlet opened");
                    self.inlets.insert(info.source_id.clone(), inlet);
                }
                Err(e) => {
                    tracing::debug!(source_id = %info.source_id, error = %e, "Coordination inlet unavailable");
                }
            }
        }
        self.stats
            .peers
            .store(self.inlets.len() as u64, Ordering::Relaxed);
    }

    /// Drain every inlet; returns false once the owner dropped the inbox
    async fn poll_inlets(&mut self) -> bool {
        let mut lost = Vec::new();
        let mut messages = Vec::new();

        for (source_id, inlet) in self.inlets.iter_mut() {
            loop {
                match inlet.pull(Duration::ZERO) {
                    Ok(Some(sample)) => match codec::from_sample(&sample.data) {
                        Ok(message) => messages.push(message),
                        Err(e) => {
                            self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(source_id = %source_id, error = %e, "Undecodable coordination sample");
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(source_id = %source_id, error = %e, "Coordination peer lost");
                        lost.push(source_id.clone());
                        break;
                    }
                }
            }
        }

        for source_id in lost {
            self.inlets.remove(&source_id);
        }

        for message in messages {
            self.stats.received.fetch_add(1, Ordering::Relaxed);
            if self.inbox.send(message).await.is_err() {
                return false;
            }
        }
        true
    }
}
