//! High-frequency layer transport.
//!
//! Critical layers bypass the 10ms poll task and run on two dedicated OS
//! threads that share nothing with the owner except channels:
//!
//! ```text
//!  owner ──OutletCommand──▶ [producer thread] ── push ──▶ outlet
//!  owner ──InletCommand───▶ [consumer thread] ◀─ pull ─── peer inlets
//!  owner ◀─WorkerReport──── both threads (Ready, data, metrics)
//! ```
//!
//! Each thread creates its own command channel and hands the sender back in
//! a `Ready` report. The consumer runs a precise loop: coarse sleep until
//! shortly before each deadline, then spin.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use strata_common::constants::high_frequency::{
    INITIAL_OFFSET_TIMEOUT, METRICS_WINDOW, OFFSET_REFRESH_SAMPLES, REFRESH_OFFSET_TIMEOUT,
    WORKER_HANDSHAKE_TIMEOUT,
};
use strata_common::constants::LAYER_RESYNC_INTERVAL;
use strata_common::{
    CoordinationEvent, HighFrequencyConfig, Result, SampleData, StrataError, StreamInfo,
    StreamLayerConfig, StreamProvider,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::inlets::InletPool;
use super::LayerStats;

/// Samples drained from one inlet per loop iteration
const MAX_PULLS_PER_ITERATION: usize = 32;

/// Commands accepted by the producer thread
#[derive(Debug)]
pub enum OutletCommand {
    Send(SampleData),
    Pause,
    Resume,
    Shutdown,
}

/// Commands accepted by the consumer thread
#[derive(Debug)]
pub enum InletCommand {
    /// Replace the set of source ids to receive from
    UpdatePeers(BTreeSet<String>),
    Pause,
    Resume,
    Shutdown,
}

/// Producer counters, reported on every state change and metrics window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutletCounters {
    pub sent: u64,
    pub discarded: u64,
    pub failed: u64,
}

/// Consumer loop metrics over one window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PollMetrics {
    pub window: Duration,
    pub iterations: u64,
    pub samples: u64,
    /// Iterations that overran their deadline by more than one interval, plus failed pulls
    pub drops: u64,
    pub actual_frequency: f64,
    pub samples_per_second: f64,
    pub inlets: usize,
}

/// Messages from the worker threads to the owner
#[derive(Debug)]
pub enum WorkerReport {
    OutletReady(std_mpsc::Sender<OutletCommand>),
    InletReady(std_mpsc::Sender<InletCommand>),
    Data {
        source_id: String,
        data: SampleData,
        /// Remote timestamp plus the source's clock offset
        timestamp: f64,
    },
    OutletCounters(OutletCounters),
    Metrics(PollMetrics),
    Failed(String),
}

/// Sleep until `deadline`, spinning the last `threshold` when `busy_wait` is set
pub fn precise_sleep_until(deadline: Instant, threshold: Duration, busy_wait: bool) {
    let now = Instant::now();
    if deadline <= now {
        return;
    }
    let remaining = deadline - now;
    if !busy_wait {
        thread::sleep(remaining);
        return;
    }
    if remaining > threshold {
        thread::sleep(remaining - threshold);
    }
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

struct Worker<C> {
    commands: std_mpsc::Sender<C>,
    thread: thread::JoinHandle<()>,
}

/// Owner side of a critical layer's producer/consumer threads
pub struct HighFrequencyLayer {
    layer_id: String,
    outlet: Option<Worker<OutletCommand>>,
    inlet: Option<Worker<InletCommand>>,
    forwarder: Option<JoinHandle<()>>,
    metrics: Arc<Mutex<Option<PollMetrics>>>,
}

impl HighFrequencyLayer {
    /// Spawn both workers and wait for their handshakes
    pub async fn start(
        layer: &StreamLayerConfig,
        node_id: &str,
        provider: Arc<dyn StreamProvider>,
        events: broadcast::Sender<CoordinationEvent>,
        stats: Arc<LayerStats>,
    ) -> Result<Self> {
        let hf = layer.high_frequency_config();
        let (report_tx, mut reports) = mpsc::channel(hf.buffer_size.max(1));

        let outlet = if layer.requires_outlet {
            let info = StreamInfo::new(
                &layer.stream_config.name,
                &layer.stream_config.content_type,
                hf.channel_count,
                hf.target_frequency,
                hf.channel_format,
                layer.source_id_for(node_id),
            );
            let producer = Producer {
                layer_id: layer.layer_id.clone(),
                provider: provider.clone(),
                info,
                chunk_size: layer.stream_config.chunk_size,
                buffer_size: hf.buffer_size,
                reports: report_tx.clone(),
            };
            let thread = spawn_worker(format!("hf-out-{}", layer.layer_id), move || producer.run())?;
            let commands = match await_handshake(&mut reports, &layer.layer_id).await? {
                Handshake::Outlet(commands) => commands,
                Handshake::Inlet(_) => {
                    return Err(StrataError::Worker("producer sent the wrong handshake".into()));
                }
            };
            Some(Worker { commands, thread })
        } else {
            None
        };

        let consumer = Consumer {
            layer: layer.clone(),
            hf: hf.clone(),
            pool: InletPool::new(layer.clone(), provider),
            reports: report_tx,
        };
        let thread = spawn_worker(format!("hf-in-{}", layer.layer_id), move || consumer.run())?;
        let commands = match await_handshake(&mut reports, &layer.layer_id).await {
            Ok(Handshake::Inlet(commands)) => commands,
            Ok(Handshake::Outlet(_)) => {
                return Err(StrataError::Worker("consumer sent the wrong handshake".into()));
            }
            Err(e) => {
                if let Some(outlet) = &outlet {
                    let _ = outlet.commands.send(OutletCommand::Shutdown);
                }
                return Err(e);
            }
        };
        let inlet = Worker { commands, thread };

        let metrics = Arc::new(Mutex::new(None));
        let forwarder = tokio::spawn(forward_reports(
            layer.clone(),
            reports,
            events,
            stats,
            metrics.clone(),
        ));

        tracing::info!(layer = %layer.layer_id, frequency = hf.target_frequency, busy_wait = hf.use_busy_wait, "High-frequency workers ready");

        Ok(Self {
            layer_id: layer.layer_id.clone(),
            outlet,
            inlet: Some(inlet),
            forwarder: Some(forwarder),
            metrics,
        })
    }

    /// Hand a sample to the producer thread
    pub fn send(&self, data: SampleData) -> Result<()> {
        let outlet = self
            .outlet
            .as_ref()
            .ok_or_else(|| StrataError::NoOutlet(self.layer_id.clone()))?;
        outlet
            .commands
            .send(OutletCommand::Send(data))
            .map_err(|_| StrataError::Worker(format!("producer of '{}' is gone", self.layer_id)))
    }

    pub fn update_peers(&self, sources: BTreeSet<String>) -> Result<()> {
        self.command_inlet(InletCommand::UpdatePeers(sources))
    }

    pub fn pause(&self) -> Result<()> {
        if let Some(outlet) = &self.outlet {
            let _ = outlet.commands.send(OutletCommand::Pause);
        }
        self.command_inlet(InletCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        if let Some(outlet) = &self.outlet {
            let _ = outlet.commands.send(OutletCommand::Resume);
        }
        self.command_inlet(InletCommand::Resume)
    }

    /// Latest consumer metrics window
    pub fn metrics(&self) -> Option<PollMetrics> {
        *self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command_inlet(&self, command: InletCommand) -> Result<()> {
        self.inlet
            .as_ref()
            .ok_or_else(|| StrataError::InvalidState(format!("layer '{}' is stopped", self.layer_id)))?
            .commands
            .send(command)
            .map_err(|_| StrataError::Worker(format!("consumer of '{}' is gone", self.layer_id)))
    }

    /// Signal both workers and wait briefly for them to exit
    pub async fn shutdown(&mut self) {
        let mut threads = Vec::new();
        if let Some(outlet) = self.outlet.take() {
            let _ = outlet.commands.send(OutletCommand::Shutdown);
            threads.push(outlet.thread);
        }
        if let Some(inlet) = self.inlet.take() {
            let _ = inlet.commands.send(InletCommand::Shutdown);
            threads.push(inlet.thread);
        }

        for thread in threads {
            let join = tokio::task::spawn_blocking(move || thread.join());
            match tokio::time::timeout(WORKER_HANDSHAKE_TIMEOUT, join).await {
                Ok(Ok(Ok(()))) => {}
                Ok(_) => tracing::warn!(layer = %self.layer_id, "High-frequency worker panicked"),
                Err(_) => tracing::warn!(layer = %self.layer_id, "High-frequency worker did not stop in time"),
            }
        }

        // Reports end once both workers dropped their senders
        if let Some(forwarder) = self.forwarder.take() {
            if tokio::time::timeout(WORKER_HANDSHAKE_TIMEOUT, forwarder).await.is_err() {
                tracing::warn!(layer = %self.layer_id, "Report forwarder did not stop in time");
            }
        }
        tracing::debug!(layer = %self.layer_id, "High-frequency workers stopped");
    }
}

impl Drop for HighFrequencyLayer {
    fn drop(&mut self) {
        if let Some(outlet) = &self.outlet {
            let _ = outlet.commands.send(OutletCommand::Shutdown);
        }
        if let Some(inlet) = &self.inlet {
            let _ = inlet.commands.send(InletCommand::Shutdown);
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

enum Handshake {
    Outlet(std_mpsc::Sender<OutletCommand>),
    Inlet(std_mpsc::Sender<InletCommand>),
}

async fn await_handshake(reports: &mut mpsc::Receiver<WorkerReport>, layer_id: &str) -> Result<Handshake> {
    let report = tokio::time::timeout(WORKER_HANDSHAKE_TIMEOUT, reports.recv())
        .await
        .map_err(|_| StrataError::Timeout(format!("worker handshake for layer '{layer_id}'")))?;
    match report {
        Some(WorkerReport::OutletReady(commands)) => Ok(Handshake::Outlet(commands)),
        Some(WorkerReport::InletReady(commands)) => Ok(Handshake::Inlet(commands)),
        Some(WorkerReport::Failed(reason)) => Err(StrataError::Worker(reason)),
        Some(other) => Err(StrataError::Worker(format!("unexpected report before handshake: {other:?}"))),
        None => Err(StrataError::Worker(format!("worker for layer '{layer_id}' exited"))),
    }
}

fn spawn_worker<F>(name: String, body: F) -> Result<thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(body)
        .map_err(|e| StrataError::Worker(e.to_string()))
}

/// Turns worker reports into layer events and stats
async fn forward_reports(
    layer: StreamLayerConfig,
    mut reports: mpsc::Receiver<WorkerReport>,
    events: broadcast::Sender<CoordinationEvent>,
    stats: Arc<LayerStats>,
    metrics: Arc<Mutex<Option<PollMetrics>>>,
) {
    while let Some(report) = reports.recv().await {
        match report {
            WorkerReport::Data {
                source_id,
                data,
                timestamp,
            } => {
                stats.samples_received.fetch_add(1, Ordering::Relaxed);
                let source_node_id = layer
                    .node_id_from_source(&source_id)
                    .unwrap_or(source_id.as_str())
                    .to_string();
                let _ = events.send(CoordinationEvent::LayerData {
                    layer_id: layer.layer_id.clone(),
                    source_node_id,
                    data,
                    timestamp,
                });
            }
            WorkerReport::OutletCounters(counters) => {
                stats.samples_sent.store(counters.sent, Ordering::Relaxed);
                stats.samples_discarded.store(counters.discarded, Ordering::Relaxed);
                stats.send_errors.store(counters.failed, Ordering::Relaxed);
            }
            WorkerReport::Metrics(window) => {
                stats.inlets.store(window.inlets as u64, Ordering::Relaxed);
                stats.drops.fetch_add(window.drops, Ordering::Relaxed);
                tracing::trace!(
                    layer = %layer.layer_id,
                    frequency = window.actual_frequency,
                    samples_per_second = window.samples_per_second,
                    drops = window.drops,
                    "High-frequency window"
                );
                *metrics.lock().unwrap_or_else(PoisonError::into_inner) = Some(window);
            }
            WorkerReport::Failed(reason) => {
                tracing::error!(layer = %layer.layer_id, reason = %reason, "High-frequency worker failed");
            }
            WorkerReport::OutletReady(_) | WorkerReport::InletReady(_) => {}
        }
    }
}

/// Producer thread: owns exactly one outlet
struct Producer {
    layer_id: String,
    provider: Arc<dyn StreamProvider>,
    info: StreamInfo,
    chunk_size: usize,
    buffer_size: usize,
    reports: mpsc::Sender<WorkerReport>,
}

impl Producer {
    fn run(self) {
        let outlet = match self
            .provider
            .create_outlet(self.info.clone(), self.chunk_size, self.buffer_size)
        {
            Ok(outlet) => outlet,
            Err(e) => {
                let _ = self.reports.blocking_send(WorkerReport::Failed(e.to_string()));
                return;
            }
        };

        let (command_tx, commands) = std_mpsc::channel();
        if self
            .reports
            .blocking_send(WorkerReport::OutletReady(command_tx))
            .is_err()
        {
            return;
        }

        let mut counters = OutletCounters::default();
        let mut reported = counters;
        let mut paused = false;
        let mut window_start = Instant::now();

        loop {
            let command = match commands.recv_timeout(METRICS_WINDOW) {
                Ok(command) => Some(command),
                Err(std_mpsc::RecvTimeoutError::Timeout) => None,
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            };

            let mut state_changed = false;
            match command {
                Some(OutletCommand::Send(_)) if paused => counters.discarded += 1,
                Some(OutletCommand::Send(data)) => match outlet.push(data) {
                    Ok(()) => counters.sent += 1,
                    Err(e) => {
                        counters.failed += 1;
                        tracing::debug!(layer = %self.layer_id, error = %e, "High-frequency push failed");
                    }
                },
                Some(OutletCommand::Pause) => {
                    paused = true;
                    state_changed = true;
                }
                Some(OutletCommand::Resume) => {
                    paused = false;
                    state_changed = true;
                }
                Some(OutletCommand::Shutdown) => break,
                None => {}
            }

            if (state_changed || window_start.elapsed() >= METRICS_WINDOW) && counters != reported {
                let _ = self.reports.try_send(WorkerReport::OutletCounters(counters));
                reported = counters;
            }
            if window_start.elapsed() >= METRICS_WINDOW {
                window_start = Instant::now();
            }
        }

        let _ = self.reports.blocking_send(WorkerReport::OutletCounters(counters));
        drop(outlet);
        tracing::debug!(layer = %self.layer_id, sent = counters.sent, discarded = counters.discarded, "Producer stopped");
    }
}

/// Per-source clock offset with amortized refresh
#[derive(Debug, Default)]
struct SourceClock {
    offset: Option<f64>,
    samples_since_refresh: u64,
}

/// Consumer thread: owns every inlet of the layer
struct Consumer {
    layer: StreamLayerConfig,
    hf: HighFrequencyConfig,
    pool: InletPool,
    reports: mpsc::Sender<WorkerReport>,
}

#[derive(Default)]
struct Window {
    iterations: u64,
    samples: u64,
    overruns: u64,
    failed_pulls: u64,
}

impl Consumer {
    fn run(mut self) {
        let (command_tx, commands) = std_mpsc::channel();
        if self
            .reports
            .blocking_send(WorkerReport::InletReady(command_tx))
            .is_err()
        {
            return;
        }

        let interval = self.hf.target_interval();
        let mut clocks: HashMap<String, SourceClock> = HashMap::new();
        let mut paused = false;
        let mut next_wake = Instant::now() + interval;
        let mut last_resync = Instant::now();
        let mut window_start = Instant::now();
        let mut window = Window::default();

        'run: loop {
            // Control messages first, never blocking
            loop {
                match commands.try_recv() {
                    Ok(InletCommand::UpdatePeers(sources)) => {
                        let change = self.pool.set_wanted(sources);
                        let live: HashSet<String> = self.pool.source_ids().into_iter().collect();
                        clocks.retain(|source, _| live.contains(source));
                        tracing::debug!(layer = %self.layer.layer_id, opened = change.opened, closed = change.closed, "High-frequency peers updated");
                    }
                    Ok(InletCommand::Pause) => paused = true,
                    Ok(InletCommand::Resume) => paused = false,
                    Ok(InletCommand::Shutdown) => break 'run,
                    Err(std_mpsc::TryRecvError::Empty) => break,
                    Err(std_mpsc::TryRecvError::Disconnected) => break 'run,
                }
            }

            precise_sleep_until(next_wake, self.hf.busy_wait_threshold, self.hf.use_busy_wait);
            let now = Instant::now();
            if now > next_wake + interval {
                window.overruns += 1;
                next_wake = now + interval;
            } else {
                next_wake += interval;
            }
            window.iterations += 1;

            if now.duration_since(last_resync) >= LAYER_RESYNC_INTERVAL {
                self.pool.connect_missing();
                last_resync = now;
            }

            if !paused {
                let sweep = self.pool.sweep(MAX_PULLS_PER_ITERATION);
                window.failed_pulls += sweep.failed as u64;
                for (source_id, sample) in sweep.samples {
                    let clock = clocks.entry(source_id.clone()).or_default();
                    let offset = Self::offset_for(&mut self.pool, &source_id, clock);
                    window.samples += 1;
                    let report = WorkerReport::Data {
                        source_id,
                        data: sample.data,
                        timestamp: sample.timestamp + offset,
                    };
                    if self.reports.try_send(report).is_err() {
                        window.failed_pulls += 1;
                    }
                }
            }

            let elapsed = now.duration_since(window_start);
            if elapsed >= METRICS_WINDOW {
                let secs = elapsed.as_secs_f64();
                let metrics = PollMetrics {
                    window: elapsed,
                    iterations: window.iterations,
                    samples: window.samples,
                    drops: window.overruns + window.failed_pulls,
                    actual_frequency: window.iterations as f64 / secs,
                    samples_per_second: window.samples as f64 / secs,
                    inlets: self.pool.len(),
                };
                let _ = self.reports.try_send(WorkerReport::Metrics(metrics));
                window = Window::default();
                window_start = now;
            }
        }

        self.pool.clear();
        tracing::debug!(layer = %self.layer.layer_id, "Consumer stopped");
    }

    /// Offset to add to a source's timestamps, refreshed every few samples
    fn offset_for(pool: &mut InletPool, source_id: &str, clock: &mut SourceClock) -> f64 {
        let timeout = match clock.offset {
            None => Some(INITIAL_OFFSET_TIMEOUT),
            Some(_) if clock.samples_since_refresh >= OFFSET_REFRESH_SAMPLES => Some(REFRESH_OFFSET_TIMEOUT),
            Some(_) => None,
        };

        if let Some(timeout) = timeout {
            clock.samples_since_refresh = 0;
            match pool.time_correction(source_id, timeout) {
                Ok(offset) => clock.offset = Some(offset),
                Err(e) => {
                    tracing::trace!(source_id = %source_id, error = %e, "Clock offset unavailable");
                    // Keep the previous estimate; retry after the next refresh period
                    clock.offset.get_or_insert(0.0);
                }
            }
        }
        clock.samples_since_refresh += 1;
        clock.offset.unwrap_or(0.0)
    }
}
