//! SimNetwork: shared in-memory broker connecting simulated endpoints.
//!
//! Every outlet registers a slot in the broker. Inlets subscribe a bounded
//! lock-free queue to the slot; pushes fan out to every live queue. A slot
//! disappears when its outlet is dropped, which inlets observe as a lost
//! stream.

use crossbeam_queue::ArrayQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use strata_common::{Sample, StreamInfo, StreamQuery};

use crate::provider::SimProvider;

/// Queue shared between one outlet slot and one inlet
pub(crate) type SampleQueue = ArrayQueue<Sample>;

pub(crate) struct OutletSlot {
    pub info: StreamInfo,
    /// Clock skew of the endpoint that owns the outlet
    pub clock_skew: f64,
    pub subscribers: Vec<Weak<SampleQueue>>,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub outlets: HashMap<String, OutletSlot>,
    next_uid: u64,
    /// Source id suffixes whose pushes are swallowed
    silenced: Vec<String>,
}

impl Registry {
    pub fn allocate_uid(&mut self) -> String {
        self.next_uid += 1;
        format!("sim-{:06}", self.next_uid)
    }

    pub fn is_silenced(&self, source_id: &str) -> bool {
        self.silenced.iter().any(|s| source_id.ends_with(s.as_str()))
    }

    pub fn find_by_source(&self, name: &str, source_id: &str) -> Option<(&String, &OutletSlot)> {
        self.outlets
            .iter()
            .find(|(_, slot)| slot.info.name == name && slot.info.source_id == source_id)
    }
}

/// Broker counters
#[derive(Default)]
pub(crate) struct Counters {
    pub outlets_created: AtomicU64,
    pub inlets_created: AtomicU64,
    pub inlets_closed: AtomicU64,
    pub samples_pushed: AtomicU64,
    pub samples_overwritten: AtomicU64,
}

/// Snapshot of broker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub live_outlets: usize,
    pub outlets_created: u64,
    pub inlets_created: u64,
    pub inlets_closed: u64,
    pub samples_pushed: u64,
    pub samples_overwritten: u64,
}

/// Shared in-memory network
#[derive(Clone)]
pub struct SimNetwork {
    registry: Arc<Mutex<Registry>>,
    counters: Arc<Counters>,
    epoch: Instant,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            counters: Arc::new(Counters::default()),
            epoch: Instant::now(),
        }
    }

    /// Endpoint whose clock agrees with the network clock
    pub fn endpoint(&self) -> SimProvider {
        SimProvider::new(self.clone(), 0.0)
    }

    /// Endpoint whose local clock runs `clock_skew` seconds ahead
    pub fn endpoint_with_skew(&self, clock_skew: f64) -> SimProvider {
        SimProvider::new(self.clone(), clock_skew)
    }

    /// Swallow every push from outlets whose source id ends with `suffix`.
    /// Simulates a hung process that keeps its streams open.
    pub fn silence(&self, suffix: &str) {
        let mut registry = self.registry();
        if !registry.silenced.iter().any(|s| s == suffix) {
            registry.silenced.push(suffix.to_string());
        }
        tracing::debug!(suffix = %suffix, "Silenced sim sources");
    }

    pub fn restore(&self, suffix: &str) {
        self.registry().silenced.retain(|s| s != suffix);
    }

    /// Live streams matching a query
    pub fn streams(&self, query: &StreamQuery) -> Vec<StreamInfo> {
        self.registry()
            .outlets
            .values()
            .filter(|slot| query.matches(&slot.info))
            .map(|slot| slot.info.clone())
            .collect()
    }

    pub fn stats(&self) -> SimStats {
        SimStats {
            live_outlets: self.registry().outlets.len(),
            outlets_created: self.counters.outlets_created.load(Ordering::Relaxed),
            inlets_created: self.counters.inlets_created.load(Ordering::Relaxed),
            inlets_closed: self.counters.inlets_closed.load(Ordering::Relaxed),
            samples_pushed: self.counters.samples_pushed.load(Ordering::Relaxed),
            samples_overwritten: self.counters.samples_overwritten.load(Ordering::Relaxed),
        }
    }

    /// Network clock in seconds since the broker was created
    pub(crate) fn clock(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    pub(crate) fn is_live(&self, uid: &str) -> bool {
        self.registry().outlets.contains_key(uid)
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork").field("stats", &self.stats()).finish()
    }
}
