//! SimProvider: one node's endpoint on a [`SimNetwork`].

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use strata_common::{
    Result, Sample, SampleData, StrataError, StreamInfo, StreamInlet, StreamOutlet,
    StreamProvider, StreamQuery,
};

use crate::network::{OutletSlot, SampleQueue, SimNetwork};

/// Granularity of blocking waits inside the simulation
const WAIT_STEP: Duration = Duration::from_millis(1);

/// Discovery re-scan cadence while waiting for matches
const DISCOVERY_STEP: Duration = Duration::from_millis(5);

/// Stream provider backed by an in-memory [`SimNetwork`]
#[derive(Clone, Debug)]
pub struct SimProvider {
    network: SimNetwork,
    clock_skew: f64,
}

impl SimProvider {
    pub(crate) fn new(network: SimNetwork, clock_skew: f64) -> Self {
        Self { network, clock_skew }
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    pub fn clock_skew(&self) -> f64 {
        self.clock_skew
    }
}

impl StreamProvider for SimProvider {
    fn create_outlet(
        &self,
        mut info: StreamInfo,
        _chunk_size: usize,
        _buffer_size: usize,
    ) -> Result<Box<dyn StreamOutlet>> {
        if info.channel_count == 0 {
            return Err(StrataError::Transport(format!(
                "stream '{}' needs at least one channel",
                info.name
            )));
        }

        let mut registry = self.network.registry();
        if registry.find_by_source(&info.name, &info.source_id).is_some() {
            return Err(StrataError::Transport(format!(
                "outlet '{}' with source id '{}' already exists",
                info.name, info.source_id
            )));
        }

        info.uid = registry.allocate_uid();
        registry.outlets.insert(
            info.uid.clone(),
            OutletSlot {
                info: info.clone(),
                clock_skew: self.clock_skew,
                subscribers: Vec::new(),
            },
        );
        drop(registry);

        self.network
            .counters()
            .outlets_created
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(stream = %info.name, source_id = %info.source_id, uid = %info.uid, "Sim outlet created");

        Ok(Box::new(SimOutlet {
            info,
            network: self.network.clone(),
            clock_skew: self.clock_skew,
        }))
    }

    fn discover_streams(
        &self,
        query: &StreamQuery,
        wait_time: Duration,
        max_results: usize,
    ) -> Result<Vec<StreamInfo>> {
        let deadline = Instant::now() + wait_time;
        loop {
            let mut found = self.network.streams(query);
            found.sort_by(|a, b| a.source_id.cmp(&b.source_id));
            if max_results > 0 {
                found.truncate(max_results);
            }
            if !found.is_empty() || Instant::now() >= deadline {
                return Ok(found);
            }
            std::thread::sleep(DISCOVERY_STEP.min(deadline - Instant::now()));
        }
    }

    fn create_inlet(
        &self,
        info: &StreamInfo,
        buffer_size: usize,
        _chunk_size: usize,
        recover: bool,
    ) -> Result<Box<dyn StreamInlet>> {
        let queue = Arc::new(SampleQueue::new(buffer_size.max(1)));

        let mut registry = self.network.registry();
        let uid = if registry.outlets.contains_key(&info.uid) {
            info.uid.clone()
        } else {
            registry
                .find_by_source(&info.name, &info.source_id)
                .map(|(uid, _)| uid.clone())
                .ok_or_else(|| {
                    StrataError::Transport(format!(
                        "stream '{}' ({}) is not available",
                        info.name, info.source_id
                    ))
                })?
        };
        let slot = registry
            .outlets
            .get_mut(&uid)
            .ok_or_else(|| StrataError::Transport(format!("stream {uid} vanished")))?;
        slot.subscribers.push(Arc::downgrade(&queue));
        let info = slot.info.clone();
        let remote_skew = slot.clock_skew;
        drop(registry);

        self.network
            .counters()
            .inlets_created
            .fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(SimInlet {
            info,
            queue,
            network: self.network.clone(),
            local_skew: self.clock_skew,
            remote_skew,
            recover,
        }))
    }

    fn local_clock(&self) -> f64 {
        self.network.clock() + self.clock_skew
    }
}

/// Outlet registered in the sim broker; deregisters on drop
pub struct SimOutlet {
    info: StreamInfo,
    network: SimNetwork,
    clock_skew: f64,
}

impl StreamOutlet for SimOutlet {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn push(&self, data: SampleData) -> Result<()> {
        if !self.info.accepts(&data) {
            return Err(StrataError::Transport(format!(
                "sample ({:?} x{}) does not fit stream '{}' ({:?} x{})",
                data.format(),
                data.channel_count(),
                self.info.name,
                self.info.channel_format,
                self.info.channel_count
            )));
        }

        let sample = Sample {
            timestamp: self.network.clock() + self.clock_skew,
            data,
        };

        let mut registry = self.network.registry();
        if registry.is_silenced(&self.info.source_id) {
            return Ok(());
        }
        let slot = registry
            .outlets
            .get_mut(&self.info.uid)
            .ok_or_else(|| StrataError::Transport(format!("outlet {} is closed", self.info.uid)))?;

        let mut overwritten = 0;
        slot.subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                if queue.force_push(sample.clone()).is_some() {
                    overwritten += 1;
                }
                true
            }
            None => false,
        });
        drop(registry);

        let counters = self.network.counters();
        counters.samples_pushed.fetch_add(1, Ordering::Relaxed);
        if overwritten > 0 {
            counters
                .samples_overwritten
                .fetch_add(overwritten, Ordering::Relaxed);
        }
        Ok(())
    }

    fn have_consumers(&self) -> bool {
        self.network
            .registry()
            .outlets
            .get(&self.info.uid)
            .is_some_and(|slot| slot.subscribers.iter().any(|w| w.strong_count() > 0))
    }

    fn wait_for_consumers(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.have_consumers() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(WAIT_STEP);
        }
    }
}

impl Drop for SimOutlet {
    fn drop(&mut self) {
        self.network.registry().outlets.remove(&self.info.uid);
        tracing::debug!(stream = %self.info.name, source_id = %self.info.source_id, "Sim outlet destroyed");
    }
}

/// Inlet reading from one sim outlet
pub struct SimInlet {
    info: StreamInfo,
    queue: Arc<SampleQueue>,
    network: SimNetwork,
    local_skew: f64,
    remote_skew: f64,
    recover: bool,
}

impl SimInlet {
    /// Re-subscribe to a re-created outlet with the same name and source id
    fn try_reattach(&mut self) -> bool {
        let mut registry = self.network.registry();
        let Some(uid) = registry
            .find_by_source(&self.info.name, &self.info.source_id)
            .map(|(uid, _)| uid.clone())
        else {
            return false;
        };
        let Some(slot) = registry.outlets.get_mut(&uid) else {
            return false;
        };
        slot.subscribers.push(Arc::downgrade(&self.queue));
        self.info = slot.info.clone();
        self.remote_skew = slot.clock_skew;
        tracing::debug!(source_id = %self.info.source_id, uid = %uid, "Sim inlet recovered");
        true
    }
}

impl StreamInlet for SimInlet {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn pull(&mut self, timeout: Duration) -> Result<Option<Sample>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(sample) = self.queue.pop() {
                return Ok(Some(sample));
            }
            if !self.network.is_live(&self.info.uid) {
                if !self.recover {
                    return Err(StrataError::Transport(format!(
                        "stream '{}' ({}) was lost",
                        self.info.name, self.info.source_id
                    )));
                }
                self.try_reattach();
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(WAIT_STEP.min(deadline - now));
        }
    }

    fn time_correction(&mut self, _timeout: Duration) -> Result<f64> {
        if !self.network.is_live(&self.info.uid) {
            return Err(StrataError::Timeout(format!(
                "no clock response from '{}'",
                self.info.source_id
            )));
        }
        Ok(self.local_skew - self.remote_skew)
    }

    fn samples_available(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for SimInlet {
    fn drop(&mut self) {
        self.network
            .counters()
            .inlets_closed
            .fetch_add(1, Ordering::Relaxed);
    }
}
