//! Coordination, protocol and transport configuration types.
//!
//! All durations are (de)serialized as integer milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{self, COORDINATION_LAYER_ID, COORDINATION_STREAM_NAME};
use crate::error::{Result, StrataError};
use crate::stream::ChannelFormat;
use crate::types::Metadata;

/// Serde helper for `Duration` fields stored as milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Serde helper for `Duration` fields stored as microseconds
pub mod duration_us {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_micros)
    }
}

/// Membership protocol configuration (immutable once a node is built)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Discovery broadcast cadence while discovering
    #[serde(rename = "discovery_interval_ms", with = "duration_ms", default = "default_discovery_interval")]
    pub discovery_interval: Duration,

    /// Heartbeat cadence once participant/coordinator
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Peers silent for longer than this are evicted
    #[serde(rename = "node_timeout_ms", with = "duration_ms", default = "default_node_timeout")]
    pub node_timeout: Duration,

    /// Time spent discovering before self-promotion is considered
    #[serde(rename = "join_timeout_ms", with = "duration_ms", default = "default_join_timeout")]
    pub join_timeout: Duration,

    /// Maximum group size, coordinator included
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,

    /// Become coordinator when no coordinator answers within `join_timeout`
    #[serde(default = "default_true")]
    pub auto_promote: bool,

    /// Process messages this node sent itself
    #[serde(default)]
    pub receive_own_messages: bool,

    /// Capabilities advertised in discovery and join requests
    #[serde(default)]
    pub capabilities: Metadata,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            discovery_interval: default_discovery_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            node_timeout: default_node_timeout(),
            join_timeout: default_join_timeout(),
            max_nodes: default_max_nodes(),
            auto_promote: true,
            receive_own_messages: false,
            capabilities: Metadata::new(),
        }
    }
}

impl CoordinationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_nodes == 0 {
            return Err(StrataError::Config("max_nodes must be at least 1".into()));
        }
        if self.discovery_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(StrataError::Config("intervals must be non-zero".into()));
        }
        if self.node_timeout <= self.heartbeat_interval {
            return Err(StrataError::Config(format!(
                "node_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.node_timeout, self.heartbeat_interval
            )));
        }
        Ok(())
    }
}

/// Scheduling priority of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerPriority {
    Low,
    Medium,
    High,
    /// Served by the high-frequency transport
    Critical,
}

impl Default for LayerPriority {
    fn default() -> Self {
        Self::Medium
    }
}

impl LayerPriority {
    pub fn is_realtime(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

/// Shape of the stream backing a layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub content_type: String,
    pub channel_count: usize,
    /// Nominal rate in Hz (0 = irregular)
    #[serde(default)]
    pub sample_rate: f64,
    pub channel_format: ChannelFormat,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub chunk_size: usize,
}

impl StreamConfig {
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        channel_count: usize,
        sample_rate: f64,
        channel_format: ChannelFormat,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            channel_count,
            sample_rate,
            channel_format,
            buffer_size: default_buffer_size(),
            chunk_size: 0,
        }
    }
}

/// Declaration of one data layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamLayerConfig {
    pub layer_id: String,
    pub layer_name: String,
    pub stream_config: StreamConfig,
    #[serde(default)]
    pub is_pausable: bool,
    #[serde(default)]
    pub priority: LayerPriority,
    #[serde(default = "default_true")]
    pub requires_outlet: bool,
    #[serde(default = "default_true")]
    pub requires_inlet_from_all: bool,
    /// Open an inlet on this node's own outlet too
    #[serde(default)]
    pub receive_own_data: bool,
    /// Tuning for critical layers (derived from the stream when absent)
    #[serde(default)]
    pub high_frequency: Option<HighFrequencyConfig>,
}

impl StreamLayerConfig {
    pub fn new(layer_id: impl Into<String>, layer_name: impl Into<String>, stream_config: StreamConfig) -> Self {
        Self {
            layer_id: layer_id.into(),
            layer_name: layer_name.into(),
            stream_config,
            is_pausable: false,
            priority: LayerPriority::default(),
            requires_outlet: true,
            requires_inlet_from_all: true,
            receive_own_data: false,
            high_frequency: None,
        }
    }

    pub fn pausable(mut self, is_pausable: bool) -> Self {
        self.is_pausable = is_pausable;
        self
    }

    pub fn with_priority(mut self, priority: LayerPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Source id of `node_id`'s outlet on this layer: {layer_id}_{node_id}
    pub fn source_id_for(&self, node_id: &str) -> String {
        format!("{}_{}", self.layer_id, node_id)
    }

    pub fn source_prefix(&self) -> String {
        format!("{}_", self.layer_id)
    }

    /// Node id encoded in a source id of this layer
    pub fn node_id_from_source<'a>(&self, source_id: &'a str) -> Option<&'a str> {
        source_id
            .strip_prefix(self.layer_id.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .filter(|id| !id.is_empty())
    }

    pub fn is_coordination(&self) -> bool {
        self.layer_id == COORDINATION_LAYER_ID
    }

    pub fn uses_high_frequency(&self) -> bool {
        self.priority.is_realtime()
    }

    /// Effective high-frequency settings of this layer
    pub fn high_frequency_config(&self) -> HighFrequencyConfig {
        self.high_frequency
            .clone()
            .unwrap_or_else(|| HighFrequencyConfig::for_stream(&self.stream_config))
    }

    /// The reserved coordination layer
    pub fn coordination() -> Self {
        let stream = StreamConfig {
            buffer_size: constants::coordination::BUFFER_SIZE,
            ..StreamConfig::new(
                COORDINATION_STREAM_NAME,
                constants::COORDINATION_CONTENT_TYPE,
                1,
                0.0,
                ChannelFormat::String,
            )
        };
        Self {
            priority: LayerPriority::High,
            ..Self::new(COORDINATION_LAYER_ID, "Coordination", stream)
        }
    }
}

/// Declarative list of layers making up a protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub protocol_id: String,
    pub protocol_name: String,
    pub layers: Vec<StreamLayerConfig>,
}

impl ProtocolConfig {
    /// Build a protocol, inserting the reserved coordination layer if missing
    pub fn new(
        protocol_id: impl Into<String>,
        protocol_name: impl Into<String>,
        mut layers: Vec<StreamLayerConfig>,
    ) -> Self {
        if !layers.iter().any(StreamLayerConfig::is_coordination) {
            layers.insert(0, StreamLayerConfig::coordination());
        }
        Self {
            protocol_id: protocol_id.into(),
            protocol_name: protocol_name.into(),
            layers,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.protocol_id.is_empty() {
            return Err(StrataError::Config("protocol_id must not be empty".into()));
        }
        let coordination = self.layers.iter().filter(|l| l.is_coordination()).count();
        if coordination != 1 {
            return Err(StrataError::Config(format!(
                "protocol '{}' must declare the '{}' layer exactly once (found {})",
                self.protocol_id, COORDINATION_LAYER_ID, coordination
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for layer in &self.layers {
            if !seen.insert(layer.layer_id.as_str()) {
                return Err(StrataError::Config(format!("duplicate layer id '{}'", layer.layer_id)));
            }
            if layer.stream_config.channel_count == 0 {
                return Err(StrataError::Config(format!(
                    "layer '{}' must have at least one channel",
                    layer.layer_id
                )));
            }
            if let Some(hf) = &layer.high_frequency {
                hf.validate()
                    .map_err(|e| StrataError::Config(format!("layer '{}': {e}", layer.layer_id)))?;
            }
        }
        Ok(())
    }

    /// Layers other than the reserved coordination layer, in declaration order
    pub fn data_layers(&self) -> impl Iterator<Item = &StreamLayerConfig> {
        self.layers.iter().filter(|l| !l.is_coordination())
    }

    pub fn layer(&self, layer_id: &str) -> Option<&StreamLayerConfig> {
        self.layers.iter().find(|l| l.layer_id == layer_id)
    }

    /// Coordination plus one pausable float32 data layer
    pub fn basic() -> Self {
        Self::new(
            "basic",
            "Basic",
            vec![
                StreamLayerConfig::new(
                    "data",
                    "Data",
                    StreamConfig::new("strata_data", "Data", 1, 0.0, ChannelFormat::Float32),
                )
                .pausable(true),
            ],
        )
    }

    /// Real-time game layer plus pausable telemetry
    pub fn gaming() -> Self {
        Self::new(
            "gaming",
            "Gaming",
            vec![
                StreamLayerConfig::new(
                    "game",
                    "Game",
                    StreamConfig::new("strata_game", "Game", 4, 1000.0, ChannelFormat::Float32),
                )
                .with_priority(LayerPriority::Critical),
                StreamLayerConfig::new(
                    "telemetry",
                    "Telemetry",
                    StreamConfig::new("strata_telemetry", "Telemetry", 3, 60.0, ChannelFormat::Float32),
                )
                .pausable(true)
                .with_priority(LayerPriority::Low),
            ],
        )
    }

    /// Sensor stream plus irregular string markers
    pub fn multimodal() -> Self {
        Self::new(
            "multimodal",
            "Multimodal",
            vec![
                StreamLayerConfig::new(
                    "sensor",
                    "Sensor",
                    StreamConfig::new("strata_sensor", "EEG", 8, 250.0, ChannelFormat::Float32),
                )
                .pausable(true)
                .with_priority(LayerPriority::High),
                StreamLayerConfig::new(
                    "events",
                    "Events",
                    StreamConfig::new("strata_events", "Markers", 1, 0.0, ChannelFormat::String),
                ),
            ],
        )
    }

    /// Look up a built-in protocol by name
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "basic" => Some(Self::basic()),
            "gaming" => Some(Self::gaming()),
            "multimodal" => Some(Self::multimodal()),
            _ => None,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self::basic()
    }
}

/// Tuning of the high-frequency transport workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighFrequencyConfig {
    /// Polling frequency in Hz
    #[serde(default = "default_target_frequency")]
    pub target_frequency: f64,

    /// Spin the final stretch before each deadline
    #[serde(default = "default_true")]
    pub use_busy_wait: bool,

    /// Portion of each interval that is spun instead of slept
    #[serde(rename = "busy_wait_threshold_us", with = "duration_us", default = "default_busy_wait_threshold")]
    pub busy_wait_threshold: Duration,

    #[serde(default = "default_hf_buffer_size")]
    pub buffer_size: usize,

    pub channel_format: ChannelFormat,

    pub channel_count: usize,
}

impl HighFrequencyConfig {
    pub fn for_stream(stream: &StreamConfig) -> Self {
        Self {
            target_frequency: default_target_frequency(),
            use_busy_wait: true,
            busy_wait_threshold: default_busy_wait_threshold(),
            buffer_size: stream.buffer_size.max(default_hf_buffer_size()),
            channel_format: stream.channel_format,
            channel_count: stream.channel_count,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.target_frequency.is_finite() || self.target_frequency <= 0.0 {
            return Err(StrataError::Config(format!(
                "target_frequency must be a positive number of Hz (got {})",
                self.target_frequency
            )));
        }
        Ok(())
    }

    /// Poll interval derived from the target frequency
    pub fn target_interval(&self) -> Duration {
        if !self.target_frequency.is_finite() || self.target_frequency <= 0.0 {
            return Duration::from_secs_f64(1.0 / default_target_frequency());
        }
        Duration::from_secs_f64(1.0 / self.target_frequency)
    }
}

// Default value functions
fn default_discovery_interval() -> Duration { constants::coordination::DISCOVERY_INTERVAL }
fn default_heartbeat_interval() -> Duration { constants::coordination::HEARTBEAT_INTERVAL }
fn default_node_timeout() -> Duration { constants::coordination::NODE_TIMEOUT }
fn default_join_timeout() -> Duration { constants::coordination::JOIN_TIMEOUT }
fn default_max_nodes() -> usize { constants::coordination::MAX_NODES }
fn default_true() -> bool { true }
fn default_buffer_size() -> usize { 360 }
fn default_target_frequency() -> f64 { constants::high_frequency::TARGET_FREQUENCY }
fn default_busy_wait_threshold() -> Duration { constants::high_frequency::BUSY_WAIT_THRESHOLD }
fn default_hf_buffer_size() -> usize { constants::high_frequency::BUFFER_SIZE }
