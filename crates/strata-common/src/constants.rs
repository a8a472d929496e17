//! Shared constants for Strata components.

use std::time::Duration;

/// Reserved layer id of the coordination layer (always present in a protocol)
pub const COORDINATION_LAYER_ID: &str = "coordination";

/// Stream name used by the coordination transport
pub const COORDINATION_STREAM_NAME: &str = "coordination";

/// Content type advertised by the coordination stream
pub const COORDINATION_CONTENT_TYPE: &str = "Coordination";

/// Source id prefix scoping discovery to coordination-role peers: coord_{node_id}
pub const COORDINATION_SOURCE_PREFIX: &str = "coord_";

/// Application message type used to distribute the protocol configuration
pub const PROTOCOL_CONFIG_MESSAGE: &str = "protocol_config";

/// Stale-peer cleanup runs on a fixed cadence
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Poll cadence for non high-frequency layers
pub const LAYER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Layers retry inlets for peers whose outlet was not yet published
pub const LAYER_RESYNC_INTERVAL: Duration = Duration::from_millis(500);

/// Poll cadence of the coordination transport receiver
pub const COORDINATION_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Capacity of broadcast event channels
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Coordination defaults
pub mod coordination {
    use std::time::Duration;

    pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
    pub const NODE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(3);
    pub const MAX_NODES: usize = 32;

    /// Outlet buffer of the coordination stream (samples)
    pub const BUFFER_SIZE: usize = 360;
}

/// High-frequency transport defaults
pub mod high_frequency {
    use std::time::Duration;

    /// Target polling frequency in Hz
    pub const TARGET_FREQUENCY: f64 = 1000.0;

    /// Coarse sleep stops this long before the deadline; the rest is spun
    pub const BUSY_WAIT_THRESHOLD: Duration = Duration::from_micros(100);

    /// Samples per source between clock-offset refreshes
    pub const OFFSET_REFRESH_SAMPLES: u64 = 100;

    /// Timeout of the first clock-offset estimate per source
    pub const INITIAL_OFFSET_TIMEOUT: Duration = Duration::from_secs(1);

    /// Timeout of periodic clock-offset refreshes
    pub const REFRESH_OFFSET_TIMEOUT: Duration = Duration::from_millis(5);

    /// Metrics aggregation window
    pub const METRICS_WINDOW: Duration = Duration::from_secs(1);

    /// How long the owner waits for a worker handshake or shutdown
    pub const WORKER_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

    pub const BUFFER_SIZE: usize = 1000;
}
