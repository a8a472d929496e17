//! # Strata Common
//!
//! Shared types, traits, and utilities used across Strata components.
//!
//! ## Modules
//! - `types` - Membership data (NodeRole, NetworkNode, messages, events)
//! - `config` - Coordination, protocol and high-frequency configuration
//! - `stream` - The stream transport seam (provider, outlet, inlet traits)
//! - `error` - Common error types
//! - `constants` - Shared protocol constants and defaults

pub mod config;
pub mod constants;
pub mod error;
pub mod stream;
pub mod types;

pub use config::{
    CoordinationConfig, HighFrequencyConfig, LayerPriority, ProtocolConfig, StreamConfig,
    StreamLayerConfig,
};
pub use error::{Result, StrataError};
pub use stream::{
    ChannelFormat, Sample, SampleData, StreamInfo, StreamInlet, StreamOutlet, StreamProvider,
    StreamQuery,
};
pub use types::*;
