//! Configuration management for the strata-node binary.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use strata_common::config::duration_ms;
use strata_common::{CoordinationConfig, ProtocolConfig};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Base name of the in-process nodes (suffixed with their index)
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Number of nodes to run on the in-memory network
    #[serde(default = "default_nodes")]
    pub nodes: usize,

    /// Built-in protocol preset (basic, gaming, multimodal)
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Full protocol definition; takes precedence over `protocol`
    #[serde(default)]
    pub custom_protocol: Option<ProtocolConfig>,

    /// Membership protocol tuning
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// How often each node publishes on its data layers
    #[serde(rename = "publish_interval_ms", with = "duration_ms", default = "default_publish_interval")]
    pub publish_interval: Duration,

    /// Clock skew added per node index, to exercise clock offsets
    #[serde(default)]
    pub clock_skew_step_ms: u64,

    /// Stop after this many seconds (run until Ctrl+C when unset)
    #[serde(default)]
    pub run_secs: Option<u64>,
}

// Default value functions
fn default_node_name() -> String { "strata".to_string() }
fn default_nodes() -> usize { 3 }
fn default_protocol() -> String { "basic".to_string() }
fn default_publish_interval() -> Duration { Duration::from_millis(500) }

impl AppConfig {
    /// Load configuration from file and STRATA__* environment, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        let mut builder = config::Config::builder();
        if Path::new(config_path).exists() {
            builder = builder.add_source(config::File::with_name(config_path));
        } else {
            tracing::warn!("Config file not found, using defaults");
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("STRATA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load config")?;

        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to parse config")?;

        // Apply CLI overrides
        if let Some(ref node_name) = args.node_name {
            config.node_name = node_name.clone();
        }
        if let Some(nodes) = args.nodes {
            config.nodes = nodes;
        }
        if let Some(ref protocol) = args.protocol {
            config.protocol = protocol.clone();
            config.custom_protocol = None;
        }
        if let Some(run_secs) = args.run_secs {
            config.run_secs = Some(run_secs);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes == 0 {
            anyhow::bail!("nodes must be at least 1");
        }
        if self.publish_interval.is_zero() {
            anyhow::bail!("publish_interval_ms must be non-zero");
        }
        self.coordination
            .validate()
            .context("Invalid coordination config")?;
        self.protocol_config()?;
        Ok(())
    }

    /// Resolve the protocol to run
    pub fn protocol_config(&self) -> Result<ProtocolConfig> {
        let protocol = match &self.custom_protocol {
            Some(custom) => ProtocolConfig::new(
                custom.protocol_id.clone(),
                custom.protocol_name.clone(),
                custom.layers.clone(),
            ),
            None => ProtocolConfig::preset(&self.protocol)
                .with_context(|| format!("Unknown protocol preset '{}'", self.protocol))?,
        };
        protocol.validate().context("Invalid protocol")?;
        Ok(protocol)
    }

    /// Clock skew of the node at `index`, in seconds
    pub fn clock_skew(&self, index: usize) -> f64 {
        Duration::from_millis(self.clock_skew_step_ms * index as u64).as_secs_f64()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            nodes: default_nodes(),
            protocol: default_protocol(),
            custom_protocol: None,
            coordination: CoordinationConfig::default(),
            publish_interval: default_publish_interval(),
            clock_skew_step_ms: 0,
            run_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol_config().unwrap().protocol_id, "basic");
        assert_eq!(config.clock_skew(3), 0.0);
    }

    #[test]
    fn test_parses_toml() {
        let raw = r#"
            nodes = 2
            protocol = "gaming"
            publish_interval_ms = 100
            clock_skew_step_ms = 50

            [coordination]
            heartbeat_interval_ms = 250
            node_timeout_ms = 2000
            max_nodes = 8
        "#;
        let config: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.nodes, 2);
        assert_eq!(config.publish_interval, Duration::from_millis(100));
        assert_eq!(config.coordination.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.coordination.max_nodes, 8);
        assert_eq!(config.clock_skew(2), 0.1);
        assert!(config.validate().is_ok());
        assert!(config.protocol_config().unwrap().layer("game").is_some());
    }

    #[test]
    fn test_unknown_preset_rejected() {
        let config = AppConfig {
            protocol: "chess".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
