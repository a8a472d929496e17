//! # strata-node
//!
//! Runs a group of Strata nodes on an in-memory stream network. Each node
//! joins the coordination group, receives the protocol from whichever node
//! wins the coordinator role and publishes synthetic samples on its layers.
//!
//! ## Architecture
//! ```text
//!   node-0 ─┐                      ┌─ coordination stream (membership)
//!   node-1 ─┼── SimNetwork broker ─┤
//!   node-N ─┘                      └─ one stream per data layer
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use strata_common::{ChannelFormat, CoordinationEvent, ProtocolConfig, SampleData};
use strata_node::coordination::{CoordinationNode, generate_node_id};
use strata_node::layers::MultiLayerCoordinator;
use strata_sim::SimNetwork;

mod config;

use config::AppConfig;

/// Strata - layered peer coordination demo
#[derive(Parser, Debug)]
#[command(name = "strata-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/strata.toml")]
    config: String,

    /// Base node name (overrides config)
    #[arg(long, env = "STRATA_NODE_NAME")]
    node_name: Option<String>,

    /// Number of in-process nodes (overrides config)
    #[arg(short, long, env = "STRATA_NODES")]
    nodes: Option<usize>,

    /// Protocol preset: basic, gaming, multimodal (overrides config)
    #[arg(short, long, env = "STRATA_PROTOCOL")]
    protocol: Option<String>,

    /// Stop after this many seconds
    #[arg(long)]
    run_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("Starting strata-node v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    let protocol = config.protocol_config()?;
    info!(
        protocol = %protocol.protocol_id,
        nodes = config.nodes,
        layers = protocol.data_layers().count(),
        "Configuration loaded from {}",
        args.config
    );

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let network = SimNetwork::new();
    let mut members = Vec::with_capacity(config.nodes);
    for index in 0..config.nodes {
        let provider = Arc::new(network.endpoint_with_skew(config.clock_skew(index)));
        let node = CoordinationNode::new(
            generate_node_id(),
            format!("{}-{}", config.node_name, index),
            config.coordination.clone(),
            provider,
        )
        .context("Failed to create node")?;
        let member = Arc::new(
            MultiLayerCoordinator::new(Arc::new(node), protocol.clone())
                .context("Failed to create coordinator")?,
        );

        tokio::spawn(log_events(member.clone(), shutdown_tx.subscribe()));
        member
            .initialize()
            .await
            .context("Failed to join network")?;
        tokio::spawn(publish_samples(
            member.clone(),
            protocol.clone(),
            config.publish_interval,
            shutdown_tx.subscribe(),
        ));
        members.push(member);
    }

    // Handle graceful shutdown
    match config.run_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("Run time elapsed"),
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            info!("Shutdown signal received");
        }
    }
    let _ = shutdown_tx.send(());

    for member in &members {
        for stats in member.layer_stats().await {
            info!(
                node = %member.node().node_id(),
                layer = %stats.layer_id,
                sent = stats.samples_sent,
                received = stats.samples_received,
                drops = stats.drops,
                "Layer totals"
            );
        }
    }

    let results = futures::future::join_all(members.iter().map(|m| m.dispose())).await;
    for result in results {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Node did not shut down cleanly");
        }
    }

    info!("strata-node shutdown complete");
    Ok(())
}

/// Log membership changes of one member
async fn log_events(member: Arc<MultiLayerCoordinator>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    let mut events = member.subscribe();
    let node_id = member.node().node_id().to_string();
    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(CoordinationEvent::RoleChanged { old, new }) => {
                info!(node = %node_id, %old, %new, "Role changed");
            }
            Ok(CoordinationEvent::NodeJoined { node_id: peer, node_name, .. }) => {
                info!(node = %node_id, peer = %peer, name = %node_name, "Node joined");
            }
            Ok(CoordinationEvent::NodeLeft { node_id: peer, .. }) => {
                info!(node = %node_id, peer = %peer, "Node left");
            }
            Ok(CoordinationEvent::TopologyChanged { nodes, coordinator_id }) => {
                info!(node = %node_id, members = nodes.len(), coordinator = ?coordinator_id, "Topology changed");
            }
            Ok(CoordinationEvent::LayerData { layer_id, source_node_id, timestamp, .. }) => {
                tracing::trace!(node = %node_id, layer = %layer_id, from = %source_node_id, timestamp, "Layer data");
            }
            Ok(CoordinationEvent::Application { .. }) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(node = %node_id, missed, "Event log lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Publish a synthetic sample on every layer that owns an outlet
async fn publish_samples(
    member: Arc<MultiLayerCoordinator>,
    protocol: ProtocolConfig,
    period: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(period);
    let mut sequence: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                if !member.is_ready() {
                    continue;
                }
                sequence += 1;
                for layer in protocol.data_layers().filter(|l| l.requires_outlet) {
                    let stream = &layer.stream_config;
                    let data = synthetic_sample(stream.channel_format, stream.channel_count, sequence);
                    if let Err(e) = member.send_layer_data(&layer.layer_id, data).await {
                        tracing::debug!(layer = %layer.layer_id, error = %e, "Publish failed");
                    }
                }
            }
        }
    }
}

fn synthetic_sample(format: ChannelFormat, channels: usize, sequence: u64) -> SampleData {
    let value = (sequence % 1000) as f64 / 10.0;
    match format {
        ChannelFormat::Float32 => SampleData::Float32((0..channels).map(|c| (value + c as f64) as f32).collect()),
        ChannelFormat::Double64 => SampleData::Double64((0..channels).map(|c| value + c as f64).collect()),
        ChannelFormat::String => SampleData::String(vec![format!("marker-{sequence}"); channels]),
        other => SampleData::zeroed(other, channels),
    }
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
