// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use hub_relayer::config::RelayerConfig;
use hub_relayer::metrics::start_prometheus_server;
use hub_relayer::node::{run_relayer_node, StartHeights};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"), version)]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
    /// Restart the side chain follower from this height (must be below the
    /// hub-synced tip to take effect).
    #[clap(long, default_value_t = 0)]
    pub side_force_height: u64,
    /// Start the hub follower from this height instead of the stored one.
    #[clap(long, default_value_t = 0)]
    pub hub_height: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayerConfig::load(&args.config_path)?;

    let registry = prometheus::Registry::new();
    let metrics_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        config.metrics_port,
    );
    let _metrics_server = start_prometheus_server(metrics_address, registry.clone());
    info!("metrics server started at port {}", config.metrics_port);

    let heights = StartHeights {
        side_force_height: args.side_force_height,
        hub_height: args.hub_height,
    };
    let handles = run_relayer_node(config, heights, &registry).await?;
    for handle in handles {
        handle
            .await
            .map_err(|e| anyhow::anyhow!("task join error: {e}"))?;
    }
    Ok(())
}
