//! strandd entry point.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use strand_gossip::UdpTransport;
use strand_membership::NodeIndex;
use strandd::{ClusterConfig, Node};

#[derive(Parser, Debug)]
#[command(name = "strandd", about = "strand log storage daemon")]
struct Args {
    /// Path to the cluster configuration file.
    #[arg(long)]
    config: PathBuf,

    /// This node's index in the cluster configuration.
    #[arg(long)]
    node_index: NodeIndex,

    /// Data directory for local shards.
    #[arg(long, default_value = "/var/lib/strand")]
    data_dir: PathBuf,

    /// Disable the gossip failure detector.
    #[arg(long)]
    no_gossip: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let text = std::fs::read_to_string(&args.config)?;
    let config = ClusterConfig::parse(&text)?;
    tracing::info!(
        cluster = %config.cluster,
        version = config.version,
        node = args.node_index,
        "starting strandd"
    );

    let node = Arc::new(Node::open(
        args.node_index,
        config.clone(),
        &args.data_dir,
        None,
    )?);

    if !args.no_gossip {
        let gossip_addr = config
            .nodes
            .as_ref()
            .and_then(|nodes| nodes.get(&args.node_index))
            .map(|n| n.gossip_addr.clone())
            .unwrap_or_else(|| "0.0.0.0:4441".to_string());
        match UdpTransport::bind(gossip_addr.parse()?).await {
            Ok(transport) => node.start_gossip(Arc::new(transport)),
            Err(e) => tracing::warn!(error = %e, "gossip disabled: could not bind"),
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    node.shutdown();
    Ok(())
}
