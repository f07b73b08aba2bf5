//! Command-line monitor for a set of Tendermint nodes
//!
//! Run with: cargo run --features cli -- localhost:26657 other-node:26657

use std::time::Duration;

use clap::Parser;
use tm_monitor::{Monitor, MonitorConfig, Node, NodeConfig, DEFAULT_NODE_ADDR};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tm-monitor", version, about = "Watch the health of a Tendermint network")]
struct Args {
    /// Node RPC addresses (host:port, tcp://, http:// or ws:// URLs)
    #[arg(env = "TM_MONITOR_NODES", value_delimiter = ',', default_value = DEFAULT_NODE_ADDR)]
    nodes: Vec<String>,

    /// Seconds between uptime recalculations
    #[arg(long, default_value_t = 10)]
    uptime_every: u64,

    /// Seconds between validator set size refreshes
    #[arg(long, default_value_t = 5)]
    validators_every: u64,

    /// Seconds between stats log lines
    #[arg(long, default_value_t = 5)]
    stats_every: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tm_monitor=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    let config = MonitorConfig::default()
        .with_recalculate_uptime_every(Duration::from_secs(args.uptime_every))
        .with_num_validators_update_interval(Duration::from_secs(args.validators_every));
    let monitor = Monitor::new(config);

    for addr in &args.nodes {
        match monitor.monitor(Node::new(addr, NodeConfig::default())).await {
            Ok(()) => info!(node = %addr, "Monitoring node"),
            Err(e) => error!(node = %addr, error = %e, "Failed to monitor node"),
        }
    }
    if monitor.num_nodes() == 0 {
        return Err("no node could be monitored".into());
    }
    monitor.start();

    let mut stats_interval = tokio::time::interval(Duration::from_secs(args.stats_every.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = stats_interval.tick() => {
                let snapshot = monitor.network_snapshot();
                info!(
                    height = snapshot.height,
                    online = snapshot.num_nodes_online,
                    monitored = snapshot.num_nodes_monitored,
                    health = %snapshot.health,
                    uptime = format!("{:.3}", snapshot.uptime),
                    validators = snapshot.num_validators,
                    block_time_ms = format!("{:.0}", snapshot.avg_block_time_ms),
                    "stats"
                );
            }
        }
    }

    monitor.stop().await;
    Ok(())
}
