//! Tendermint network monitor
//!
//! Watches a fleet of node endpoints and keeps a live view of network health:
//! - per-node liveness, detected by event silence as well as connection loss
//! - network block height, uptime and validator count
//! - one-minute averages of block time, tx throughput and block latency
//!
//! ```no_run
//! use tm_monitor::{Monitor, MonitorConfig, Node, NodeConfig};
//!
//! # async fn run() -> Result<(), tm_monitor::MonitorError> {
//! let monitor = Monitor::new(MonitorConfig::default());
//! monitor.monitor(Node::new("localhost:26657", NodeConfig::default())).await?;
//! monitor.start();
//! println!("{:?}", monitor.network_snapshot());
//! monitor.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod network;
pub mod node;
pub mod shutdown;
pub mod source;
pub mod transport;

#[cfg(test)]
mod mock;

pub use config::{MonitorConfig, NodeConfig, DEFAULT_NODE_ADDR, MAX_RESTARTS};
pub use error::{EventError, MonitorError, NodeError, QueryError, SourceError};
pub use events::{BlockHeader, EventData, EventType, PubKey, Validator};
pub use monitor::Monitor;
pub use network::{Health, Network, NetworkSnapshot};
pub use node::{backoff_delay, Node, NodeSnapshot};
pub use source::{EventSource, QueryClient};
pub use transport::{WsEventSource, WsRpcClient};
