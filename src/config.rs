//! Monitor and node configuration
//!
//! Every option has a built-in default. Callers override only what they need:
//!
//! ```
//! use std::time::Duration;
//! use tm_monitor::MonitorConfig;
//!
//! let config = MonitorConfig::default()
//!     .with_num_validators_update_interval(Duration::from_secs(1));
//! assert_eq!(config.recalculate_uptime_every, Duration::from_secs(10));
//! ```

use std::time::Duration;

/// Waiting longer than this for any event means the node is presumed down
pub const NODE_LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect attempts before a node is left offline for good
pub const MAX_RESTARTS: u32 = 25;

/// Capacity of each per-node event channel
pub const CHANNEL_CAPACITY: usize = 10;

/// Default WebSocket JSON-RPC endpoint of a local node
pub const DEFAULT_NODE_ADDR: &str = "ws://127.0.0.1:26657/websocket";

/// Options for a [`Monitor`](crate::Monitor)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// How often network uptime is recomputed
    pub recalculate_uptime_every: Duration,
    /// How often a random node is asked for the validator set size
    pub num_validators_update_interval: Duration,
    /// Silence window after which a node is marked down
    pub liveness_timeout: Duration,
    /// Capacity of the block, latency and connectivity channels
    pub channel_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            recalculate_uptime_every: Duration::from_secs(10),
            num_validators_update_interval: Duration::from_secs(5),
            liveness_timeout: NODE_LIVENESS_TIMEOUT,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

impl MonitorConfig {
    pub fn with_recalculate_uptime_every(mut self, d: Duration) -> Self {
        self.recalculate_uptime_every = d;
        self
    }

    pub fn with_num_validators_update_interval(mut self, d: Duration) -> Self {
        self.num_validators_update_interval = d;
        self
    }
}

/// Options for a single [`Node`](crate::Node)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Display name and lookup key; the address is used when unset
    pub name: Option<String>,
    /// How often validator-set membership is rechecked
    pub check_is_validator_interval: Duration,
    /// Upper bound on a single query round trip
    pub query_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            check_is_validator_interval: Duration::from_secs(5),
            query_timeout: Duration::from_secs(10),
        }
    }
}

impl NodeConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_check_is_validator_interval(mut self, d: Duration) -> Self {
        self.check_is_validator_interval = d;
        self
    }

    pub fn with_query_timeout(mut self, d: Duration) -> Self {
        self.query_timeout = d;
        self
    }
}
