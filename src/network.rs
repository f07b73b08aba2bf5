//! Network-wide aggregate of node health
//!
//! Pure state: no I/O, no clocks. Every time-dependent operation takes `now` from the
//! caller, so the same code runs under a live or a paused clock.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::events::BlockHeader;

/// Averages cover this much history
const AVERAGING_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Every monitored node is online
    Full,
    /// Some nodes are online
    Moderate,
    /// No node is online
    Dead,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Full => "full",
            Health::Moderate => "moderate",
            Health::Dead => "dead",
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Per-node status
// ============================================================================

#[derive(Debug, Clone)]
struct NodeStatus {
    online: bool,
    admitted_at: Instant,
    /// Time of the last online/offline transition
    last_change: Instant,
    /// Online time accumulated up to `last_change`
    online_time: Duration,
    /// Value as of the last recomputation
    uptime: f64,
}

impl NodeStatus {
    fn new(now: Instant) -> Self {
        Self {
            online: false,
            admitted_at: now,
            last_change: now,
            online_time: Duration::ZERO,
            uptime: 0.0,
        }
    }

    /// Returns true if the status actually changed
    fn set_online(&mut self, online: bool, now: Instant) -> bool {
        if self.online == online {
            return false;
        }
        if self.online {
            self.online_time += now.saturating_duration_since(self.last_change);
        }
        self.online = online;
        self.last_change = now;
        true
    }

    fn uptime_at(&self, now: Instant) -> f64 {
        let total = now.saturating_duration_since(self.admitted_at);
        let mut online = self.online_time;
        if self.online {
            online += now.saturating_duration_since(self.last_change);
        }
        if total.is_zero() {
            return if self.online { 1.0 } else { 0.0 };
        }
        (online.as_secs_f64() / total.as_secs_f64()).clamp(0.0, 1.0)
    }
}

// ============================================================================
// Sliding window of samples
// ============================================================================

#[derive(Debug)]
struct SampleWindow {
    samples: VecDeque<(Instant, f64)>,
    window: Duration,
}

impl SampleWindow {
    fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    fn push(&mut self, now: Instant, value: f64) {
        self.samples.push_back((now, value));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.saturating_duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn sum(&self) -> f64 {
        self.samples.iter().map(|&(_, v)| v).sum()
    }

    fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum() / self.samples.len() as f64)
        }
    }
}

// ============================================================================
// Network
// ============================================================================

/// Serializable point-in-time view of one node's entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeHealth {
    pub name: String,
    pub online: bool,
    pub uptime: f64,
}

/// Serializable point-in-time view of the whole network
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSnapshot {
    pub height: u64,
    pub num_validators: usize,
    pub num_nodes_monitored: usize,
    pub num_nodes_online: usize,
    pub health: Health,
    pub uptime: f64,
    pub avg_block_time_ms: f64,
    pub avg_tx_throughput: f64,
    pub avg_block_latency_ms: f64,
    pub nodes: Vec<NodeHealth>,
}

#[derive(Debug)]
pub struct Network {
    nodes: HashMap<String, NodeStatus>,
    height: u64,
    num_validators: usize,
    num_nodes_online: usize,
    health: Health,
    /// Mean of per-node uptimes, in `[0,1]`
    uptime: f64,
    started_at: Instant,
    /// Accepted blocks, valued by their tx count
    blocks: SampleWindow,
    /// Block latency samples in milliseconds
    latencies: SampleWindow,
    avg_block_time_ms: f64,
    avg_tx_throughput: f64,
    avg_block_latency_ms: f64,
}

impl Network {
    pub fn new(now: Instant) -> Self {
        Self {
            nodes: HashMap::new(),
            height: 0,
            num_validators: 0,
            num_nodes_online: 0,
            health: Health::Dead,
            uptime: 0.0,
            started_at: now,
            blocks: SampleWindow::new(AVERAGING_WINDOW),
            latencies: SampleWindow::new(AVERAGING_WINDOW),
            avg_block_time_ms: 0.0,
            avg_tx_throughput: 0.0,
            avg_block_latency_ms: 0.0,
        }
    }

    /// Admit a node, offline until it proves otherwise
    ///
    /// Returns false if the name already has an entry.
    pub fn new_node(&mut self, name: &str, now: Instant) -> bool {
        if self.nodes.contains_key(name) {
            debug!(node = name, "Node already has a network entry");
            return false;
        }
        self.nodes.insert(name.to_string(), NodeStatus::new(now));
        debug!(node = name, monitored = self.nodes.len(), "Node admitted");
        self.refresh_uptime_mean();
        self.update_health();
        true
    }

    /// Remove a node's entry; returns false if there was none
    pub fn node_deleted(&mut self, name: &str) -> bool {
        let Some(status) = self.nodes.remove(name) else {
            return false;
        };
        if status.online {
            self.num_nodes_online -= 1;
        }
        debug!(node = name, monitored = self.nodes.len(), "Node removed");
        self.refresh_uptime_mean();
        self.update_health();
        true
    }

    pub fn node_is_online(&mut self, name: &str, now: Instant) {
        self.set_node_online(name, true, now);
    }

    pub fn node_is_down(&mut self, name: &str, now: Instant) {
        self.set_node_online(name, false, now);
    }

    fn set_node_online(&mut self, name: &str, online: bool, now: Instant) {
        let Some(status) = self.nodes.get_mut(name) else {
            // Removed while its listener was still draining
            trace!(node = name, online, "Status change for unknown node ignored");
            return;
        };
        if !status.set_online(online, now) {
            return;
        }
        if online {
            self.num_nodes_online += 1;
        } else {
            self.num_nodes_online -= 1;
        }
        info!(node = name, status = if online { "online" } else { "down" }, "Node status changed");
        self.update_health();
    }

    /// Ingest a block header; returns true if it advanced the network height
    pub fn new_block(&mut self, header: &BlockHeader, now: Instant) -> bool {
        if header.height <= self.height {
            trace!(height = header.height, current = self.height, "Stale block ignored");
            return false;
        }
        self.height = header.height;
        self.blocks.push(now, header.num_txs as f64);
        self.refresh_block_averages(now);

        trace!(height = self.height, avg_block_time_ms = self.avg_block_time_ms, "Network height advanced");
        true
    }

    /// Ingest a block latency sample in milliseconds
    pub fn new_block_latency(&mut self, latency_ms: f64, now: Instant) {
        self.latencies.push(now, latency_ms);
        self.avg_block_latency_ms = self.latencies.mean().unwrap_or(0.0);
    }

    /// Recompute per-node and network uptime as of `now`
    pub fn recalculate_uptime(&mut self, now: Instant) {
        for status in self.nodes.values_mut() {
            status.uptime = status.uptime_at(now);
        }
        self.refresh_uptime_mean();

        // Averages decay once blocks stop arriving
        self.refresh_block_averages(now);
        self.latencies.prune(now);
        self.avg_block_latency_ms = self.latencies.mean().unwrap_or(0.0);

        debug!(uptime = self.uptime, nodes = self.nodes.len(), "Uptime recalculated");
    }

    fn refresh_block_averages(&mut self, now: Instant) {
        self.blocks.prune(now);
        let elapsed = now
            .saturating_duration_since(self.started_at)
            .min(AVERAGING_WINDOW)
            .as_secs_f64();
        let count = self.blocks.len();
        if count == 0 {
            self.avg_block_time_ms = 0.0;
            self.avg_tx_throughput = 0.0;
        } else if elapsed > 0.0 {
            self.avg_block_time_ms = elapsed * 1000.0 / count as f64;
            self.avg_tx_throughput = self.blocks.sum() / elapsed;
        }
    }

    fn refresh_uptime_mean(&mut self) {
        self.uptime = if self.nodes.is_empty() {
            0.0
        } else {
            let sum: f64 = self.nodes.values().map(|s| s.uptime).sum();
            (sum / self.nodes.len() as f64).clamp(0.0, 1.0)
        };
    }

    fn update_health(&mut self) {
        let monitored = self.nodes.len();
        self.health = if monitored > 0 && self.num_nodes_online == monitored {
            Health::Full
        } else if self.num_nodes_online > 0 {
            Health::Moderate
        } else {
            Health::Dead
        };
    }

    /// Store `num` only if the answering node was not behind the network
    ///
    /// Returns true if the value was accepted.
    pub fn accept_num_validators(&mut self, height: u64, num: usize) -> bool {
        if height < self.height {
            debug!(height, current = self.height, "Stale validator count rejected");
            return false;
        }
        self.num_validators = num;
        true
    }

    pub fn set_num_validators(&mut self, num: usize) {
        self.num_validators = num;
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn num_validators(&self) -> usize {
        self.num_validators
    }

    pub fn num_nodes_monitored(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_nodes_online(&self) -> usize {
        self.num_nodes_online
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn uptime(&self) -> f64 {
        self.uptime
    }

    pub fn avg_block_time_ms(&self) -> f64 {
        self.avg_block_time_ms
    }

    pub fn avg_tx_throughput(&self) -> f64 {
        self.avg_tx_throughput
    }

    pub fn avg_block_latency_ms(&self) -> f64 {
        self.avg_block_latency_ms
    }

    pub fn start_time(&self) -> Instant {
        self.started_at
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn is_online(&self, name: &str) -> Option<bool> {
        self.nodes.get(name).map(|s| s.online)
    }

    pub fn node_uptime(&self, name: &str) -> Option<f64> {
        self.nodes.get(name).map(|s| s.uptime)
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        let mut nodes: Vec<NodeHealth> = self
            .nodes
            .iter()
            .map(|(name, s)| NodeHealth {
                name: name.clone(),
                online: s.online,
                uptime: s.uptime,
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        NetworkSnapshot {
            height: self.height,
            num_validators: self.num_validators,
            num_nodes_monitored: self.nodes.len(),
            num_nodes_online: self.num_nodes_online,
            health: self.health,
            uptime: self.uptime,
            avg_block_time_ms: self.avg_block_time_ms,
            avg_tx_throughput: self.avg_tx_throughput,
            avg_block_latency_ms: self.avg_block_latency_ms,
            nodes,
        }
    }
}
