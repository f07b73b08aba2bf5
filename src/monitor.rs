//! Orchestration of nodes into the shared network view
//!
//! Every monitored node gets three bounded channels and a listener task that folds what
//! arrives on them into the [`Network`]. Two global loops keep the aggregate fresh: one
//! recomputes uptime, the other asks a random node for the size of the validator set.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::events::BlockHeader;
use crate::network::{Network, NetworkSnapshot};
use crate::node::Node;
use crate::shutdown::{Shutdown, ShutdownListener};

struct Listener {
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

struct Shared {
    config: MonitorConfig,
    nodes: RwLock<Vec<Node>>,
    network: Arc<Mutex<Network>>,
    listeners: Mutex<HashMap<String, Listener>>,
    quit: Shutdown,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheaply cloneable handle to the node set and its network aggregate
#[derive(Clone)]
pub struct Monitor {
    shared: Arc<Shared>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                nodes: RwLock::new(Vec::new()),
                network: Arc::new(Mutex::new(Network::new(Instant::now()))),
                listeners: Mutex::new(HashMap::new()),
                quit: Shutdown::new(),
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.shared.config
    }

    // ========================================================================
    // Node set
    // ========================================================================

    /// Start `node` and add it to the monitored set
    ///
    /// The node is only admitted once it started; on error nothing about it is kept.
    pub async fn monitor(&self, node: Node) -> Result<(), MonitorError> {
        let name = node.name().to_string();
        if self.node_by_name(&name).is_some() {
            return Err(MonitorError::DuplicateNode(name));
        }

        let capacity = self.shared.config.channel_capacity;
        let (block_tx, block_rx) = mpsc::channel(capacity);
        let (latency_tx, latency_rx) = mpsc::channel(capacity);
        let (connectivity_tx, connectivity_rx) = mpsc::channel(capacity);
        node.send_blocks_to(block_tx);
        node.send_block_latencies_to(latency_tx);
        node.notify_about_disconnects(connectivity_tx);

        node.start().await.map_err(|source| MonitorError::NodeStart {
            name: name.clone(),
            source,
        })?;

        let admitted = {
            let mut nodes = self.shared.nodes.write();
            if nodes.iter().any(|n| n.name() == name) {
                false
            } else {
                nodes.push(node.clone());
                self.shared.network.lock().new_node(&name, Instant::now());

                let shutdown = Shutdown::new();
                let task = tokio::spawn(listen(
                    name.clone(),
                    self.shared.network.clone(),
                    Channels {
                        blocks: block_rx,
                        latencies: latency_rx,
                        connectivity: connectivity_rx,
                    },
                    shutdown.listener(),
                    self.shared.config.liveness_timeout,
                ));
                self.shared
                    .listeners
                    .lock()
                    .insert(name.clone(), Listener { shutdown, task });
                true
            }
        };

        if !admitted {
            // Lost a race with a concurrent registration under the same name
            node.stop().await;
            return Err(MonitorError::DuplicateNode(name));
        }

        debug!(node = %name, address = %node.address(), "Node monitored");
        Ok(())
    }

    /// Stop `node` and drop everything the monitor holds for it
    pub async fn unmonitor(&self, node: &Node) -> Result<(), MonitorError> {
        let name = node.name().to_string();
        let removed = {
            let mut nodes = self.shared.nodes.write();
            match nodes.iter().position(|n| n.name() == name) {
                Some(index) => {
                    self.shared.network.lock().node_deleted(&name);
                    Some(nodes.swap_remove(index))
                }
                None => None,
            }
        };
        let Some(removed) = removed else {
            return Err(MonitorError::UnknownNode(name));
        };

        removed.stop().await;

        let listener = self.shared.listeners.lock().remove(&name);
        if let Some(Listener { shutdown, task }) = listener {
            shutdown.trigger();
            if let Err(e) = task.await {
                warn!(node = %name, error = %e, "Listener task ended abnormally");
            }
        }

        debug!(node = %name, "Node unmonitored");
        Ok(())
    }

    /// Position and handle of the node called `name`
    pub fn node_by_name(&self, name: &str) -> Option<(usize, Node)> {
        self.shared
            .nodes
            .read()
            .iter()
            .enumerate()
            .find(|(_, n)| n.name() == name)
            .map(|(index, n)| (index, n.clone()))
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.shared.nodes.read().clone()
    }

    pub fn num_nodes(&self) -> usize {
        self.shared.nodes.read().len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the periodic loops; returns immediately
    pub fn start(&self) {
        let mut loops = self.shared.loops.lock();
        if !loops.is_empty() {
            warn!("Monitor already started");
            return;
        }
        self.shared.quit.reset();

        loops.push(tokio::spawn(recalculate_uptime_loop(
            self.shared.network.clone(),
            self.shared.quit.listener(),
            self.shared.config.recalculate_uptime_every,
        )));
        loops.push(tokio::spawn(update_num_validators_loop(
            self.shared.clone(),
            self.shared.quit.listener(),
        )));
        info!(
            uptime_every_secs = self.shared.config.recalculate_uptime_every.as_secs(),
            validators_every_secs = self.shared.config.num_validators_update_interval.as_secs(),
            "Monitor started"
        );
    }

    /// Stop the loops and unmonitor every node
    pub async fn stop(&self) {
        self.shared.quit.trigger();

        for node in self.nodes() {
            if let Err(e) = self.unmonitor(&node).await {
                debug!(node = %node.name(), error = %e, "Node already gone at shutdown");
            }
        }

        let loops = std::mem::take(&mut *self.shared.loops.lock());
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Monitor loop ended abnormally");
            }
        }
        info!("Monitor stopped");
    }

    // ========================================================================
    // Network access
    // ========================================================================

    /// Run `f` against the network aggregate under its lock
    pub fn with_network<R>(&self, f: impl FnOnce(&Network) -> R) -> R {
        f(&self.shared.network.lock())
    }

    pub fn network_snapshot(&self) -> NetworkSnapshot {
        self.shared.network.lock().snapshot()
    }
}

// ============================================================================
// Background tasks
// ============================================================================

struct Channels {
    blocks: mpsc::Receiver<BlockHeader>,
    latencies: mpsc::Receiver<f64>,
    /// `true` on disconnect, `false` on reconnect
    connectivity: mpsc::Receiver<bool>,
}

/// Per-node listener; ends only on its own shutdown signal
async fn listen(
    name: String,
    network: Arc<Mutex<Network>>,
    mut channels: Channels,
    mut shutdown: ShutdownListener,
    liveness_timeout: Duration,
) {
    trace!(node = %name, "Listener started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            Some(header) = channels.blocks.recv() => {
                let now = Instant::now();
                let mut network = network.lock();
                network.new_block(&header, now);
                network.node_is_online(&name, now);
            }
            Some(latency_ms) = channels.latencies.recv() => {
                let now = Instant::now();
                let mut network = network.lock();
                network.new_block_latency(latency_ms, now);
                network.node_is_online(&name, now);
            }
            Some(disconnected) = channels.connectivity.recv() => {
                let now = Instant::now();
                let mut network = network.lock();
                if disconnected {
                    network.node_is_down(&name, now);
                } else {
                    network.node_is_online(&name, now);
                }
            }
            _ = sleep(liveness_timeout) => {
                let mut network = network.lock();
                if network.is_online(&name) == Some(true) {
                    warn!(
                        node = %name,
                        timeout_secs = liveness_timeout.as_secs_f64(),
                        "No events within liveness timeout, marking node down"
                    );
                }
                network.node_is_down(&name, Instant::now());
            }
        }
    }
    trace!(node = %name, "Listener stopped");
}

async fn recalculate_uptime_loop(network: Arc<Mutex<Network>>, mut quit: ShutdownListener, every: Duration) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = quit.wait() => return,
            _ = ticker.tick() => {
                let mut network = network.lock();
                network.recalculate_uptime(Instant::now());
                trace!(uptime = network.uptime(), "Uptime recalculated");
            }
        }
    }
}

async fn update_num_validators_loop(shared: Arc<Shared>, mut quit: ShutdownListener) {
    let every = shared.config.num_validators_update_interval;

    loop {
        tokio::select! {
            _ = quit.wait() => return,
            _ = sleep(every) => {}
        }

        let node = {
            let nodes = shared.nodes.read();
            let mut rng = rand::thread_rng();
            nodes.choose(&mut rng).cloned()
        };
        let Some(node) = node else {
            trace!("No nodes to ask for the validator set");
            continue;
        };

        match node.num_validators().await {
            Ok((height, num)) => {
                if !shared.network.lock().accept_num_validators(height, num) {
                    debug!(node = %node.name(), height, num, "Stale validator count ignored");
                }
            }
            Err(e) => warn!(node = %node.name(), error = %e, "Failed to update number of validators"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::mock::{MockClient, MockSource};
    use crate::network::Health;
    use tokio::time::sleep_until;

    fn mock_node(name: &str) -> (Node, Arc<MockSource>, Arc<MockClient>) {
        let (source, client) = (MockSource::new(), MockClient::new());
        let node = Node::with_transport(
            &format!("ws://{name}:26657/websocket"),
            source.clone(),
            client.clone(),
            NodeConfig::default().with_name(name),
        );
        (node, source, client)
    }

    /// Let spawned tasks drain their channels
    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    /// Run tasks woken at the current instant without advancing the clock
    async fn yield_to_tasks() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_keeps_nodes_and_entries_in_step() {
        let monitor = Monitor::default();
        let mut handles = Vec::new();
        for name in ["a", "b", "c"] {
            let (node, _, _) = mock_node(name);
            monitor.monitor(node.clone()).await.unwrap();
            handles.push(node);
        }
        assert_eq!(monitor.with_network(|n| n.num_nodes_monitored()), 3);

        monitor.unmonitor(&handles[1]).await.unwrap();

        let mut names: Vec<String> = monitor.nodes().iter().map(|n| n.name().to_string()).collect();
        names.sort();
        assert_eq!(names, ["a", "c"]);
        assert!(monitor.node_by_name("b").is_none());
        monitor.with_network(|n| {
            assert_eq!(n.num_nodes_monitored(), 2);
            assert!(!n.contains("b"));
            assert!(n.contains("a") && n.contains("c"));
        });
        assert!(!handles[1].is_online());

        assert!(matches!(
            monitor.unmonitor(&handles[1]).await,
            Err(MonitorError::UnknownNode(name)) if name == "b"
        ));
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_name_rejected() {
        let monitor = Monitor::default();
        let (first, _, _) = mock_node("a");
        let (second, second_source, _) = mock_node("a");

        monitor.monitor(first).await.unwrap();
        assert!(matches!(
            monitor.monitor(second).await,
            Err(MonitorError::DuplicateNode(_))
        ));
        assert_eq!(second_source.start_count(), 0);
        assert_eq!(monitor.num_nodes(), 1);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_leaves_no_trace() {
        let monitor = Monitor::default();
        let (node, source, _) = mock_node("a");
        source.fail_all_starts(true);

        let result = monitor.monitor(node).await;

        assert!(matches!(result, Err(MonitorError::NodeStart { name, .. }) if name == "a"));
        assert_eq!(monitor.num_nodes(), 0);
        assert!(!monitor.with_network(|n| n.contains("a")));
        assert!(monitor.shared.listeners.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_round_trip() {
        let monitor = Monitor::default();
        let (node, source, _) = mock_node("a");
        monitor.monitor(node.clone()).await.unwrap();
        assert_eq!(monitor.with_network(|n| n.is_online("a")), Some(false));

        source.emit_block(100);
        source.emit_latency(3_000_000.0);
        let last_event = Instant::now();
        settle().await;
        monitor.with_network(|n| {
            assert_eq!(n.height(), 100);
            assert_eq!(n.is_online("a"), Some(true));
            assert_eq!(n.health(), Health::Full);
            assert_eq!(n.avg_block_latency_ms(), 3.0);
        });

        // Down after exactly the liveness timeout of silence, not before
        sleep_until(last_event + Duration::from_millis(4_999)).await;
        yield_to_tasks().await;
        assert_eq!(monitor.with_network(|n| n.is_online("a")), Some(true));
        sleep_until(last_event + Duration::from_millis(5_000)).await;
        yield_to_tasks().await;
        assert_eq!(monitor.with_network(|n| n.is_online("a")), Some(false));
        assert_eq!(monitor.with_network(|n| n.health()), Health::Dead);

        // Connection drop and a reconnect on the first attempt
        source.disconnect();
        settle().await;
        assert_eq!(monitor.with_network(|n| n.is_online("a")), Some(false));
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(monitor.with_network(|n| n.is_online("a")), Some(true));
        assert!(node.is_online());
        assert_eq!(node.restart_attempt(), 0);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_traffic_keeps_node_online() {
        let monitor = Monitor::default();
        let (node, source, _) = mock_node("a");
        monitor.monitor(node).await.unwrap();

        source.emit_block(1);
        settle().await;
        for height in 2..8 {
            sleep(Duration::from_millis(4_900)).await;
            assert_eq!(monitor.with_network(|n| n.is_online("a")), Some(true));
            source.emit_block(height);
        }
        settle().await;
        assert_eq!(monitor.with_network(|n| n.height()), 7);
        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_validator_count_is_rejected() {
        let config = MonitorConfig::default().with_num_validators_update_interval(Duration::from_secs(1));
        let monitor = Monitor::new(config);
        let (node, source, client) = mock_node("a");
        client.set_validators(50, &["k1", "k2", "k3"]);
        monitor.monitor(node).await.unwrap();
        monitor.start();

        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(monitor.with_network(|n| n.num_validators()), 3);

        // Network moves past the height the node answers for
        source.emit_block(100);
        client.set_validators(60, &["k1", "k2", "k3", "k4", "k5"]);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(monitor.with_network(|n| n.num_validators()), 3);

        client.set_validators(100, &["k1", "k2", "k3", "k4", "k5", "k6", "k7"]);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(monitor.with_network(|n| n.num_validators()), 7);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_validator_loop_survives_empty_set_and_failures() {
        let config = MonitorConfig::default().with_num_validators_update_interval(Duration::from_secs(1));
        let monitor = Monitor::new(config);
        monitor.start();
        sleep(Duration::from_secs(3)).await;

        let (node, _, client) = mock_node("a");
        monitor.monitor(node).await.unwrap();
        let calls = client.validators_calls();
        sleep(Duration::from_millis(2_100)).await;
        assert!(client.validators_calls() >= calls + 2);
        assert_eq!(monitor.with_network(|n| n.num_validators()), 0);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_with_empty_set_returns_without_waiting() {
        let every = Duration::from_secs(60);
        let monitor = Monitor::new(MonitorConfig::default().with_num_validators_update_interval(every));
        monitor.start();
        sleep(Duration::from_secs(1)).await;

        let began = Instant::now();
        monitor.stop().await;

        assert!(Instant::now() - began < every);
        assert!(monitor.shared.loops.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_recalculated_periodically() {
        let monitor = Monitor::default();
        let (node, source, _) = mock_node("a");
        monitor.monitor(node).await.unwrap();
        monitor.start();

        source.emit_block(1);
        settle().await;
        assert_eq!(monitor.with_network(|n| n.uptime()), 0.0);

        for height in 2..4 {
            sleep(Duration::from_secs(4)).await;
            source.emit_block(height);
        }
        sleep(Duration::from_secs(3)).await;
        let uptime = monitor.with_network(|n| n.uptime());
        assert!(uptime > 0.9 && uptime <= 1.0, "uptime {uptime}");

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_unmonitors_everything() {
        let monitor = Monitor::default();
        let mut sources = Vec::new();
        for name in ["a", "b"] {
            let (node, source, _) = mock_node(name);
            monitor.monitor(node).await.unwrap();
            sources.push(source);
        }
        monitor.start();

        monitor.stop().await;

        assert_eq!(monitor.num_nodes(), 0);
        assert_eq!(monitor.with_network(|n| n.num_nodes_monitored()), 0);
        assert!(monitor.shared.listeners.lock().is_empty());
        assert!(monitor.shared.loops.lock().is_empty());
        for source in sources {
            assert_eq!(source.stop_count(), 1);
            assert!(!source.is_running());
        }
    }
}
