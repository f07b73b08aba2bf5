//! A single monitored endpoint
//!
//! A [`Node`] owns the event source and query client of one endpoint. Its callbacks run on
//! the event source's tasks and forward what they see to the channels bound by the
//! monitor. Sends never block: a full channel drops the value with a warning so a slow
//! consumer cannot stall event delivery.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::{NodeConfig, MAX_RESTARTS};
use crate::error::NodeError;
use crate::events::{BlockHeader, EventData, EventType, PubKey, Validator};
use crate::shutdown::{Shutdown, ShutdownListener};
use crate::source::{DisconnectCallback, EventCallback, EventSource, LatencyCallback, QueryClient};
use crate::transport::{WsEventSource, WsRpcClient};

/// Delay before reconnect attempt `attempt` (0-based): `2^attempt` seconds
pub fn backoff_delay(attempt: u32) -> Duration {
    2u64.checked_pow(attempt)
        .map(Duration::from_secs)
        .unwrap_or(Duration::MAX)
}

/// Serializable view of a node's observed state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub address: String,
    pub online: bool,
    pub height: u64,
    pub block_latency_ms: f64,
    pub is_validator: bool,
    pub restart_attempt: u32,
}

#[derive(Debug, Default)]
struct NodeState {
    online: bool,
    height: u64,
    block_latency_ms: f64,
    /// Latched: set once, never cleared
    is_validator: bool,
    pub_key: Option<PubKey>,
    restart_attempt: u32,
}

/// Channels the monitor binds before starting the node
#[derive(Default)]
struct Sinks {
    blocks: Option<mpsc::Sender<BlockHeader>>,
    latencies: Option<mpsc::Sender<f64>>,
    disconnects: Option<mpsc::Sender<bool>>,
}

struct NodeInner {
    name: String,
    address: String,
    source: Arc<dyn EventSource>,
    client: Arc<dyn QueryClient>,
    config: NodeConfig,
    state: Mutex<NodeState>,
    sinks: Mutex<Sinks>,
    shutdown: Shutdown,
    reconnecting: AtomicBool,
    recheck: Mutex<Option<JoinHandle<()>>>,
}

impl NodeInner {
    fn send_connectivity(&self, disconnected: bool) {
        let sink = self.sinks.lock().disconnects.clone();
        if let Some(tx) = sink {
            forward(&self.name, "connectivity", &tx, disconnected);
        }
    }
}

/// Cheaply cloneable handle to one monitored endpoint
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.inner.name)
            .field("address", &self.inner.address)
            .field("online", &self.is_online())
            .finish()
    }
}

impl Node {
    /// Node backed by the WebSocket JSON-RPC transport at `address`
    pub fn new(address: &str, config: NodeConfig) -> Self {
        let source = Arc::new(WsEventSource::new(address));
        let client = Arc::new(WsRpcClient::new(address, config.query_timeout));
        Self::with_transport(address, source, client, config)
    }

    pub fn with_transport(
        address: &str,
        source: Arc<dyn EventSource>,
        client: Arc<dyn QueryClient>,
        config: NodeConfig,
    ) -> Self {
        let name = config.name.clone().unwrap_or_else(|| address.to_string());
        Self {
            inner: Arc::new(NodeInner {
                name,
                address: address.to_string(),
                source,
                client,
                config,
                state: Mutex::new(NodeState::default()),
                sinks: Mutex::new(Sinks::default()),
                shutdown: Shutdown::new(),
                reconnecting: AtomicBool::new(false),
                recheck: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn is_online(&self) -> bool {
        self.inner.state.lock().online
    }

    pub fn height(&self) -> u64 {
        self.inner.state.lock().height
    }

    /// Last block latency sample, in milliseconds
    pub fn block_latency(&self) -> f64 {
        self.inner.state.lock().block_latency_ms
    }

    pub fn is_validator(&self) -> bool {
        self.inner.state.lock().is_validator
    }

    /// Current reconnect attempt; 0 when connected
    pub fn restart_attempt(&self) -> u32 {
        self.inner.state.lock().restart_attempt
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.inner.state.lock();
        NodeSnapshot {
            name: self.inner.name.clone(),
            address: self.inner.address.clone(),
            online: state.online,
            height: state.height,
            block_latency_ms: state.block_latency_ms,
            is_validator: state.is_validator,
            restart_attempt: state.restart_attempt,
        }
    }

    pub fn send_blocks_to(&self, tx: mpsc::Sender<BlockHeader>) {
        self.inner.sinks.lock().blocks = Some(tx);
    }

    pub fn send_block_latencies_to(&self, tx: mpsc::Sender<f64>) {
        self.inner.sinks.lock().latencies = Some(tx);
    }

    /// `true` is sent on disconnect, `false` after a successful reconnect
    pub fn notify_about_disconnects(&self, tx: mpsc::Sender<bool>) {
        self.inner.sinks.lock().disconnects = Some(tx);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn start(&self) -> Result<(), NodeError> {
        let inner = &self.inner;
        inner.shutdown.reset();

        inner.source.start().await.map_err(NodeError::Start)?;

        inner
            .source
            .register_latency_callback(latency_callback(Arc::downgrade(inner)));
        let subscribed = inner
            .source
            .subscribe(
                EventType::NewBlockHeader,
                new_block_callback(Arc::downgrade(inner)),
            )
            .await;
        if let Err(source) = subscribed {
            inner.source.stop().await;
            return Err(NodeError::Subscribe {
                event: EventType::NewBlockHeader.to_string(),
                source,
            });
        }
        inner
            .source
            .register_disconnect_callback(disconnect_callback(Arc::downgrade(inner)));

        inner.state.lock().online = true;
        info!(node = %inner.name, address = %inner.address, "Node started");

        self.check_is_validator().await;

        let recheck = tokio::spawn(check_is_validator_loop(
            Arc::downgrade(inner),
            inner.shutdown.listener(),
            inner.config.check_is_validator_interval,
        ));
        if let Some(previous) = inner.recheck.lock().replace(recheck) {
            previous.abort();
        }
        Ok(())
    }

    /// Mark offline and stop the event source
    ///
    /// The shutdown signal fires first, so a reconnect in flight cannot bring the node
    /// back afterwards.
    pub async fn stop(&self) {
        self.inner.shutdown.trigger();
        self.inner.state.lock().online = false;
        self.inner.source.stop().await;
        info!(node = %self.inner.name, "Node stopped");
    }

    /// Restart the event source, waiting [`backoff_delay`] before each attempt
    ///
    /// Gives up after [`MAX_RESTARTS`] failed attempts, or as soon as the node is stopped.
    pub async fn restart_with_backoff(&self) -> Result<(), NodeError> {
        let inner = &self.inner;
        let mut shutdown = inner.shutdown.listener();
        let mut attempt = 0;

        loop {
            inner.state.lock().restart_attempt = attempt;
            let delay = backoff_delay(attempt);
            debug!(node = %inner.name, attempt, delay_secs = delay.as_secs(), "Waiting before restart");

            tokio::select! {
                _ = shutdown.wait() => return Err(NodeError::Stopped),
                _ = tokio::time::sleep(delay) => {}
            }

            let started = tokio::select! {
                _ = shutdown.wait() => return Err(NodeError::Stopped),
                started = inner.source.start() => started,
            };
            match started {
                Ok(()) if inner.shutdown.is_triggered() => {
                    inner.source.stop().await;
                    return Err(NodeError::Stopped);
                }
                Ok(()) => {
                    // TODO: authenticate the node's public key before trusting the new session
                    inner.state.lock().restart_attempt = 0;
                    return Ok(());
                }
                Err(e) => warn!(node = %inner.name, attempt, error = %e, "Restart failed"),
            }

            attempt += 1;
            if attempt >= MAX_RESTARTS {
                inner.state.lock().restart_attempt = attempt;
                return Err(NodeError::MaxRestartsExceeded(attempt));
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Height the answer refers to, and the validator set at that height
    pub async fn validators(&self) -> Result<(u64, Vec<Validator>), NodeError> {
        let result = self.inner.client.validators().await?;
        Ok((result.block_height, result.validators))
    }

    pub async fn num_validators(&self) -> Result<(u64, usize), NodeError> {
        let (height, validators) = self.validators().await?;
        Ok((height, validators.len()))
    }

    /// Own public key, fetched once and cached for the node's lifetime
    pub async fn pub_key(&self) -> Result<PubKey, NodeError> {
        if let Some(key) = self.inner.state.lock().pub_key.clone() {
            return Ok(key);
        }
        let status = self.inner.client.status().await?;
        let key = status.node_pub_key().cloned().ok_or(NodeError::MissingPubKey)?;
        self.inner.state.lock().pub_key = Some(key.clone());
        Ok(key)
    }

    /// Promote the node if its key is in the current validator set
    ///
    /// Failures are logged and leave the flag untouched.
    pub async fn check_is_validator(&self) {
        let validators = match self.validators().await {
            Ok((_, validators)) => validators,
            Err(e) => {
                warn!(node = %self.inner.name, error = %e, "Check is validator failed");
                return;
            }
        };
        if validators.is_empty() {
            return;
        }
        let key = match self.pub_key().await {
            Ok(key) => key,
            Err(e) => {
                warn!(node = %self.inner.name, error = %e, "Fetching public key failed");
                return;
            }
        };
        if validators.iter().any(|v| v.pub_key == key) {
            self.promote_to_validator();
        }
    }

    /// One-way transition; there is no demotion
    pub fn promote_to_validator(&self) {
        let mut state = self.inner.state.lock();
        if !state.is_validator {
            state.is_validator = true;
            info!(node = %self.inner.name, "Node is a validator");
        }
    }
}

// ============================================================================
// Callbacks and background tasks
// ============================================================================

fn forward<T>(node: &str, channel: &'static str, tx: &mpsc::Sender<T>, value: T) {
    match tx.try_send(value) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!(node, channel, "Channel full, value dropped"),
        Err(TrySendError::Closed(_)) => trace!(node, channel, "Channel closed, value dropped"),
    }
}

fn new_block_callback(node: Weak<NodeInner>) -> EventCallback {
    Arc::new(move |data: EventData| {
        let Some(inner) = node.upgrade() else {
            return;
        };
        let header = match data {
            EventData::NewBlockHeader(header) => header,
            other => {
                warn!(node = %inner.name, event = ?other.event_type(), "Unexpected payload for new block, dropped");
                return;
            }
        };

        {
            let mut state = inner.state.lock();
            state.height = state.height.max(header.height);
        }
        debug!(node = %inner.name, height = header.height, num_txs = header.num_txs, "New block");

        let sink = inner.sinks.lock().blocks.clone();
        if let Some(tx) = sink {
            forward(&inner.name, "blocks", &tx, header);
        }
    })
}

fn latency_callback(node: Weak<NodeInner>) -> LatencyCallback {
    Arc::new(move |nanos: f64| {
        let Some(inner) = node.upgrade() else {
            return;
        };
        let latency_ms = nanos / 1_000_000.0;
        inner.state.lock().block_latency_ms = latency_ms;
        trace!(node = %inner.name, latency_ms, "New block latency");

        let sink = inner.sinks.lock().latencies.clone();
        if let Some(tx) = sink {
            forward(&inner.name, "latencies", &tx, latency_ms);
        }
    })
}

fn disconnect_callback(node: Weak<NodeInner>) -> DisconnectCallback {
    Arc::new(move || {
        let Some(inner) = node.upgrade() else {
            return;
        };
        if inner.shutdown.is_triggered() {
            return;
        }
        if inner.reconnecting.swap(true, Ordering::AcqRel) {
            debug!(node = %inner.name, "Already reconnecting");
            return;
        }

        inner.state.lock().online = false;
        warn!(node = %inner.name, status = "down", "Node disconnected");
        inner.send_connectivity(true);

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(node = %inner.name, error = %e, "No runtime to reconnect on");
                inner.reconnecting.store(false, Ordering::Release);
                return;
            }
        };

        let node = Node { inner };
        runtime.spawn(async move {
            let inner = &node.inner;
            match node.restart_with_backoff().await {
                Ok(()) => {
                    {
                        let mut state = inner.state.lock();
                        if inner.shutdown.is_triggered() {
                            debug!(node = %inner.name, "Stopped while reconnecting");
                            inner.reconnecting.store(false, Ordering::Release);
                            return;
                        }
                        state.online = true;
                    }
                    info!(node = %inner.name, status = "online", "Node reconnected");
                    inner.send_connectivity(false);
                }
                Err(NodeError::Stopped) => debug!(node = %inner.name, "Reconnect abandoned, node stopped"),
                Err(e) => error!(node = %inner.name, error = %e, "Restart failed, node left offline"),
            }
            inner.reconnecting.store(false, Ordering::Release);
        });
    })
}

async fn check_is_validator_loop(node: Weak<NodeInner>, mut shutdown: ShutdownListener, every: Duration) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = ticker.tick() => {
                let Some(inner) = node.upgrade() else {
                    return;
                };
                Node { inner }.check_is_validator().await;
            }
        }
    }
}
