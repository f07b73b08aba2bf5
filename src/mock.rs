//! In-process event source and query client for tests
//!
//! The mock source records every start attempt with its (possibly paused) timestamp and
//! lets a test fire callbacks the way a live connection would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{QueryError, SourceError};
use crate::events::{
    BlockHeader, EventData, EventType, PubKey, StatusResult, Validator, ValidatorInfo,
    ValidatorsResult,
};
use crate::source::{DisconnectCallback, EventCallback, EventSource, LatencyCallback, QueryClient};

/// Paused-clock timers fire on millisecond ticks
pub fn assert_elapsed(actual: Duration, expected: Duration) {
    let slack = Duration::from_millis(5);
    assert!(
        actual + slack >= expected && actual <= expected + slack,
        "elapsed {actual:?}, expected {expected:?}"
    );
}

pub fn key(value: &str) -> PubKey {
    PubKey {
        kind: "tendermint/PubKeyEd25519".to_string(),
        value: value.to_string(),
    }
}

// ============================================================================
// Event source
// ============================================================================

#[derive(Default)]
struct SourceState {
    running: bool,
    fail_next_starts: usize,
    fail_all_starts: bool,
    fail_subscribe: bool,
    /// How long each `start` takes before it resolves
    start_delay: Duration,
    start_times: Vec<Instant>,
    stops: usize,
    latency: Option<LatencyCallback>,
    disconnect: Option<DisconnectCallback>,
    subscriptions: HashMap<EventType, EventCallback>,
}

#[derive(Default)]
pub struct MockSource {
    state: Mutex<SourceState>,
}

impl MockSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_starts(&self, n: usize) {
        self.state.lock().fail_next_starts = n;
    }

    pub fn fail_all_starts(&self, fail: bool) {
        self.state.lock().fail_all_starts = fail;
    }

    pub fn fail_subscribe(&self) {
        self.state.lock().fail_subscribe = true;
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.state.lock().start_delay = delay;
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.state.lock().start_times.clone()
    }

    pub fn start_count(&self) -> usize {
        self.state.lock().start_times.len()
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stops
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn is_subscribed(&self, event: EventType) -> bool {
        self.state.lock().subscriptions.contains_key(&event)
    }

    /// Deliver a payload to the subscription callback, if any
    pub fn emit(&self, event: EventType, data: EventData) {
        let callback = self.state.lock().subscriptions.get(&event).cloned();
        if let Some(callback) = callback {
            callback(data);
        }
    }

    pub fn emit_block(&self, height: u64) {
        self.emit(
            EventType::NewBlockHeader,
            EventData::NewBlockHeader(BlockHeader::new(height)),
        );
    }

    pub fn emit_latency(&self, nanos: f64) {
        let callback = self.state.lock().latency.clone();
        if let Some(callback) = callback {
            callback(nanos);
        }
    }

    /// Drop the connection as a remote failure would
    pub fn disconnect(&self) {
        let callback = {
            let mut state = self.state.lock();
            state.running = false;
            state.disconnect.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[async_trait]
impl EventSource for MockSource {
    async fn start(&self) -> Result<(), SourceError> {
        let delay = {
            let mut state = self.state.lock();
            state.start_times.push(Instant::now());
            state.start_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_all_starts || state.fail_next_starts > 0 {
            state.fail_next_starts = state.fail_next_starts.saturating_sub(1);
            return Err(SourceError::Connect {
                addr: "mock".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        state.running = true;
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.stops += 1;
    }

    fn register_latency_callback(&self, callback: LatencyCallback) {
        self.state.lock().latency = Some(callback);
    }

    fn register_disconnect_callback(&self, callback: DisconnectCallback) {
        self.state.lock().disconnect = Some(callback);
    }

    async fn subscribe(&self, event: EventType, callback: EventCallback) -> Result<(), SourceError> {
        let mut state = self.state.lock();
        if state.fail_subscribe {
            return Err(SourceError::Subscribe(event.query()));
        }
        state.subscriptions.insert(event, callback);
        Ok(())
    }

    async fn unsubscribe(&self, event: EventType) -> Result<(), SourceError> {
        self.state.lock().subscriptions.remove(&event);
        Ok(())
    }
}

// ============================================================================
// Query client
// ============================================================================

#[derive(Default)]
struct ClientState {
    /// `None` makes the `validators` call fail
    validators: Option<ValidatorsResult>,
    pub_key: Option<PubKey>,
    validators_calls: usize,
    status_calls: usize,
}

#[derive(Default)]
pub struct MockClient {
    state: Mutex<ClientState>,
}

impl MockClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_validators(&self, block_height: u64, keys: &[&str]) {
        let validators = keys
            .iter()
            .map(|k| Validator {
                address: k.to_uppercase(),
                pub_key: key(k),
                voting_power: 10,
            })
            .collect();
        self.state.lock().validators = Some(ValidatorsResult {
            block_height,
            validators,
        });
    }

    pub fn fail_validators(&self) {
        self.state.lock().validators = None;
    }

    pub fn set_pub_key(&self, value: &str) {
        self.state.lock().pub_key = Some(key(value));
    }

    pub fn validators_calls(&self) -> usize {
        self.state.lock().validators_calls
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().status_calls
    }
}

#[async_trait]
impl QueryClient for MockClient {
    async fn validators(&self) -> Result<ValidatorsResult, QueryError> {
        let mut state = self.state.lock();
        state.validators_calls += 1;
        state
            .validators
            .clone()
            .ok_or_else(|| QueryError::Transport("validators unavailable".to_string()))
    }

    async fn status(&self) -> Result<StatusResult, QueryError> {
        let mut state = self.state.lock();
        state.status_calls += 1;
        Ok(StatusResult {
            validator_info: state.pub_key.clone().map(|pub_key| ValidatorInfo {
                address: String::new(),
                pub_key,
            }),
            pub_key: None,
        })
    }
}
