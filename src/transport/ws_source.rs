//! Event subscriptions over a single WebSocket connection
//!
//! Uses tokio-tungstenite in a background task. Requests go out through an unbounded
//! channel, notifications are decoded and handed to the registered callbacks on the
//! connection task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use super::{request, websocket_url, WsState};
use crate::error::SourceError;
use crate::events::{parse_event_data, EventData, EventType};
use crate::source::{DisconnectCallback, EventCallback, EventSource, LatencyCallback};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct Callbacks {
    latency: Option<LatencyCallback>,
    disconnect: Option<DisconnectCallback>,
    /// Keyed by subscription query
    subscriptions: HashMap<String, EventCallback>,
}

struct Connection {
    requests: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

pub struct WsEventSource {
    url: String,
    state: Arc<Mutex<WsState>>,
    callbacks: Arc<Mutex<Callbacks>>,
    connection: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

impl WsEventSource {
    pub fn new(addr: &str) -> Self {
        Self {
            url: websocket_url(addr),
            state: Arc::new(Mutex::new(WsState::Disconnected)),
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> WsState {
        self.state.lock().clone()
    }

    fn close_connection(&self) {
        if let Some(conn) = self.connection.lock().take() {
            conn.task.abort();
        }
    }

    fn send_request(&self, method: &str, query: &str) -> Result<(), SourceError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = request(id, method, serde_json::json!({ "query": query }));
        let conn = self.connection.lock();
        let conn = conn.as_ref().ok_or(SourceError::NotRunning)?;
        conn.requests
            .send(body)
            .map_err(|e| SourceError::Send(e.to_string()))
    }
}

impl Drop for WsEventSource {
    fn drop(&mut self) {
        self.close_connection();
    }
}

#[async_trait]
impl EventSource for WsEventSource {
    async fn start(&self) -> Result<(), SourceError> {
        self.close_connection();
        *self.state.lock() = WsState::Connecting;
        info!(url = %self.url, "Connecting to event source");

        let stream = match connect_async(self.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                *self.state.lock() = WsState::Error(e.to_string());
                return Err(SourceError::Connect {
                    addr: self.url.clone(),
                    reason: e.to_string(),
                });
            }
        };
        *self.state.lock() = WsState::Connected;
        info!(url = %self.url, "Event source connected");

        let (tx, rx) = mpsc::unbounded_channel();

        // A restart re-issues every subscription made before the connection dropped
        let queries: Vec<String> = self.callbacks.lock().subscriptions.keys().cloned().collect();
        for query in queries {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            debug!(url = %self.url, query = %query, "Resubscribing");
            let _ = tx.send(request(id, "subscribe", serde_json::json!({ "query": query })));
        }

        let task = tokio::spawn(run_connection(
            stream,
            rx,
            self.url.clone(),
            self.state.clone(),
            self.callbacks.clone(),
        ));
        *self.connection.lock() = Some(Connection { requests: tx, task });
        Ok(())
    }

    async fn stop(&self) {
        self.close_connection();
        *self.state.lock() = WsState::Disconnected;
        debug!(url = %self.url, "Event source stopped");
    }

    fn register_latency_callback(&self, callback: LatencyCallback) {
        self.callbacks.lock().latency = Some(callback);
    }

    fn register_disconnect_callback(&self, callback: DisconnectCallback) {
        self.callbacks.lock().disconnect = Some(callback);
    }

    /// Sends the subscription request; rejections arrive later as logged error frames
    async fn subscribe(&self, event: EventType, callback: EventCallback) -> Result<(), SourceError> {
        let query = event.query();
        self.send_request("subscribe", &query)?;
        self.callbacks.lock().subscriptions.insert(query, callback);
        Ok(())
    }

    async fn unsubscribe(&self, event: EventType) -> Result<(), SourceError> {
        let query = event.query();
        self.callbacks.lock().subscriptions.remove(&query);
        self.send_request("unsubscribe", &query)
    }
}

async fn run_connection(
    stream: WsStream,
    mut requests: mpsc::UnboundedReceiver<String>,
    url: String,
    state: Arc<Mutex<WsState>>,
    callbacks: Arc<Mutex<Callbacks>>,
) {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            Some(body) = requests.recv() => {
                if let Err(e) = write.send(Message::Text(body.into())).await {
                    error!(url = %url, error = %e, "Failed to send request");
                    *state.lock() = WsState::Error(e.to_string());
                    break;
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handle_frame(&url, &text, &callbacks),
                    Some(Ok(Message::Close(_))) | None => {
                        warn!(url = %url, "WebSocket closed by server");
                        *state.lock() = WsState::Disconnected;
                        break;
                    }
                    Some(Err(e)) => {
                        error!(url = %url, error = %e, "WebSocket error");
                        *state.lock() = WsState::Error(e.to_string());
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let disconnect = callbacks.lock().disconnect.clone();
    if let Some(callback) = disconnect {
        callback();
    }
}

fn handle_frame(url: &str, text: &str, callbacks: &Mutex<Callbacks>) {
    let json: Value = match serde_json::from_str(text) {
        Ok(json) => json,
        Err(e) => {
            warn!(url, error = %e, "Failed to parse JSON");
            return;
        }
    };

    if let Some(err) = json.get("error") {
        warn!(url, error = %err, "Event source returned an error");
        return;
    }

    let result = &json["result"];
    let Some(query) = result["query"].as_str() else {
        // Subscription acknowledgements carry an empty result
        trace!(url, "Non-event frame");
        return;
    };

    let event = match parse_event_data(&result["data"]) {
        Ok(event) => event,
        Err(e) => {
            warn!(url, query, error = %e, "Dropping malformed event");
            return;
        }
    };

    let (latency, callback) = {
        let callbacks = callbacks.lock();
        (callbacks.latency.clone(), callbacks.subscriptions.get(query).cloned())
    };

    if let (EventData::NewBlockHeader(header), Some(latency)) = (&event, latency) {
        let nanos = header
            .time
            .and_then(|committed| (Utc::now() - committed).num_nanoseconds())
            .filter(|&ns| ns >= 0);
        if let Some(ns) = nanos {
            latency(ns as f64);
        }
    }

    match callback {
        Some(callback) => callback(event),
        None => trace!(url, query, "No subscriber for event"),
    }
}
