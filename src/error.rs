//! Error types for the monitor, nodes and their transports

use thiserror::Error;

/// Failures of an [`EventSource`](crate::source::EventSource)
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("failed to send request: {0}")]
    Send(String),
    #[error("event source is not running")]
    NotRunning,
    #[error("subscription to {0} rejected")]
    Subscribe(String),
}

/// Failures of a [`QueryClient`](crate::source::QueryClient) call
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("request {method} timed out")]
    Timeout { method: String },
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("connection closed before a response arrived")]
    Closed,
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Payloads that do not match the expected event shape
#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed {event} payload: {source}")]
    Malformed {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload has no event type")]
    MissingType,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("event source failed to start: {0}")]
    Start(#[source] SourceError),
    #[error("failed to subscribe to {event}: {source}")]
    Subscribe {
        event: String,
        #[source]
        source: SourceError,
    },
    #[error("query failed: {0}")]
    Query(#[from] QueryError),
    #[error("status response carries no public key")]
    MissingPubKey,
    #[error("reached max restarts ({0})")]
    MaxRestartsExceeded(u32),
    #[error("node was stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("node {name} failed to start: {source}")]
    NodeStart {
        name: String,
        #[source]
        source: NodeError,
    },
    #[error("node {0} is already monitored")]
    DuplicateNode(String),
    #[error("node {0} is not monitored")]
    UnknownNode(String),
}
