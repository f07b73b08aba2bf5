//! Boundary traits for the transports a [`Node`](crate::Node) drives
//!
//! An [`EventSource`] holds the streaming connection and invokes callbacks from its own
//! tasks. A [`QueryClient`] issues request/response calls. Both are shared behind `Arc`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{QueryError, SourceError};
use crate::events::{EventData, EventType, StatusResult, ValidatorsResult};

/// Called with every decoded event of a subscription
pub type EventCallback = Arc<dyn Fn(EventData) + Send + Sync>;
/// Called with the block latency in nanoseconds
pub type LatencyCallback = Arc<dyn Fn(f64) + Send + Sync>;
/// Called when the connection drops without `stop` being requested
pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open the connection. Restarting re-issues every existing subscription.
    async fn start(&self) -> Result<(), SourceError>;

    /// Close the connection without firing the disconnect callback
    async fn stop(&self);

    fn register_latency_callback(&self, callback: LatencyCallback);

    fn register_disconnect_callback(&self, callback: DisconnectCallback);

    async fn subscribe(&self, event: EventType, callback: EventCallback) -> Result<(), SourceError>;

    async fn unsubscribe(&self, event: EventType) -> Result<(), SourceError>;
}

#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn validators(&self) -> Result<ValidatorsResult, QueryError>;

    async fn status(&self) -> Result<StatusResult, QueryError>;
}
