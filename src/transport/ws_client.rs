//! Request/response JSON-RPC calls over WebSocket

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace};

use super::{request, websocket_url};
use crate::error::QueryError;
use crate::events::{StatusResult, ValidatorsResult};
use crate::source::QueryClient;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Value,
}

/// Query client that opens a fresh connection per call
///
/// Every call is bounded by the configured timeout, connection setup included.
pub struct WsRpcClient {
    url: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl WsRpcClient {
    pub fn new(addr: &str, timeout: Duration) -> Self {
        Self {
            url: websocket_url(addr),
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, QueryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let result = tokio::time::timeout(self.timeout, self.round_trip(id, method, params))
            .await
            .map_err(|_| QueryError::Timeout {
                method: method.to_string(),
            })??;
        Ok(serde_json::from_value(result)?)
    }

    async fn round_trip(&self, id: u64, method: &str, params: Value) -> Result<Value, QueryError> {
        trace!(url = %self.url, method, id, "RPC call");

        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| QueryError::Connect {
                addr: self.url.clone(),
                reason: e.to_string(),
            })?;

        ws.send(Message::Text(request(id, method, params).into()))
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        while let Some(frame) = ws.next().await {
            let frame = frame.map_err(|e| QueryError::Transport(e.to_string()))?;
            let Message::Text(text) = frame else {
                continue;
            };
            let response: RpcResponse = serde_json::from_str(&text)?;
            if response.id != Value::from(id) {
                trace!(id, got = %response.id, "Skipping unrelated frame");
                continue;
            }
            // Best effort; the answer is already in hand
            let _ = ws.close(None).await;

            if let Some(err) = response.error {
                debug!(method, code = err.code, data = %err.data, "RPC error");
                return Err(QueryError::Rpc {
                    code: err.code,
                    message: err.message,
                });
            }
            return Ok(response.result);
        }
        Err(QueryError::Closed)
    }
}

#[async_trait]
impl QueryClient for WsRpcClient {
    async fn validators(&self) -> Result<ValidatorsResult, QueryError> {
        self.call("validators", serde_json::json!({})).await
    }

    async fn status(&self) -> Result<StatusResult, QueryError> {
        self.call("status", serde_json::json!({})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_with_error_object() {
        let response: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"Method not found","data":"validatorz"}}"#,
        )
        .unwrap();
        assert_eq!(response.id, Value::from(3u64));
        let err = response.error.unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "Method not found");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_fast() {
        let client = WsRpcClient::new("127.0.0.1:1", Duration::from_secs(5));
        let result = client.validators().await;
        assert!(matches!(
            result,
            Err(QueryError::Connect { .. }) | Err(QueryError::Timeout { .. })
        ));
    }
}
