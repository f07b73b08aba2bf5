//! WebSocket JSON-RPC transport for Tendermint-style nodes
//!
//! - [`WsEventSource`]: long-lived subscription connection
//! - [`WsRpcClient`]: one connection per request/response call

mod ws_client;
mod ws_source;

pub use ws_client::WsRpcClient;
pub use ws_source::WsEventSource;

/// Connection state of a [`WsEventSource`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsState {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

impl WsState {
    pub fn is_connected(&self) -> bool {
        matches!(self, WsState::Connected)
    }
}

/// Normalize a node address into its WebSocket RPC endpoint
///
/// `host:26657`, `tcp://host:26657` and `http://host:26657` all map to
/// `ws://host:26657/websocket`; explicit `ws://` / `wss://` URLs with a path are kept.
pub fn websocket_url(addr: &str) -> String {
    let (scheme, rest) = match addr.split_once("://") {
        Some(("https" | "wss", rest)) => ("wss", rest),
        Some((_, rest)) => ("ws", rest),
        None => ("ws", addr),
    };
    if rest.contains('/') {
        format!("{scheme}://{rest}")
    } else {
        format!("{scheme}://{rest}/websocket")
    }
}

fn request(id: u64, method: &str, params: serde_json::Value) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url() {
        assert_eq!(websocket_url("localhost:26657"), "ws://localhost:26657/websocket");
        assert_eq!(websocket_url("tcp://10.0.0.1:26657"), "ws://10.0.0.1:26657/websocket");
        assert_eq!(websocket_url("https://rpc.example.com"), "wss://rpc.example.com/websocket");
        assert_eq!(websocket_url("ws://node:1/custom"), "ws://node:1/custom");
    }

    #[test]
    fn test_request_shape() {
        let req: serde_json::Value =
            serde_json::from_str(&request(7, "validators", serde_json::json!({}))).unwrap();
        assert_eq!(req["jsonrpc"], "2.0");
        assert_eq!(req["id"], 7);
        assert_eq!(req["method"], "validators");
    }
}
