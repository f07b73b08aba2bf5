//! Event and query payload types for Tendermint-style RPC endpoints
//!
//! This module contains:
//! - Event payloads delivered by an event source (block headers, ...)
//! - Query results returned by `validators` and `status`
//! - Lenient decoding: heights and counts arrive as strings or numbers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::EventError;

// ============================================================================
// Event Types
// ============================================================================

/// Event kinds the monitor knows how to subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    NewBlock,
    NewBlockHeader,
    Tx,
    Vote,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::NewBlock => "NewBlock",
            EventType::NewBlockHeader => "NewBlockHeader",
            EventType::Tx => "Tx",
            EventType::Vote => "Vote",
        }
    }

    /// Resolve a wire type tag such as `tendermint/event/NewBlockHeader`
    pub fn from_type_tag(tag: &str) -> Option<Self> {
        let name = tag.rsplit('/').next().unwrap_or(tag);
        match name {
            "NewBlock" | "new_block" => Some(EventType::NewBlock),
            "NewBlockHeader" | "new_block_header" => Some(EventType::NewBlockHeader),
            "Tx" | "tx" => Some(EventType::Tx),
            "Vote" | "vote" => Some(EventType::Vote),
            _ => None,
        }
    }

    /// Subscription query understood by the node's event bus
    pub fn query(self) -> String {
        format!("tm.event='{}'", self.as_str())
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Event Payloads
// ============================================================================

/// Header of a committed block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    #[serde(default)]
    pub chain_id: String,
    #[serde(deserialize_with = "de_u64")]
    pub height: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub num_txs: u64,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

impl BlockHeader {
    pub fn new(height: u64) -> Self {
        Self {
            chain_id: String::new(),
            height,
            num_txs: 0,
            time: None,
        }
    }
}

/// A decoded event as delivered to subscription callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    NewBlockHeader(BlockHeader),
    /// Any event this crate does not decode further
    Other { type_tag: String, value: Value },
}

impl EventData {
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            EventData::NewBlockHeader(_) => Some(EventType::NewBlockHeader),
            EventData::Other { type_tag, .. } => EventType::from_type_tag(type_tag),
        }
    }
}

/// Decode the `data` member of an event notification
///
/// Accepts both `{"type": .., "value": ..}` and the older `{"type": .., "data": ..}` shape.
pub fn parse_event_data(data: &Value) -> Result<EventData, EventError> {
    let type_tag = data["type"].as_str().ok_or(EventError::MissingType)?;
    let value = if data.get("value").is_some() {
        &data["value"]
    } else {
        &data["data"]
    };

    trace!(type_tag, "Decoding event payload");

    match EventType::from_type_tag(type_tag) {
        Some(EventType::NewBlockHeader) => {
            let mut header: BlockHeader = serde_json::from_value(value["header"].clone())
                .map_err(|source| EventError::Malformed {
                    event: type_tag.to_string(),
                    source,
                })?;
            // Newer nodes report the tx count next to the header instead of inside it
            if header.num_txs == 0 {
                if let Some(n) = value.get("num_txs").and_then(value_as_u64) {
                    header.num_txs = n;
                }
            }
            Ok(EventData::NewBlockHeader(header))
        }
        _ => Ok(EventData::Other {
            type_tag: type_tag.to_string(),
            value: value.clone(),
        }),
    }
}

// ============================================================================
// Query Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PubKey {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    #[serde(default)]
    pub address: String,
    pub pub_key: PubKey,
    #[serde(default, deserialize_with = "de_u64")]
    pub voting_power: u64,
}

/// Result of the `validators` query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorsResult {
    #[serde(deserialize_with = "de_u64")]
    pub block_height: u64,
    #[serde(default)]
    pub validators: Vec<Validator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorInfo {
    #[serde(default)]
    pub address: String,
    pub pub_key: PubKey,
}

/// Result of the `status` query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResult {
    #[serde(default)]
    pub validator_info: Option<ValidatorInfo>,
    /// Older nodes report the key at the top level
    #[serde(default)]
    pub pub_key: Option<PubKey>,
}

impl StatusResult {
    pub fn node_pub_key(&self) -> Option<&PubKey> {
        self.validator_info
            .as_ref()
            .map(|info| &info.pub_key)
            .or(self.pub_key.as_ref())
    }
}

// ============================================================================
// Decoding helpers
// ============================================================================

fn value_as_u64(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn de_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
