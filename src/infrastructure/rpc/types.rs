//! Line-delimited JSON-RPC 2.0 message shapes.
//!
//! One JSON object per line, UTF-8, `\n` terminated, no other framing.
//! A message is a request (numeric `id` + `method`), a notification
//! (`method`, no `id`), or a response (`id` and exactly one of
//! `result`/`error`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Outbound notification (no id, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Error object carried in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One parsed inbound line, before classification.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

/// What an inbound line turned out to be.
#[derive(Debug)]
pub enum Inbound {
    Response {
        id: u64,
        result: Result<Value, RpcErrorObject>,
    },
    Notification {
        method: String,
        params: Value,
    },
    /// Server-initiated request; not part of this dialect, logged and
    /// ignored by the client.
    ServerRequest {
        id: u64,
        method: String,
    },
}

impl IncomingMessage {
    pub fn classify(self) -> Option<Inbound> {
        match (self.id, self.method) {
            (Some(id), None) => {
                let result = match (self.result, self.error) {
                    (_, Some(error)) => Err(error),
                    (Some(result), None) => Ok(result),
                    (None, None) => Ok(Value::Null),
                };
                Some(Inbound::Response { id, result })
            }
            (None, Some(method)) => Some(Inbound::Notification {
                method,
                params: self.params.unwrap_or(Value::Null),
            }),
            (Some(id), Some(method)) => Some(Inbound::ServerRequest { id, method }),
            (None, None) => None,
        }
    }
}
