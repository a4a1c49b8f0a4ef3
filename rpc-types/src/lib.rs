//! The wire envelope for the bidirectional RPC transport (spec.md §3, §6).
//!
//! Deliberately shaped like JSON-RPC 2.0's request/response/notification
//! split (mirroring `mcp-types::JSONRPCMessage` in spirit) without adopting
//! MCP tool-call semantics: this crate only knows about `{id, method, args}`
//! requests and `{id, result | error}` responses, plus one-way
//! notifications used for capability callbacks.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Correlates a response (or notification-style callback invocation) with
/// its originating request. Opaque and unique per RPC connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Integer(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Integer(i) => write!(f, "{i}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

/// A single frame exchanged over the wire. Untagged so that a request,
/// response, notification, or error all deserialize from the same JSON
/// shape the transport reads off the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
    Error(RpcErrorFrame),
    Notification(RpcNotification),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: RequestId,
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: RequestId,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorFrame {
    pub id: RequestId,
    pub error: RpcErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// One-way capability callback invocation (`onMessage`, `onTodoUpdate`, ...).
/// Carries no id: the caller never correlates a response to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    /// Opaque handle id for the capability object this notification targets.
    pub capability_id: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// Standard error codes used on the structured error taxonomy of spec.md §7.
pub mod error_codes {
    pub const INVALID_ARGUMENT: i32 = -32001;
    pub const NOT_FOUND: i32 = -32002;
    pub const SANDBOX_ERROR: i32 = -32003;
    pub const TIMEOUT: i32 = -32004;
    pub const INTERNAL: i32 = -32000;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let req = RpcRequest {
            id: RequestId::Integer(7),
            method: "createSession".to_string(),
            args: vec![serde_json::json!({"cwd": "/w"})],
        };
        let json = serde_json::to_string(&req).unwrap();
        let msg: RpcMessage = serde_json::from_str(&json).unwrap();
        match msg {
            RpcMessage::Request(r) => assert_eq!(r.method, "createSession"),
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn request_id_display_matches_variant() {
        assert_eq!(RequestId::Integer(3).to_string(), "3");
        assert_eq!(RequestId::String("abc".to_string()).to_string(), "abc");
    }
}
