//! The agent-output event taxonomy (spec.md §3), matching the tagged-union
//! style of `codex-rs/protocol/src/protocol.rs`'s `EventMsg`: one variant
//! struct per kind rather than inline fields, so new fields on one kind
//! never ripple into `match` arms for the others.

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    Success,
    ErrorMaxTurns,
    ErrorDuringExecution,
    ErrorMaxBudgetUsd,
    ErrorMaxStructuredOutputRetries,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// One line of NDJSON output from the child agent process, already parsed
/// into a typed value. Every variant carries `session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    System {
        subtype: String,
        session_id: String,
        #[serde(flatten)]
        extra: serde_json::Value,
    },
    Assistant {
        session_id: String,
        uuid: Option<Uuid>,
        message: MessageBody,
    },
    User {
        session_id: String,
        uuid: Option<Uuid>,
        message: MessageBody,
    },
    Result {
        session_id: String,
        uuid: Option<Uuid>,
        subtype: ResultSubtype,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        duration_ms: u64,
        #[serde(default)]
        duration_api_ms: u64,
        #[serde(default)]
        num_turns: u64,
        #[serde(default)]
        total_cost_usd: f64,
        #[serde(default)]
        usage: UsageCounters,
        #[serde(default)]
        result: String,
    },
    StreamEvent {
        session_id: String,
        #[serde(flatten)]
        raw: serde_json::Value,
    },
    /// An agent-emitted line whose `type` tag didn't match any of the
    /// variants above. Carried through rather than dropped (spec.md §4.2):
    /// `raw` is the full original JSON value, `type` included.
    Unknown {
        session_id: String,
        raw: serde_json::Value,
    },
}

impl Event {
    pub fn session_id(&self) -> &str {
        match self {
            Event::System { session_id, .. }
            | Event::Assistant { session_id, .. }
            | Event::User { session_id, .. }
            | Event::Result { session_id, .. }
            | Event::StreamEvent { session_id, .. }
            | Event::Unknown { session_id, .. } => session_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::System { .. } => "system",
            Event::Assistant { .. } => "assistant",
            Event::User { .. } => "user",
            Event::Result { .. } => "result",
            Event::StreamEvent { .. } => "stream_event",
            Event::Unknown { .. } => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn result_event_round_trips() {
        let json = serde_json::json!({
            "type": "result",
            "subtype": "success",
            "session_id": "s1",
            "uuid": null,
            "duration_ms": 10,
            "duration_api_ms": 8,
            "is_error": false,
            "num_turns": 1,
            "total_cost_usd": 0,
            "usage": {"input_tokens": 1, "output_tokens": 1},
            "result": "",
        });
        let event: Event = serde_json::from_value(json).unwrap();
        match &event {
            Event::Result { is_error, .. } => assert!(!is_error),
            other => panic!("unexpected variant: {other:?}"),
        }
        assert_eq!(event.session_id(), "s1");
        assert_eq!(event.kind(), "result");
    }

    #[test]
    fn unknown_event_round_trips_and_keeps_its_raw_payload() {
        let raw = serde_json::json!({"type": "thinking_delta", "session_id": "s1", "text": "..."});
        let event = Event::Unknown {
            session_id: "s1".to_string(),
            raw: raw.clone(),
        };
        assert_eq!(event.session_id(), "s1");
        assert_eq!(event.kind(), "unknown");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "unknown");
        assert_eq!(json["raw"], raw);
    }
}
