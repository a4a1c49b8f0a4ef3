//! Incremental NDJSON parser and the derivers that turn the raw event
//! sequence into `todo-update` / `plan-update` / `tool-use` / `result`
//! events (spec.md §4.2).
//!
//! The parser never raises on malformed input: a bad line is logged and
//! skipped, and parsing never advances past a line boundary so a
//! subsequent good line still parses correctly (spec.md §4.2 edge policy,
//! property 4 in §8).

use orchestrator_protocol::Event;
use orchestrator_protocol::PlanUpdate;
use orchestrator_protocol::ResultSubtype;
use orchestrator_protocol::TodoItem;
use orchestrator_protocol::TodoStatus;
use orchestrator_protocol::TodoUpdate;
use orchestrator_protocol::ToolUseEvent;

/// Lines longer than this are treated as a parse error for that line
/// rather than growing the buffer without bound (spec.md §9 Open Question).
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental NDJSON -> `Event` parser. One instance per session's log
/// stream.
pub struct NdjsonParser {
    buffer: Vec<u8>,
    line_number: u64,
    session_id: String,
}

impl NdjsonParser {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            buffer: Vec::new(),
            line_number: 0,
            session_id: session_id.into(),
        }
    }

    /// Feed a new chunk of bytes and return every complete event parsed
    /// out of it. The trailing partial line (if any) is retained in the
    /// internal buffer for the next call.
    pub fn parse(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            // Drop the trailing '\n'.
            let line = &line[..line.len() - 1];
            self.line_number += 1;
            if let Some(event) = self.parse_line(line) {
                events.push(event);
            }
        }

        events
    }

    /// Attempt to parse whatever is left in the buffer (a line with no
    /// trailing newline) once the stream has ended.
    pub fn flush(&mut self) -> Vec<Event> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        self.line_number += 1;
        let line = std::mem::take(&mut self.buffer);
        self.parse_line(&line).into_iter().collect()
    }

    fn parse_line(&self, line: &[u8]) -> Option<Event> {
        if line.is_empty() {
            return None;
        }
        if line.len() > MAX_LINE_BYTES {
            tracing::warn!(
                session_id = %self.session_id,
                line = self.line_number,
                len = line.len(),
                "dropping NDJSON line exceeding max length"
            );
            return None;
        }

        let value: serde_json::Value = match serde_json::from_slice(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    line = self.line_number,
                    error = %e,
                    "skipping malformed NDJSON line"
                );
                return None;
            }
        };

        let Some(ty) = value.get("type").and_then(|v| v.as_str()) else {
            tracing::warn!(
                session_id = %self.session_id,
                line = self.line_number,
                "skipping line with no `type` field"
            );
            return None;
        };

        if !matches!(ty, "system" | "assistant" | "user" | "result" | "stream_event") {
            tracing::warn!(
                session_id = %self.session_id,
                line = self.line_number,
                r#type = ty,
                "unrecognized event type; passing through"
            );
            let session_id = value
                .get("session_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| self.session_id.clone());
            return Some(Event::Unknown { session_id, raw: value });
        }

        match serde_json::from_value::<Event>(value) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    line = self.line_number,
                    error = %e,
                    "skipping line that failed typed event parse"
                );
                None
            }
        }
    }
}

/// Extract every `todo-update` implied by `TodoWrite` tool-use blocks in
/// assistant messages.
pub fn extract_todo_updates(events: &[Event]) -> Vec<TodoUpdate> {
    let mut out = Vec::new();
    for event in events {
        let Event::Assistant {
            session_id,
            message,
            ..
        } = event
        else {
            continue;
        };
        for block in &message.content {
            if let orchestrator_protocol::ContentBlock::ToolUse { name, input, .. } = block
                && name == "TodoWrite"
                && let Some(todos) = input.get("todos").and_then(|v| v.as_array())
            {
                let todos: Vec<TodoItem> = todos
                    .iter()
                    .filter_map(|t| {
                        let content = t.get("content")?.as_str()?.to_string();
                        let active_form = t.get("active_form")?.as_str()?.to_string();
                        let status = match t.get("status")?.as_str()? {
                            "pending" => TodoStatus::Pending,
                            "in_progress" => TodoStatus::InProgress,
                            "completed" => TodoStatus::Completed,
                            _ => return None,
                        };
                        Some(TodoItem {
                            content,
                            status,
                            active_form,
                        })
                    })
                    .collect();
                out.push(TodoUpdate {
                    session_id: session_id.clone(),
                    todos,
                });
            }
        }
    }
    out
}

/// Extract every `plan-update` implied by `ExitPlanMode` tool-use blocks
/// and by `Write` calls targeting `.claude/plans/*.md`.
pub fn extract_plan_updates(events: &[Event]) -> Vec<PlanUpdate> {
    let mut out = Vec::new();
    for event in events {
        let Event::Assistant {
            session_id,
            message,
            ..
        } = event
        else {
            continue;
        };
        for block in &message.content {
            let orchestrator_protocol::ContentBlock::ToolUse { name, input, .. } = block else {
                continue;
            };
            if name == "ExitPlanMode" {
                if let Some(plan) = input.get("plan").and_then(|v| v.as_str()) {
                    out.push(PlanUpdate {
                        session_id: session_id.clone(),
                        plan: plan.to_string(),
                        plan_file: None,
                    });
                }
            } else if name == "Write"
                && let Some(path) = input.get("file_path").and_then(|v| v.as_str())
                && is_plan_file_path(path)
                && let Some(content) = input.get("content").and_then(|v| v.as_str())
            {
                out.push(PlanUpdate {
                    session_id: session_id.clone(),
                    plan: content.to_string(),
                    plan_file: Some(path.to_string()),
                });
            }
        }
    }
    out
}

fn is_plan_file_path(path: &str) -> bool {
    path.contains("/.claude/plans/") && path.ends_with(".md")
}

/// Extract a `tool-use` event for every `tool_use` content block, in every
/// assistant message, in arrival order. The same tool-use id may appear
/// more than once across chunks and is emitted every time; callers dedupe
/// if they want to.
pub fn extract_tool_uses(events: &[Event]) -> Vec<ToolUseEvent> {
    let mut out = Vec::new();
    for event in events {
        let Event::Assistant {
            session_id,
            message,
            ..
        } = event
        else {
            continue;
        };
        for block in &message.content {
            if let orchestrator_protocol::ContentBlock::ToolUse { id, name, input } = block {
                out.push(ToolUseEvent {
                    session_id: session_id.clone(),
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
            }
        }
    }
    out
}

/// Scan from the end for the first `result` event.
pub fn extract_result(events: &[Event]) -> Option<&Event> {
    events.iter().rev().find(|e| matches!(e, Event::Result { .. }))
}

/// The first `system` event with `subtype = "init"`.
pub fn extract_session_id(events: &[Event]) -> Option<&str> {
    events.iter().find_map(|e| match e {
        Event::System { subtype, session_id, .. } if subtype == "init" => Some(session_id.as_str()),
        _ => None,
    })
}

pub fn is_complete(events: &[Event]) -> bool {
    extract_result(events).is_some()
}

pub fn has_error(events: &[Event]) -> bool {
    matches!(extract_result(events), Some(Event::Result { is_error: true, .. }))
        || extract_result(events)
            .is_some_and(|e| matches!(e, Event::Result { subtype, .. } if *subtype != ResultSubtype::Success))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(json: serde_json::Value) -> Vec<u8> {
        let mut s = json.to_string();
        s.push('\n');
        s.into_bytes()
    }

    #[test]
    fn chunking_does_not_change_the_parsed_sequence() {
        let lines = vec![
            serde_json::json!({"type":"system","subtype":"init","session_id":"s1"}),
            serde_json::json!({
                "type":"assistant","session_id":"s1","uuid":null,
                "message":{"role":"assistant","content":[{"type":"text","text":"ok"}]}
            }),
            serde_json::json!({
                "type":"result","subtype":"success","session_id":"s1","uuid":null,
                "duration_ms":10,"duration_api_ms":8,"is_error":false,"num_turns":1,
                "total_cost_usd":0.0,"usage":{"input_tokens":1,"output_tokens":1},"result":""
            }),
        ];
        let mut whole = Vec::new();
        for l in &lines {
            whole.extend(line(l.clone()));
        }

        let mut one_shot = NdjsonParser::new("s1");
        let all_at_once = one_shot.parse(&whole);

        let mut byte_at_a_time = NdjsonParser::new("s1");
        let mut chunked = Vec::new();
        for b in &whole {
            chunked.extend(byte_at_a_time.parse(std::slice::from_ref(b)));
        }

        assert_eq!(all_at_once.len(), chunked.len());
        assert_eq!(all_at_once.len(), 3);
    }

    #[test]
    fn malformed_line_is_skipped_without_derailing_later_lines() {
        let mut parser = NdjsonParser::new("s1");
        let mut input = b"not json at all\n".to_vec();
        input.extend(line(
            serde_json::json!({"type":"system","subtype":"init","session_id":"s1"}),
        ));
        let events = parser.parse(&input);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn flush_parses_trailing_partial_line() {
        let mut parser = NdjsonParser::new("s1");
        let json = serde_json::json!({"type":"system","subtype":"init","session_id":"s1"});
        let bytes = json.to_string().into_bytes();
        assert!(parser.parse(&bytes).is_empty());
        let flushed = parser.flush();
        assert_eq!(flushed.len(), 1);
    }

    #[test]
    fn unrecognized_event_type_is_passed_through_as_unknown() {
        let mut parser = NdjsonParser::new("s1");
        let events = parser.parse(&line(
            serde_json::json!({"type":"thinking_delta","session_id":"s1","text":"..."}),
        ));
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Unknown { session_id, raw } => {
                assert_eq!(session_id, "s1");
                assert_eq!(raw["type"], "thinking_delta");
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn extract_result_scans_from_the_end() {
        let events = vec![
            Event::System {
                subtype: "init".into(),
                session_id: "s1".into(),
                extra: serde_json::Value::Null,
            },
            Event::Result {
                session_id: "s1".into(),
                uuid: None,
                subtype: ResultSubtype::Success,
                is_error: false,
                duration_ms: 1,
                duration_api_ms: 1,
                num_turns: 1,
                total_cost_usd: 0.0,
                usage: Default::default(),
                result: "done".into(),
            },
        ];
        assert!(is_complete(&events));
        assert!(!has_error(&events));
        assert_eq!(extract_session_id(&events), Some("s1"));
    }
}
