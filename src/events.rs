//! Agent event model.
//!
//! The in-sandbox agent emits an SSE sequence with known event kinds;
//! payloads are heterogeneous JSON. Each kind gets its own variant so
//! the relay can tap the ones it cares about (`tool_result`, `done`,
//! `error`) without decoding the rest. Unknown kinds are logged and
//! forwarded undecoded for forward-compatibility.

use serde_json::Value;

use crate::error::WorkspaceError;

/// One event from the agent stream, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Init(Value),
    Assistant(Value),
    Thinking(Value),
    ToolCall(Value),
    ToolResult(Value),
    Title(Value),
    /// Emitted by the relay (never by the agent) when a turn restarts
    /// on a fresh sandbox after a crash.
    ContainerRecovered(Value),
    Done(Value),
    Error(Value),
    Unknown { kind: String, payload: Value },
}

impl AgentEvent {
    /// Build from a decoded SSE frame. The data field is parsed as
    /// JSON; non-JSON data is preserved as a string payload.
    pub fn from_sse(kind: &str, data: &str) -> Self {
        let payload =
            serde_json::from_str::<Value>(data).unwrap_or_else(|_| Value::String(data.to_string()));
        match kind {
            "init" => AgentEvent::Init(payload),
            "assistant" => AgentEvent::Assistant(payload),
            "thinking" => AgentEvent::Thinking(payload),
            "tool_call" => AgentEvent::ToolCall(payload),
            "tool_result" => AgentEvent::ToolResult(payload),
            "title" => AgentEvent::Title(payload),
            "container_recovered" => AgentEvent::ContainerRecovered(payload),
            "done" => AgentEvent::Done(payload),
            "error" => AgentEvent::Error(payload),
            other => {
                tracing::debug!(kind = other, "forwarding unknown agent event kind");
                AgentEvent::Unknown {
                    kind: other.to_string(),
                    payload,
                }
            }
        }
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &str {
        match self {
            AgentEvent::Init(_) => "init",
            AgentEvent::Assistant(_) => "assistant",
            AgentEvent::Thinking(_) => "thinking",
            AgentEvent::ToolCall(_) => "tool_call",
            AgentEvent::ToolResult(_) => "tool_result",
            AgentEvent::Title(_) => "title",
            AgentEvent::ContainerRecovered(_) => "container_recovered",
            AgentEvent::Done(_) => "done",
            AgentEvent::Error(_) => "error",
            AgentEvent::Unknown { kind, .. } => kind,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            AgentEvent::Init(v)
            | AgentEvent::Assistant(v)
            | AgentEvent::Thinking(v)
            | AgentEvent::ToolCall(v)
            | AgentEvent::ToolResult(v)
            | AgentEvent::Title(v)
            | AgentEvent::ContainerRecovered(v)
            | AgentEvent::Done(v)
            | AgentEvent::Error(v)
            | AgentEvent::Unknown { payload: v, .. } => v,
        }
    }

    /// A turn ends at the first terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::Done(_) | AgentEvent::Error(_))
    }

    /// Terminal error event carrying a stable machine code.
    pub fn error_from(err: &WorkspaceError) -> Self {
        AgentEvent::Error(serde_json::json!({
            "code": err.code(),
            "message": err.to_string(),
        }))
    }

    /// Crash-recovery boundary marker.
    pub fn recovered(reason: &str) -> Self {
        AgentEvent::ContainerRecovered(serde_json::json!({ "reason": reason }))
    }
}

/// Event as re-emitted to the caller, with sequencing metadata added.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEvent {
    pub seq: u64,
    /// Unix epoch milliseconds at relay time.
    pub timestamp: i64,
    pub event: AgentEvent,
}

impl RelayEvent {
    /// JSON form: `{seq, timestamp, event, ...payload}`. Object
    /// payloads are flattened next to the metadata; anything else rides
    /// under a `data` field.
    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        object.insert("seq".to_string(), Value::from(self.seq));
        object.insert("timestamp".to_string(), Value::from(self.timestamp));
        object.insert("event".to_string(), Value::from(self.event.kind()));
        match self.event.payload() {
            Value::Object(fields) => {
                for (key, value) in fields {
                    object.insert(key.clone(), value.clone());
                }
            }
            Value::Null => {}
            other => {
                object.insert("data".to_string(), other.clone());
            }
        }
        Value::Object(object)
    }

    /// SSE wire framing for the HTTP surface.
    pub fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event.kind(), self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_kinds_roundtrip() {
        for kind in [
            "init",
            "assistant",
            "thinking",
            "tool_call",
            "tool_result",
            "title",
            "container_recovered",
            "done",
            "error",
        ] {
            let event = AgentEvent::from_sse(kind, r#"{"x":1}"#);
            assert_eq!(event.kind(), kind);
            assert!(!matches!(event, AgentEvent::Unknown { .. }));
        }
    }

    #[test]
    fn test_unknown_kind_is_forwarded_undecoded() {
        let event = AgentEvent::from_sse("telemetry_v2", r#"{"cpu":0.5}"#);
        match &event {
            AgentEvent::Unknown { kind, payload } => {
                assert_eq!(kind, "telemetry_v2");
                assert_eq!(payload["cpu"], 0.5);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
        assert_eq!(event.kind(), "telemetry_v2");
    }

    #[test]
    fn test_non_json_data_kept_as_string() {
        let event = AgentEvent::from_sse("assistant", "plain text chunk");
        assert_eq!(
            event.payload(),
            &Value::String("plain text chunk".to_string())
        );
    }

    #[test]
    fn test_terminal_classification() {
        assert!(AgentEvent::from_sse("done", "{}").is_terminal());
        assert!(AgentEvent::from_sse("error", "{}").is_terminal());
        assert!(!AgentEvent::from_sse("tool_result", "{}").is_terminal());
        assert!(!AgentEvent::recovered("agent died").is_terminal());
    }

    #[test]
    fn test_relay_event_flattens_object_payload() {
        let relay = RelayEvent {
            seq: 7,
            timestamp: 1_700_000_000_000,
            event: AgentEvent::from_sse("tool_result", r#"{"tool":"bash","exit_code":0}"#),
        };
        let json = relay.to_json();
        assert_eq!(json["seq"], 7);
        assert_eq!(json["event"], "tool_result");
        assert_eq!(json["tool"], "bash");
        assert_eq!(json["exit_code"], 0);
    }

    #[test]
    fn test_relay_event_wraps_scalar_payload() {
        let relay = RelayEvent {
            seq: 1,
            timestamp: 0,
            event: AgentEvent::Assistant(Value::String("hi".into())),
        };
        let json = relay.to_json();
        assert_eq!(json["data"], "hi");
    }

    #[test]
    fn test_sse_frame_shape() {
        let relay = RelayEvent {
            seq: 2,
            timestamp: 0,
            event: AgentEvent::Done(serde_json::json!({"usage": {"tokens": 10}})),
        };
        let frame = relay.to_sse_frame();
        assert!(frame.starts_with("event: done\ndata: {"));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn test_error_event_carries_code() {
        let event = AgentEvent::error_from(&WorkspaceError::ShuttingDown);
        assert_eq!(event.payload()["code"], "shutting-down");
    }
}
