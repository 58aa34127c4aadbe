//! Event model: the immutable records produced at the assistant edge.
//!
//! Events are typed per kind; only the tool-specific payload stays an opaque
//! key/value map. Once enqueued an event's content is never rewritten.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::QueueError;

/// Wall-clock milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Wall-clock seconds since the UNIX epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// What the edge observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    UserPrompt,
    PreTool,
    PostTool,
    PostToolFailure,
    SessionEnd,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::SessionStart => "session_start",
            EventKind::UserPrompt => "user_prompt",
            EventKind::PreTool => "pre_tool",
            EventKind::PostTool => "post_tool",
            EventKind::PostToolFailure => "post_tool_failure",
            EventKind::SessionEnd => "session_end",
        };
        f.write_str(s)
    }
}

/// Outcome of a completed tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
    Partial,
    Unknown,
}

/// One immutable record in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique id assigned at the edge.
    pub id: String,
    /// Milliseconds since the UNIX epoch; monotonic per producer.
    pub ts_ms: u64,
    pub kind: EventKind,
    /// Host assistant session id.
    pub session_id: String,
    /// Optional end-to-end attribution id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Tool name for pre/post tool events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Opaque tool-specific input payload.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub tool_input: Map<String, Value>,
    /// Opaque tool result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    /// Outcome status (post_tool / post_tool_failure only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeStatus>,
    /// Free text (user prompts, session markers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Event {
    /// Build a user-prompt event.
    pub fn user_prompt(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: fresh_id(),
            ts_ms: now_ms(),
            kind: EventKind::UserPrompt,
            session_id: session_id.into(),
            trace_id: None,
            tool_name: None,
            tool_input: Map::new(),
            tool_result: None,
            outcome: None,
            text: Some(text.into()),
        }
    }

    /// Build a pre-tool event.
    pub fn pre_tool(
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_input: Map<String, Value>,
    ) -> Self {
        Self {
            id: fresh_id(),
            ts_ms: now_ms(),
            kind: EventKind::PreTool,
            session_id: session_id.into(),
            trace_id: None,
            tool_name: Some(tool_name.into()),
            tool_input,
            tool_result: None,
            outcome: None,
            text: None,
        }
    }

    /// Build a post-tool event.
    pub fn post_tool(
        session_id: impl Into<String>,
        tool_name: impl Into<String>,
        outcome: OutcomeStatus,
        tool_result: Option<Value>,
    ) -> Self {
        let kind = if outcome == OutcomeStatus::Failure {
            EventKind::PostToolFailure
        } else {
            EventKind::PostTool
        };
        Self {
            id: fresh_id(),
            ts_ms: now_ms(),
            kind,
            session_id: session_id.into(),
            trace_id: None,
            tool_name: Some(tool_name.into()),
            tool_input: Map::new(),
            tool_result,
            outcome: Some(outcome),
            text: None,
        }
    }

    /// Build a session marker event.
    pub fn session_marker(session_id: impl Into<String>, start: bool) -> Self {
        Self {
            id: fresh_id(),
            ts_ms: now_ms(),
            kind: if start {
                EventKind::SessionStart
            } else {
                EventKind::SessionEnd
            },
            session_id: session_id.into(),
            trace_id: None,
            tool_name: None,
            tool_input: Map::new(),
            tool_result: None,
            outcome: None,
            text: None,
        }
    }

    /// Attach a trace id.
    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Schema validation for inbound records (HTTP and file ingestion).
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.id.is_empty() {
            return Err(QueueError::SchemaViolation {
                reason: "missing event id".into(),
            });
        }
        if self.session_id.is_empty() {
            return Err(QueueError::SchemaViolation {
                reason: "missing session id".into(),
            });
        }
        if self.ts_ms == 0 {
            return Err(QueueError::SchemaViolation {
                reason: "timestamp must be positive".into(),
            });
        }
        match self.kind {
            EventKind::PreTool | EventKind::PostTool | EventKind::PostToolFailure => {
                if self.tool_name.as_deref().unwrap_or("").is_empty() {
                    return Err(QueueError::SchemaViolation {
                        reason: format!("{} event without tool name", self.kind),
                    });
                }
            }
            EventKind::UserPrompt => {
                if self.text.as_deref().unwrap_or("").is_empty() {
                    return Err(QueueError::SchemaViolation {
                        reason: "user_prompt event without text".into(),
                    });
                }
            }
            EventKind::SessionStart | EventKind::SessionEnd => {}
        }
        if matches!(self.kind, EventKind::PostTool | EventKind::PostToolFailure)
            && self.outcome.is_none()
        {
            return Err(QueueError::SchemaViolation {
                reason: format!("{} event without outcome status", self.kind),
            });
        }
        Ok(())
    }

    /// The searchable text of an event: prompt text, else tool result text.
    pub fn surface_text(&self) -> &str {
        if let Some(t) = self.text.as_deref() {
            return t;
        }
        if let Some(Value::String(s)) = &self.tool_result {
            return s;
        }
        ""
    }
}

/// Generate an event id from timestamp + sub-second discriminator.
fn fresh_id() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("ev-{:x}-{:x}", now.as_secs(), now.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_prompt_round_trips_through_json() {
        let event = Event::user_prompt("s1", "remember this: always run tests");
        let line = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(back.kind, EventKind::UserPrompt);
        assert_eq!(back.session_id, "s1");
        assert_eq!(back.text.as_deref(), Some("remember this: always run tests"));
    }

    #[test]
    fn post_tool_failure_kind_follows_outcome() {
        let ok = Event::post_tool("s1", "Edit", OutcomeStatus::Success, None);
        assert_eq!(ok.kind, EventKind::PostTool);
        let bad = Event::post_tool("s1", "Edit", OutcomeStatus::Failure, None);
        assert_eq!(bad.kind, EventKind::PostToolFailure);
    }

    #[test]
    fn validate_rejects_missing_tool_name() {
        let mut event = Event::pre_tool("s1", "Bash", Map::new());
        event.tool_name = None;
        assert!(event.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_prompt() {
        let mut event = Event::user_prompt("s1", "text");
        event.text = Some(String::new());
        assert!(event.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_events() {
        assert!(Event::user_prompt("s1", "hello").validate().is_ok());
        assert!(Event::session_marker("s1", true).validate().is_ok());
        assert!(
            Event::post_tool("s1", "Read", OutcomeStatus::Success, None)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn fresh_id_has_expected_shape() {
        let id = fresh_id();
        assert!(id.starts_with("ev-"));
        assert!(id.len() > 4);
    }
}
