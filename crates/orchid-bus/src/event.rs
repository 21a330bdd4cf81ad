// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Delivery wrapper around an [`Event`].
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Component that published the event (e.g. "agent-loop", "tool-registry").
    pub source: String,
    /// Present for every event whose semantics tie it to a session; enables
    /// session-scoped filtering without matching on the payload.
    pub session_id: Option<String>,
    pub event: Event,
}

impl Envelope {
    pub fn new(source: &str, event: Event) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: source.to_string(),
            session_id: event.session_id().map(|s| s.to_string()),
            event,
        }
    }
}

/// Which open-part cursor a stream chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Text,
    Reasoning,
}

/// Provider-reported usage attached to stream completion events.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageSummary {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub reasoning_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
}

/// The closed event taxonomy used by the core.
///
/// Consumers (frontends, the state API, tests) subscribe to these; every
/// component publishes through the same bus.  Variant tags are the
/// kebab-case event names surfaced to subscribers and the event log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    // ── Session lifecycle ────────────────────────────────────────────────
    SessionCreated {
        session_id: String,
    },
    SessionUpdated {
        session_id: String,
    },
    SessionActivated {
        session_id: String,
    },

    // ── Message lifecycle ────────────────────────────────────────────────
    MessageCreated {
        session_id: String,
        message_id: String,
        role: String,
    },
    StreamStarted {
        session_id: String,
        message_id: String,
    },
    StreamChunk {
        session_id: String,
        message_id: String,
        kind: ChunkKind,
        delta: String,
    },
    StreamCompleted {
        session_id: String,
        message_id: String,
        finish_reason: String,
        usage: Option<UsageSummary>,
    },
    MessageCompacted {
        session_id: String,
        message_id: String,
        compacted_count: u32,
    },

    // ── Part lifecycle ───────────────────────────────────────────────────
    PartCreated {
        session_id: String,
        message_id: String,
        part_id: String,
        kind: String,
    },
    PartUpdated {
        session_id: String,
        message_id: String,
        part_id: String,
        kind: String,
    },
    PartDeleted {
        session_id: String,
        message_id: String,
        part_id: String,
    },

    // ── Tool execution ───────────────────────────────────────────────────
    ToolExecutionStarted {
        session_id: String,
        message_id: String,
        part_id: String,
        tool_call_id: String,
        tool_name: String,
    },
    ToolExecutionProgress {
        session_id: String,
        tool_call_id: String,
        note: String,
    },
    ToolExecutionCompleted {
        session_id: String,
        message_id: String,
        part_id: String,
        tool_call_id: String,
        tool_name: String,
        is_error: bool,
    },

    // ── Permissions ──────────────────────────────────────────────────────
    PermissionRequested {
        session_id: String,
        tool_name: String,
        pattern: String,
    },
    PermissionGranted {
        session_id: String,
        tool_name: String,
        pattern: String,
        scope: String,
    },
    PermissionDenied {
        session_id: String,
        tool_name: String,
        pattern: String,
    },

    // ── Sub-sessions ─────────────────────────────────────────────────────
    SubSessionCreated {
        session_id: String,
        sub_session_id: String,
        agent_type: String,
    },
    SubSessionStatusChanged {
        session_id: String,
        sub_session_id: String,
        from: String,
        to: String,
    },
    SubSessionProgress {
        session_id: String,
        sub_session_id: String,
        part_kind: String,
        content: String,
    },
    SubSessionCompleted {
        session_id: String,
        sub_session_id: String,
    },
    SubSessionFailed {
        session_id: String,
        sub_session_id: String,
        error: String,
    },
    SubSessionCancelled {
        session_id: String,
        sub_session_id: String,
    },

    // ── Agent loop ───────────────────────────────────────────────────────
    AgentIterationStarted {
        session_id: String,
        iteration: u32,
    },
    AgentIterationCompleted {
        session_id: String,
        iteration: u32,
    },
    AgentMaxIterations {
        session_id: String,
        iterations: u32,
    },

    // ── System ───────────────────────────────────────────────────────────
    SystemError {
        component: String,
        code: String,
        message: String,
    },
    SystemWarning {
        component: String,
        message: String,
    },
    SystemMetric {
        name: String,
        value: f64,
    },
}

impl Event {
    /// Stable kebab-case name of this event, equal to the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::SessionCreated { .. } => "session-created",
            Event::SessionUpdated { .. } => "session-updated",
            Event::SessionActivated { .. } => "session-activated",
            Event::MessageCreated { .. } => "message-created",
            Event::StreamStarted { .. } => "stream-started",
            Event::StreamChunk { .. } => "stream-chunk",
            Event::StreamCompleted { .. } => "stream-completed",
            Event::MessageCompacted { .. } => "message-compacted",
            Event::PartCreated { .. } => "part-created",
            Event::PartUpdated { .. } => "part-updated",
            Event::PartDeleted { .. } => "part-deleted",
            Event::ToolExecutionStarted { .. } => "tool-execution-started",
            Event::ToolExecutionProgress { .. } => "tool-execution-progress",
            Event::ToolExecutionCompleted { .. } => "tool-execution-completed",
            Event::PermissionRequested { .. } => "permission-requested",
            Event::PermissionGranted { .. } => "permission-granted",
            Event::PermissionDenied { .. } => "permission-denied",
            Event::SubSessionCreated { .. } => "sub-session-created",
            Event::SubSessionStatusChanged { .. } => "sub-session-status-changed",
            Event::SubSessionProgress { .. } => "sub-session-progress",
            Event::SubSessionCompleted { .. } => "sub-session-completed",
            Event::SubSessionFailed { .. } => "sub-session-failed",
            Event::SubSessionCancelled { .. } => "sub-session-cancelled",
            Event::AgentIterationStarted { .. } => "agent-iteration-started",
            Event::AgentIterationCompleted { .. } => "agent-iteration-completed",
            Event::AgentMaxIterations { .. } => "agent-max-iterations",
            Event::SystemError { .. } => "system-error",
            Event::SystemWarning { .. } => "system-warning",
            Event::SystemMetric { .. } => "system-metric",
        }
    }

    /// The session this event belongs to, when it has one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::SessionCreated { session_id }
            | Event::SessionUpdated { session_id }
            | Event::SessionActivated { session_id }
            | Event::MessageCreated { session_id, .. }
            | Event::StreamStarted { session_id, .. }
            | Event::StreamChunk { session_id, .. }
            | Event::StreamCompleted { session_id, .. }
            | Event::MessageCompacted { session_id, .. }
            | Event::PartCreated { session_id, .. }
            | Event::PartUpdated { session_id, .. }
            | Event::PartDeleted { session_id, .. }
            | Event::ToolExecutionStarted { session_id, .. }
            | Event::ToolExecutionProgress { session_id, .. }
            | Event::ToolExecutionCompleted { session_id, .. }
            | Event::PermissionRequested { session_id, .. }
            | Event::PermissionGranted { session_id, .. }
            | Event::PermissionDenied { session_id, .. }
            | Event::SubSessionCreated { session_id, .. }
            | Event::SubSessionStatusChanged { session_id, .. }
            | Event::SubSessionProgress { session_id, .. }
            | Event::SubSessionCompleted { session_id, .. }
            | Event::SubSessionFailed { session_id, .. }
            | Event::SubSessionCancelled { session_id, .. }
            | Event::AgentIterationStarted { session_id, .. }
            | Event::AgentIterationCompleted { session_id, .. }
            | Event::AgentMaxIterations { session_id, .. } => Some(session_id),
            Event::SystemError { .. }
            | Event::SystemWarning { .. }
            | Event::SystemMetric { .. } => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_copies_session_id_from_event() {
        let env = Envelope::new(
            "test",
            Event::SessionCreated {
                session_id: "s1".into(),
            },
        );
        assert_eq!(env.session_id.as_deref(), Some("s1"));
        assert!(!env.id.is_empty());
    }

    #[test]
    fn system_events_have_no_session() {
        let env = Envelope::new(
            "test",
            Event::SystemWarning {
                component: "bus".into(),
                message: "queue deep".into(),
            },
        );
        assert!(env.session_id.is_none());
    }

    #[test]
    fn kind_matches_serde_tag() {
        let e = Event::ToolExecutionStarted {
            session_id: "s".into(),
            message_id: "m".into(),
            part_id: "p".into(),
            tool_call_id: "c".into(),
            tool_name: "read_file".into(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"].as_str(), Some(e.kind()));
    }

    #[test]
    fn every_session_event_exposes_its_session() {
        let e = Event::SubSessionProgress {
            session_id: "parent".into(),
            sub_session_id: "sub".into(),
            part_kind: "text".into(),
            content: "working".into(),
        };
        assert_eq!(e.session_id(), Some("parent"));
    }
}
