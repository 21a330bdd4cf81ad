// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{StoreError, SubSessionStatus};

/// Discriminator of the part sum type; equal to the serde tag and the
/// storage discriminator column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    Text,
    Reasoning,
    Tool,
    File,
    Patch,
    Step,
    Agent,
    Retry,
    Snapshot,
    Compaction,
    Subtask,
}

impl PartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartKind::Text => "text",
            PartKind::Reasoning => "reasoning",
            PartKind::Tool => "tool",
            PartKind::File => "file",
            PartKind::Patch => "patch",
            PartKind::Step => "step",
            PartKind::Agent => "agent",
            PartKind::Retry => "retry",
            PartKind::Snapshot => "snapshot",
            PartKind::Compaction => "compaction",
            PartKind::Subtask => "subtask",
        }
    }
}

/// Lifecycle of a tool invocation part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Pending => "pending",
            ToolStatus::Running => "running",
            ToolStatus::Completed => "completed",
            ToolStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolStatus::Completed | ToolStatus::Error)
    }

    /// Allowed transitions: `Pending → Running → {Completed | Error}`,
    /// plus `Pending → Error` for calls failed before start (crash
    /// recovery, pre-start denial).  Never backwards.
    pub fn can_transition(self, to: ToolStatus) -> bool {
        use ToolStatus::*;
        matches!(
            (self, to),
            (Pending, Running) | (Pending, Error) | (Running, Completed) | (Running, Error)
        )
    }
}

/// Lifecycle of a step boundary marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn can_transition(self, to: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Completed)
                | (InProgress, Skipped)
                | (InProgress, Failed)
        )
    }
}

/// A tool invocation with its full lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPart {
    /// Unique within the session; forwarded verbatim from the provider.
    pub tool_call_id: String,
    pub tool_name: String,
    /// Human-readable title derived from the arguments.
    pub title: String,
    pub status: ToolStatus,
    /// JSON-encoded argument object as emitted by the model.
    pub input: String,
    /// Possibly truncated output; the full text lives at `spill_path`
    /// when `is_pruned` is set.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub is_pruned: bool,
    #[serde(default)]
    pub spill_path: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl ToolPart {
    pub fn pending(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        title: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            title: title.into(),
            status: ToolStatus::Pending,
            input: input.into(),
            output: None,
            is_pruned: false,
            spill_path: None,
            started_at: None,
            completed_at: None,
            error_message: None,
            error_code: None,
            attachments: Vec::new(),
        }
    }
}

/// Boundary marker before which messages were replaced by a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionPart {
    pub summary: String,
    pub compacted_message_count: u32,
    pub compacted_token_count: u64,
    pub compacted_at: DateTime<Utc>,
}

/// Reference to a subagent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskPart {
    pub sub_session_id: String,
    pub agent_type: String,
    pub prompt: String,
    pub status: SubSessionStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The polymorphic content of a message part.
///
/// Stored as a discriminator column + JSON payload; this enum is the only
/// shape the rest of the system sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartPayload {
    Text {
        content: String,
    },
    Reasoning {
        content: String,
    },
    Tool(ToolPart),
    File {
        path: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        size_bytes: Option<u64>,
    },
    Patch {
        file_path: String,
        old_content: String,
        new_content: String,
        unified_diff: String,
        additions: u32,
        deletions: u32,
    },
    Step {
        step_number: u32,
        status: StepStatus,
    },
    Agent {
        target_agent: String,
    },
    Retry {
        attempt: u32,
        reason: String,
        prior_error: String,
    },
    Snapshot {
        label: String,
        state: serde_json::Value,
    },
    Compaction(CompactionPart),
    Subtask(SubtaskPart),
}

impl PartPayload {
    pub fn kind(&self) -> PartKind {
        match self {
            PartPayload::Text { .. } => PartKind::Text,
            PartPayload::Reasoning { .. } => PartKind::Reasoning,
            PartPayload::Tool(_) => PartKind::Tool,
            PartPayload::File { .. } => PartKind::File,
            PartPayload::Patch { .. } => PartKind::Patch,
            PartPayload::Step { .. } => PartKind::Step,
            PartPayload::Agent { .. } => PartKind::Agent,
            PartPayload::Retry { .. } => PartKind::Retry,
            PartPayload::Snapshot { .. } => PartKind::Snapshot,
            PartPayload::Compaction(_) => PartKind::Compaction,
            PartPayload::Subtask(_) => PartKind::Subtask,
        }
    }

    /// Plain-text rendering used for progress forwarding and history
    /// embedding.  Tool parts render their output, patches their diff.
    pub fn display_text(&self) -> String {
        match self {
            PartPayload::Text { content } | PartPayload::Reasoning { content } => content.clone(),
            PartPayload::Tool(t) => t.output.clone().unwrap_or_default(),
            PartPayload::File { path, .. } => path.clone(),
            PartPayload::Patch { unified_diff, .. } => unified_diff.clone(),
            PartPayload::Step { step_number, .. } => format!("step {step_number}"),
            PartPayload::Agent { target_agent } => target_agent.clone(),
            PartPayload::Retry { reason, .. } => reason.clone(),
            PartPayload::Snapshot { label, .. } => label.clone(),
            PartPayload::Compaction(c) => c.summary.clone(),
            PartPayload::Subtask(s) => s.result.clone().unwrap_or_else(|| s.prompt.clone()),
        }
    }
}

/// One ordered part of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    pub id: String,
    pub message_id: String,
    pub session_id: String,
    /// 0-based, contiguous, unique within the message.
    pub order_index: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payload: PartPayload,
}

impl MessagePart {
    pub fn new(
        message_id: impl Into<String>,
        session_id: impl Into<String>,
        order_index: u32,
        payload: PartPayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            message_id: message_id.into(),
            session_id: session_id.into(),
            order_index,
            created_at: now,
            updated_at: now,
            payload,
        }
    }

    pub fn kind(&self) -> PartKind {
        self.payload.kind()
    }
}

/// Validate that replacing `old` with `new` respects the part type's state
/// machine.  Changing the variant of an existing part is always invalid.
pub fn validate_update(old: &MessagePart, new: &MessagePart) -> Result<(), StoreError> {
    if old.kind() != new.kind() {
        return Err(StoreError::InvalidTransition {
            part_id: old.id.clone(),
            from: old.kind().as_str().to_string(),
            to: new.kind().as_str().to_string(),
        });
    }
    let invalid = |from: String, to: String| StoreError::InvalidTransition {
        part_id: old.id.clone(),
        from,
        to,
    };
    match (&old.payload, &new.payload) {
        (PartPayload::Tool(a), PartPayload::Tool(b)) => {
            if a.status != b.status && !a.status.can_transition(b.status) {
                return Err(invalid(
                    a.status.as_str().to_string(),
                    b.status.as_str().to_string(),
                ));
            }
        }
        (PartPayload::Step { status: a, .. }, PartPayload::Step { status: b, .. }) => {
            if a != b && !a.can_transition(*b) {
                return Err(invalid(format!("{a:?}"), format!("{b:?}")));
            }
        }
        (PartPayload::Subtask(a), PartPayload::Subtask(b)) => {
            if a.status != b.status && !a.status.can_transition(b.status) {
                return Err(invalid(
                    a.status.as_str().to_string(),
                    b.status.as_str().to_string(),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Marker trait for typed part access: `Store::get_typed::<ToolPart>(id)`.
pub trait TypedPart: Sized {
    const KIND: PartKind;
    fn from_payload(payload: &PartPayload) -> Option<Self>;
}

impl TypedPart for ToolPart {
    const KIND: PartKind = PartKind::Tool;
    fn from_payload(payload: &PartPayload) -> Option<Self> {
        match payload {
            PartPayload::Tool(t) => Some(t.clone()),
            _ => None,
        }
    }
}

impl TypedPart for CompactionPart {
    const KIND: PartKind = PartKind::Compaction;
    fn from_payload(payload: &PartPayload) -> Option<Self> {
        match payload {
            PartPayload::Compaction(c) => Some(c.clone()),
            _ => None,
        }
    }
}

impl TypedPart for SubtaskPart {
    const KIND: PartKind = PartKind::Subtask;
    fn from_payload(payload: &PartPayload) -> Option<Self> {
        match payload {
            PartPayload::Subtask(s) => Some(s.clone()),
            _ => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn part(payload: PartPayload) -> MessagePart {
        MessagePart::new("m1", "s1", 0, payload)
    }

    fn tool_part(status: ToolStatus) -> MessagePart {
        let mut t = ToolPart::pending("c1", "read_file", "read_file", "{}");
        t.status = status;
        part(PartPayload::Tool(t))
    }

    // ── Tool transitions ──────────────────────────────────────────────────────

    #[test]
    fn tool_pending_to_running_is_allowed() {
        assert!(ToolStatus::Pending.can_transition(ToolStatus::Running));
    }

    #[test]
    fn tool_completed_to_running_is_rejected() {
        let old = tool_part(ToolStatus::Completed);
        let mut new = old.clone();
        if let PartPayload::Tool(t) = &mut new.payload {
            t.status = ToolStatus::Running;
        }
        assert!(matches!(
            validate_update(&old, &new),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn tool_update_without_status_change_is_allowed() {
        let old = tool_part(ToolStatus::Running);
        let mut new = old.clone();
        if let PartPayload::Tool(t) = &mut new.payload {
            t.output = Some("partial".into());
        }
        assert!(validate_update(&old, &new).is_ok());
    }

    #[test]
    fn every_tool_status_is_reachable_from_pending() {
        use ToolStatus::*;
        // pending -> running -> completed
        assert!(Pending.can_transition(Running) && Running.can_transition(Completed));
        // pending -> running -> error
        assert!(Running.can_transition(Error));
        // pending -> error (pre-start failure)
        assert!(Pending.can_transition(Error));
    }

    // ── Variant changes ───────────────────────────────────────────────────────

    #[test]
    fn changing_variant_is_rejected() {
        let old = part(PartPayload::Text {
            content: "x".into(),
        });
        let new = MessagePart {
            payload: PartPayload::Reasoning {
                content: "x".into(),
            },
            ..old.clone()
        };
        assert!(validate_update(&old, &new).is_err());
    }

    #[test]
    fn text_content_edits_are_allowed() {
        let old = part(PartPayload::Text {
            content: "he".into(),
        });
        let new = MessagePart {
            payload: PartPayload::Text {
                content: "hello".into(),
            },
            ..old.clone()
        };
        assert!(validate_update(&old, &new).is_ok());
    }

    // ── Serde round-trip (storage form) ──────────────────────────────────────

    #[test]
    fn payload_round_trips_through_json() {
        let samples = vec![
            PartPayload::Text {
                content: "hello".into(),
            },
            PartPayload::Reasoning {
                content: "thinking".into(),
            },
            PartPayload::Tool(ToolPart::pending("c1", "bash", "bash", "{\"cmd\":\"ls\"}")),
            PartPayload::Patch {
                file_path: "src/main.rs".into(),
                old_content: "a".into(),
                new_content: "b".into(),
                unified_diff: "-a\n+b".into(),
                additions: 1,
                deletions: 1,
            },
            PartPayload::Step {
                step_number: 3,
                status: StepStatus::InProgress,
            },
            PartPayload::Retry {
                attempt: 2,
                reason: "rate limit".into(),
                prior_error: "429".into(),
            },
            PartPayload::Compaction(CompactionPart {
                summary: "did things".into(),
                compacted_message_count: 12,
                compacted_token_count: 3400,
                compacted_at: Utc::now(),
            }),
            PartPayload::Subtask(SubtaskPart {
                sub_session_id: "sub1".into(),
                agent_type: "explore".into(),
                prompt: "find cfg".into(),
                status: SubSessionStatus::Running,
                result: None,
                error: None,
            }),
        ];
        for payload in samples {
            let json = serde_json::to_string(&payload).unwrap();
            let back: PartPayload = serde_json::from_str(&json).unwrap();
            assert_eq!(back, payload);
        }
    }

    #[test]
    fn payload_json_carries_the_kind_tag() {
        let p = PartPayload::Tool(ToolPart::pending("c1", "glob", "glob", "{}"));
        let v: serde_json::Value = serde_json::from_str(&serde_json::to_string(&p).unwrap()).unwrap();
        assert_eq!(v["type"].as_str(), Some("tool"));
    }

    // ── Typed access ──────────────────────────────────────────────────────────

    #[test]
    fn typed_part_extracts_matching_variant() {
        let payload = PartPayload::Tool(ToolPart::pending("c1", "grep", "grep", "{}"));
        assert!(ToolPart::from_payload(&payload).is_some());
        assert!(CompactionPart::from_payload(&payload).is_none());
    }
}
