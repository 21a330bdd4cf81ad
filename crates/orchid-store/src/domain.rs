// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orchid_config::{AgentCategory, ExecutionMode, PermissionRule, ToolFilter};

use crate::StoreError;

/// A project: a directory on disk that scopes sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub root_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A conversation thread scoped to one project.
///
/// Holds the active agent XOR the active pipeline; the store enforces that
/// setting one clears the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: i64,
    pub title: Option<String>,
    pub active_agent_id: Option<String>,
    pub active_pipeline_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conversation role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            "system" => Ok(Role::System),
            other => Err(StoreError::InvalidInput(format!("unknown role: {other}"))),
        }
    }
}

/// Provider-reported token usage, persisted for display and billing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    pub reasoning: u32,
    pub cache_read: u32,
    pub cache_write: u32,
}

/// One turn in a conversation.  Content lives in parts, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub agent_id: Option<String>,
    pub model_id: Option<String>,
    pub provider_id: Option<String>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    pub is_compacted: bool,
    pub parent_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(session_id: impl Into<String>, role: Role) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            role,
            agent_id: None,
            model_id: None,
            provider_id: None,
            usage: None,
            finish_reason: None,
            is_compacted: false,
            parent_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A configured agent persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    /// Lowercase `[a-z0-9-]+`, unique across the roster.
    pub slug: String,
    pub name: String,
    pub category: AgentCategory,
    pub provider_id: String,
    pub model_id: String,
    pub system_prompt: String,
    /// Substituted into the system prompt as `{{key}}`.
    #[serde(default)]
    pub prompt_variables: HashMap<String, String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    pub max_iterations: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub can_spawn_subagents: bool,
    /// Empty list means "any subagent".
    #[serde(default)]
    pub allowed_subagent_types: Vec<String>,
    #[serde(default)]
    pub tools: ToolFilter,
    #[serde(default)]
    pub permissions: Vec<PermissionRule>,
}

impl Agent {
    /// Validate the slug shape: lowercase `[a-z0-9-]+`.
    pub fn slug_is_valid(slug: &str) -> bool {
        !slug.is_empty()
            && slug
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    }
}

/// Lifecycle state of a subagent execution.  Also used by the `subtask`
/// part variant in the parent conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubSessionStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubSessionStatus::Pending => "pending",
            SubSessionStatus::Queued => "queued",
            SubSessionStatus::Running => "running",
            SubSessionStatus::Completed => "completed",
            SubSessionStatus::Failed => "failed",
            SubSessionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::InvalidInput(format!(
                "unknown sub-session status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubSessionStatus::Completed | SubSessionStatus::Failed | SubSessionStatus::Cancelled
        )
    }

    /// Allowed forward transitions; terminal states absorb.
    pub fn can_transition(self, to: SubSessionStatus) -> bool {
        use SubSessionStatus::*;
        matches!(
            (self, to),
            (Pending, Queued)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

/// Persisted record of one subagent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubSession {
    pub id: String,
    pub parent_session_id: String,
    pub parent_message_id: String,
    /// Slug of the subagent's Agent record.
    pub agent_type: String,
    pub status: SubSessionStatus,
    pub prompt: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub effective_permissions: Vec<PermissionRule>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
