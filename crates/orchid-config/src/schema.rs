// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Path of the SQLite database file.  Defaults to
    /// `~/.local/share/orchid/orchid.db` (resolved at open time when unset).
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    /// When set, tracing output is written to this file instead of stderr.
    /// Interactive frontends own stderr, so file logging is the norm there.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Named provider configurations, keyed by provider id.
    ///
    /// ```yaml
    /// providers:
    ///   local:
    ///     kind: openai            # OpenAI-compatible wire format
    ///     base_url: http://localhost:11434/v1
    ///     model: llama3.2
    ///   anthropic:
    ///     kind: anthropic
    ///     api_key_env: ANTHROPIC_API_KEY
    ///     model: claude-sonnet-4-5
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Base permission rule set applied to every primary agent, evaluated
    /// together with the agent's own rules.  First match wins within the
    /// list; across rule layers the strictest action wins.
    #[serde(default)]
    pub permissions: Vec<PermissionRule>,
    /// MCP servers to connect at startup.  Their tools register under
    /// `mcp__{server}__{tool}`.
    #[serde(default)]
    pub mcp: Vec<McpServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Wire format: "openai" | "anthropic" | "mock".
    pub kind: String,
    /// Model name forwarded to the provider API.
    pub model: String,
    /// Environment variable that holds the API key (read at runtime).
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Base URL override for local proxies and compatible servers.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Maximum concurrent streams against this provider; additional calls
    /// queue on a semaphore.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Context window used for budgeting when the provider does not report one.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_context_window() -> usize {
    128_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Token budget `B` for history retrieval.
    pub budget_tokens: usize,
    /// Safety reserve `R` subtracted from the budget.
    pub reserve_tokens: usize,
    /// Minimum number of messages before compaction may run (`M_min`).
    pub min_compaction_messages: usize,
    /// How many recent messages to fetch from the vector history.
    pub recent_limit: usize,
    /// How many relevance hits to merge in when over budget.
    pub relevant_limit: usize,
    /// Size of the always-keep tail of most recent messages.
    pub keep_tail: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 100_000,
            reserve_tokens: 20_000,
            min_compaction_messages: 10,
            recent_limit: 100,
            relevant_limit: 30,
            keep_tail: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// Base URL of a Qdrant-compatible REST endpoint.  When unset, an
    /// in-process store is used (search quality degrades to recency).
    #[serde(default)]
    pub url: Option<String>,
    /// Embedding endpoint (OpenAI-shaped `POST /embeddings`).  When unset,
    /// a deterministic local feature-hashing embedder is used.
    #[serde(default)]
    pub embedding_url: Option<String>,
    #[serde(default)]
    pub embedding_api_key_env: Option<String>,
    /// Fixed embedding dimension for all collections.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            url: None,
            embedding_url: None,
            embedding_api_key_env: None,
            dimension: default_dimension(),
        }
    }
}

fn default_dimension() -> usize {
    384
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Output cap in bytes applied when a tool has no per-tool override.
    /// Output exactly at the cap passes through; one byte more is spilled
    /// to a file and truncated.
    pub default_max_output_length: usize,
    /// Wall-clock timeout for a single tool execution.
    pub default_timeout_secs: u64,
    /// Directory for spilled oversized tool output.  Defaults to the
    /// system temp directory when unset.
    #[serde(default)]
    pub spill_dir: Option<PathBuf>,
    /// Whether the web_fetch tool is registered at all.
    #[serde(default = "default_true")]
    pub enable_web: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_max_output_length: 30_000,
            default_timeout_secs: 60,
            spill_dir: None,
            enable_web: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Server name; becomes the `{server}` segment of `mcp__{server}__{tool}`.
    pub name: String,
    /// "stdio" | "http".
    pub transport: String,
    /// Command + args for stdio transport.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Endpoint URL for http transport.
    #[serde(default)]
    pub url: Option<String>,
}

// ─── Shared domain enums ──────────────────────────────────────────────────────
//
// These plain data types are consumed by every other crate (agent records in
// the store, filtering in the tool registry, rule evaluation in the gate),
// which keeps this crate the single leaf of the dependency graph.

/// Outcome a permission rule assigns to a matching tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Ask,
    Deny,
}

impl RuleAction {
    /// Strictness ordering: Deny > Ask > Allow.
    pub fn strictness(self) -> u8 {
        match self {
            RuleAction::Allow => 0,
            RuleAction::Ask => 1,
            RuleAction::Deny => 2,
        }
    }

    /// The stricter of two actions.
    pub fn stricter(self, other: RuleAction) -> RuleAction {
        if self.strictness() >= other.strictness() {
            self
        } else {
            other
        }
    }
}

/// One `{pattern, action}` entry; pattern is `tool-glob:arg-glob`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub pattern: String,
    pub action: RuleAction,
}

impl PermissionRule {
    pub fn new(pattern: impl Into<String>, action: RuleAction) -> Self {
        Self {
            pattern: pattern.into(),
            action,
        }
    }
}

/// How an agent's tool list is derived from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFilterMode {
    #[default]
    All,
    None,
    OnlyThese,
    AllExcept,
}

/// Per-tool caps that adjust execution without changing tool semantics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOverride {
    #[serde(default)]
    pub max_output_length: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Arguments merged underneath the model-provided arguments.
    #[serde(default)]
    pub default_arguments: Option<serde_json::Value>,
}

/// An agent's tool selection: filter mode + name list + per-tool overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolFilter {
    #[serde(default)]
    pub mode: ToolFilterMode,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub overrides: HashMap<String, ToolOverride>,
}

impl ToolFilter {
    /// True when `tool` survives this filter.
    pub fn permits(&self, tool: &str) -> bool {
        match self.mode {
            ToolFilterMode::All => true,
            ToolFilterMode::None => false,
            ToolFilterMode::OnlyThese => self.names.iter().any(|n| n == tool),
            ToolFilterMode::AllExcept => !self.names.iter().any(|n| n == tool),
        }
    }
}

/// Which role an agent plays in the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentCategory {
    Primary,
    Subagent,
    Hidden,
}

/// How the loop drives the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Agentic,
    SingleShot,
    Streaming,
    Planning,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
