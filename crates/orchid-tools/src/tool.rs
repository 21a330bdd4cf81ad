// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use orchid_store::Agent;

use crate::ask::{AskUser, DenyAllAsker};
use crate::gate::RuleSet;
use crate::trackers::{FileChangeTracker, TodoTracker};

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the provider (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
    /// File paths produced as side artifacts (screenshots, reports).
    pub attachments: Vec<String>,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
            attachments: Vec::new(),
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a tool result exceeds the configured output cap, the registry uses
/// this category to pick the right extraction strategy.  Each tool declares
/// its own category; nothing here hard-codes tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep the first 60 + last 40 lines so both
    /// the command preamble and the final result are visible.
    HeadTail,
    /// Ordered match list: keep the leading matches so the model sees the
    /// highest-relevance results first.
    MatchList,
    /// File content: keep a head and tail window with a separator.
    FileContent,
    /// Generic text: hard-truncate at the nearest line boundary.
    #[default]
    Generic,
}

/// Per-execution context handed to every tool.
///
/// The trackers are the only mutable state a tool may touch; each has a
/// narrow write interface and is read back by the loop after execution.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub message_id: String,
    pub working_dir: PathBuf,
    /// Record of the invoking agent; `None` only in administrative calls.
    pub agent: Option<Arc<Agent>>,
    /// Effective permission rules of the invoking agent.
    pub rules: Arc<RuleSet>,
    pub file_changes: FileChangeTracker,
    pub todos: TodoTracker,
    pub cancel: CancellationToken,
    pub asker: Arc<dyn AskUser>,
    /// Directory for spilled oversized output.
    pub spill_dir: PathBuf,
}

impl ToolContext {
    pub fn new(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            working_dir,
            agent: None,
            rules: Arc::new(RuleSet::default()),
            file_changes: FileChangeTracker::new(),
            todos: TodoTracker::new(),
            cancel: CancellationToken::new(),
            asker: Arc::new(DenyAllAsker),
            spill_dir: std::env::temp_dir(),
        }
    }

    pub fn with_agent(mut self, agent: Arc<Agent>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_rules(mut self, rules: Arc<RuleSet>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_asker(mut self, asker: Arc<dyn AskUser>) -> Self {
        self.asker = asker;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_spill_dir(mut self, dir: PathBuf) -> Self {
        self.spill_dir = dir;
        self
    }

    /// Resolve a tool-supplied path against the working directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.working_dir.join(p)
        }
    }
}

/// Trait that every built-in and bridged tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Human-readable title for the invocation, derived from the arguments.
    fn title(&self, _args: &Value) -> String {
        self.name().to_string()
    }
    /// Describes the shape of this tool's output for context-aware
    /// truncation.  Default is [`OutputCategory::Generic`] (hard cut).
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`];
    /// long-running steps must observe `ctx.cancel`.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct MinimalTool;

    #[async_trait]
    impl Tool for MinimalTool {
        fn name(&self) -> &str {
            "minimal"
        }
        fn description(&self) -> &str {
            "a minimal tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            ToolOutput::ok(&call.id, "ok")
        }
    }

    #[test]
    fn default_output_category_is_generic() {
        assert_eq!(MinimalTool.output_category(), OutputCategory::Generic);
    }

    #[test]
    fn default_title_is_the_tool_name() {
        assert_eq!(MinimalTool.title(&json!({})), "minimal");
    }

    #[test]
    fn context_resolves_relative_paths() {
        let ctx = ToolContext::new("s", "m", PathBuf::from("/work"));
        assert_eq!(ctx.resolve("a/b.rs"), PathBuf::from("/work/a/b.rs"));
        assert_eq!(ctx.resolve("/abs/c.rs"), PathBuf::from("/abs/c.rs"));
    }

    #[test]
    fn output_constructors_set_error_flag() {
        assert!(!ToolOutput::ok("c", "fine").is_error);
        assert!(ToolOutput::err("c", "bad").is_error);
    }
}
