// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool dispatch: the `Tool` trait, the capability-filtered registry, the
//! permission gate, and the built-in tools.
pub mod ask;
pub mod builtin;
pub mod gate;
pub mod registry;
pub mod tool;
pub mod trackers;
pub mod truncate;

pub use ask::{
    AskOutcome, AskScope, AskUser, DenyAllAsker, Diagnostic, Diagnostics, GrantAllAsker, Question,
    QuestionAnswer, QuestionRequest,
};
pub use builtin::{
    BashTool, EditFileTool, GlobTool, GrepTool, ListDirTool, ReadFileTool, WebFetchTool,
    WriteFileTool,
};
pub use gate::{GateDecision, GrantSink, PermissionGate, RuleSet};
pub use registry::{ToolExecution, ToolRegistry, ToolSchema};
pub use tool::{OutputCategory, Tool, ToolCall, ToolContext, ToolOutput};
pub use trackers::{ChangeKind, FileChange, FileChangeTracker, TodoItem, TodoStatus, TodoTracker};
