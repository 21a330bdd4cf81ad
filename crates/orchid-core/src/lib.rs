// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The orchestration engine: the agent loop, the subagent supervisor, and
//! the runtime wiring between storage, tools, context, and providers.
mod agent_loop;
mod locks;
mod prompt;
mod runtime;
mod supervisor;
mod task_tool;

/// Shared handle to the UI's ask-user collaborator.
pub type AskUserArc = std::sync::Arc<dyn orchid_tools::AskUser>;

pub use agent_loop::{AgentLoop, RunOutcome, Termination};
pub use locks::SessionLocks;
pub use runtime::{CoreDeps, Runtime};
pub use supervisor::{SubagentSupervisor, TaskArgs};
pub use task_tool::TaskTool;
