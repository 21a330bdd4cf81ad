// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use orchid_tools::{Tool, ToolCall, ToolContext, ToolOutput};

use crate::supervisor::{SubagentSupervisor, TaskArgs};

/// The only way an agent spawns a subagent.
pub struct TaskTool {
    supervisor: Arc<SubagentSupervisor>,
}

impl TaskTool {
    pub fn new(supervisor: Arc<SubagentSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Delegate a focused task to a specialized subagent running in an isolated \
         session, and return its final text output. The subagent cannot ask the \
         user questions and cannot spawn further subagents. Use run_in_background \
         for long explorations; completion then arrives as an event."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "subagent_type": {
                    "type": "string",
                    "description": "Slug of the subagent to run, e.g. 'explore'"
                },
                "prompt": {
                    "type": "string",
                    "description": "The task description for the subagent"
                },
                "description": {
                    "type": "string",
                    "description": "Short human-readable label for the task"
                },
                "run_in_background": {
                    "type": "boolean",
                    "description": "Return immediately with the sub-session id (default false)"
                },
                "max_turns": {
                    "type": "integer",
                    "description": "Cap on the subagent's tool-call iterations"
                }
            },
            "required": ["subagent_type", "prompt", "description"]
        })
    }

    fn title(&self, args: &Value) -> String {
        args.get("description")
            .and_then(|v| v.as_str())
            .map(|d| d.to_string())
            .unwrap_or_else(|| self.name().to_string())
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let subagent_type = match call.args.get("subagent_type").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'subagent_type'"),
        };
        let prompt = match call.args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'prompt'"),
        };
        let description = call
            .args
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("subagent task")
            .to_string();
        let run_in_background = call
            .args
            .get("run_in_background")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let max_turns = call
            .args
            .get("max_turns")
            .and_then(|v| v.as_u64())
            .map(|n| n as u32);

        let Some(agent) = &ctx.agent else {
            return ToolOutput::err(&call.id, "task tool requires an invoking agent");
        };

        debug!(subagent_type = %subagent_type, background = run_in_background, "task tool");

        let result = self
            .supervisor
            .spawn(
                &ctx.session_id,
                &ctx.message_id,
                agent,
                &ctx.rules,
                ctx.cancel.child_token(),
                TaskArgs {
                    subagent_type,
                    prompt,
                    description,
                    run_in_background,
                    max_turns,
                },
            )
            .await;
        match result {
            Ok(text) => ToolOutput::ok(&call.id, text),
            Err(message) => ToolOutput::err(&call.id, message),
        }
    }
}
