// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use orchid_config::{ToolFilter, ToolOverride, ToolsConfig};

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};
use crate::truncate::smart_truncate;

/// A tool schema — mirrors the model crate's shape but keeps this crate
/// independent from it.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Result of one registry-mediated execution: the (possibly truncated)
/// output plus the pruning metadata recorded on the tool part.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub output: ToolOutput,
    pub pruned: bool,
    pub spill_path: Option<PathBuf>,
    /// Machine-readable failure class: "cancelled", "timeout",
    /// "unknown_tool".  `None` for success and plain tool errors.
    pub error_code: Option<String>,
}

impl ToolExecution {
    fn plain(output: ToolOutput) -> Self {
        Self {
            output,
            pruned: false,
            spill_path: None,
            error_code: None,
        }
    }

    fn failed(output: ToolOutput, code: &str) -> Self {
        Self {
            output,
            pruned: false,
            spill_path: None,
            error_code: Some(code.to_string()),
        }
    }
}

/// Central registry holding all available tools.
///
/// Registration happens at startup plus hot registration for MCP-bridged
/// tools (`mcp__{server}__{tool}`), hence the interior lock; reads take it
/// shared and never block each other.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    defaults: ToolsConfig,
}

impl ToolRegistry {
    pub fn new(defaults: ToolsConfig) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.write().unwrap().insert(name, tool);
    }

    pub fn register_tool(&self, tool: impl Tool + 'static) {
        self.register(Arc::new(tool));
    }

    pub fn unregister(&self, name: &str) {
        self.tools.write().unwrap().remove(name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for every registered tool, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .read()
            .unwrap()
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Schemas surviving an agent's tool filter, sorted by name.
    pub fn effective_schemas(&self, filter: &ToolFilter) -> Vec<ToolSchema> {
        self.schemas()
            .into_iter()
            .filter(|s| filter.permits(&s.name))
            .collect()
    }

    /// True when the tool is registered and survives the filter.
    pub fn is_effective(&self, name: &str, filter: &ToolFilter) -> bool {
        filter.permits(name) && self.tools.read().unwrap().contains_key(name)
    }

    /// Execute a call with the per-tool override applied: default-argument
    /// merging, timeout racing, cancellation, and the output cap with
    /// spill-to-file on overflow.
    pub async fn execute(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        overrides: Option<&ToolOverride>,
    ) -> ToolExecution {
        let tool = match self.get(&call.name) {
            Some(t) => t,
            None => {
                return ToolExecution::failed(
                    ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
                    "unknown_tool",
                )
            }
        };

        let call = merge_default_arguments(call, overrides);
        let timeout_secs = overrides
            .and_then(|o| o.timeout_secs)
            .unwrap_or(self.defaults.default_timeout_secs);

        debug!(tool = %call.name, call_id = %call.id, timeout_secs, "executing tool");

        let output = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return ToolExecution::failed(
                    ToolOutput::err(&call.id, "tool execution cancelled"),
                    "cancelled",
                );
            }
            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                warn!(tool = %call.name, timeout_secs, "tool timed out");
                return ToolExecution::failed(
                    ToolOutput::err(
                        &call.id,
                        format!("tool timed out after {timeout_secs}s"),
                    ),
                    "timeout",
                );
            }
            out = tool.execute(&call, ctx) => out,
        };

        let cap = overrides
            .and_then(|o| o.max_output_length)
            .unwrap_or(self.defaults.default_max_output_length);
        self.apply_output_cap(&call, tool.output_category(), output, cap, ctx)
            .await
    }

    /// Spill oversized output to a file and truncate what goes back to the
    /// model.  Output exactly at the cap passes through untouched.
    async fn apply_output_cap(
        &self,
        call: &ToolCall,
        category: crate::tool::OutputCategory,
        output: ToolOutput,
        cap: usize,
        ctx: &ToolContext,
    ) -> ToolExecution {
        if cap == 0 || output.content.len() <= cap {
            return ToolExecution::plain(output);
        }
        let spill_path = ctx
            .spill_dir
            .join(format!("tool-{}-{}.out", call.name, Uuid::new_v4()));
        let spill_path = match tokio::fs::write(&spill_path, &output.content).await {
            Ok(()) => Some(spill_path),
            Err(e) => {
                warn!(error = %e, "failed to spill oversized tool output");
                None
            }
        };
        let mut truncated = smart_truncate(&output.content, category, cap);
        if let Some(p) = &spill_path {
            truncated.push_str(&format!("\n[full output: {}]", p.display()));
        }
        ToolExecution {
            output: ToolOutput {
                call_id: output.call_id,
                content: truncated,
                is_error: output.is_error,
                attachments: output.attachments,
            },
            pruned: true,
            spill_path,
            error_code: None,
        }
    }
}

/// Merge the override's `default_arguments` underneath the model-provided
/// arguments; model values win on conflicts.
fn merge_default_arguments(call: &ToolCall, overrides: Option<&ToolOverride>) -> ToolCall {
    let defaults = match overrides.and_then(|o| o.default_arguments.as_ref()) {
        Some(serde_json::Value::Object(defaults)) => defaults,
        _ => return call.clone(),
    };
    let mut merged = defaults.clone();
    if let serde_json::Value::Object(args) = &call.args {
        for (k, v) in args {
            merged.insert(k.clone(), v.clone());
        }
    }
    ToolCall {
        id: call.id.clone(),
        name: call.name.clone(),
        args: serde_json::Value::Object(merged),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use orchid_config::ToolFilterMode;

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps forever"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ToolOutput::ok(&call.id, "never")
        }
    }

    struct BigTool {
        bytes: usize,
    }

    #[async_trait]
    impl Tool for BigTool {
        fn name(&self) -> &str {
            "big"
        }
        fn description(&self) -> &str {
            "produces a lot of output"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
            ToolOutput::ok(&call.id, "z".repeat(self.bytes))
        }
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::new(ToolsConfig {
            default_max_output_length: 100,
            default_timeout_secs: 1,
            spill_dir: None,
            enable_web: false,
        })
    }

    fn ctx() -> ToolContext {
        let dir = std::env::temp_dir();
        ToolContext::new("s1", "m1", dir.clone()).with_spill_dir(dir)
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            args: json!({}),
        }
    }

    #[tokio::test]
    async fn execute_known_tool_succeeds() {
        let reg = registry();
        reg.register_tool(EchoTool { name: "echo" });
        let exec = reg.execute(&call("echo"), &ctx(), None).await;
        assert!(!exec.output.is_error);
        assert!(exec.output.content.starts_with("echo:"));
    }

    #[tokio::test]
    async fn execute_unknown_tool_fails_with_code() {
        let reg = registry();
        let exec = reg.execute(&call("missing"), &ctx(), None).await;
        assert!(exec.output.is_error);
        assert!(exec.output.content.contains("unknown tool"));
        assert_eq!(exec.error_code.as_deref(), Some("unknown_tool"));
    }

    #[tokio::test]
    async fn timeout_produces_timeout_code() {
        let reg = registry();
        reg.register_tool(SlowTool);
        let exec = reg.execute(&call("slow"), &ctx(), None).await;
        assert!(exec.output.is_error);
        assert_eq!(exec.error_code.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn cancellation_produces_cancelled_code() {
        let reg = registry();
        reg.register_tool(SlowTool);
        let context = ctx();
        context.cancel.cancel();
        let exec = reg.execute(&call("slow"), &context, None).await;
        assert_eq!(exec.error_code.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn output_at_cap_is_not_pruned() {
        let reg = registry();
        reg.register_tool(BigTool { bytes: 100 });
        let exec = reg.execute(&call("big"), &ctx(), None).await;
        assert!(!exec.pruned);
        assert_eq!(exec.output.content.len(), 100);
    }

    #[tokio::test]
    async fn output_over_cap_is_pruned_and_spilled() {
        let reg = registry();
        reg.register_tool(BigTool { bytes: 101 });
        let exec = reg.execute(&call("big"), &ctx(), None).await;
        assert!(exec.pruned);
        let spill = exec.spill_path.expect("spill file");
        let full = std::fs::read_to_string(&spill).unwrap();
        assert_eq!(full.len(), 101);
        std::fs::remove_file(spill).ok();
    }

    #[tokio::test]
    async fn per_tool_override_raises_the_cap() {
        let reg = registry();
        reg.register_tool(BigTool { bytes: 150 });
        let ov = ToolOverride {
            max_output_length: Some(200),
            ..Default::default()
        };
        let exec = reg.execute(&call("big"), &ctx(), Some(&ov)).await;
        assert!(!exec.pruned);
    }

    #[tokio::test]
    async fn default_arguments_merge_under_model_args() {
        let reg = registry();
        reg.register_tool(EchoTool { name: "echo" });
        let ov = ToolOverride {
            default_arguments: Some(json!({"depth": 2, "limit": 10})),
            ..Default::default()
        };
        let c = ToolCall {
            id: "c1".into(),
            name: "echo".into(),
            args: json!({"limit": 99}),
        };
        let exec = reg.execute(&c, &ctx(), Some(&ov)).await;
        assert!(exec.output.content.contains("\"depth\":2"));
        assert!(exec.output.content.contains("\"limit\":99"));
    }

    #[test]
    fn effective_schemas_apply_the_filter() {
        let reg = registry();
        reg.register_tool(EchoTool { name: "a" });
        reg.register_tool(EchoTool { name: "b" });
        let only_a = ToolFilter {
            mode: ToolFilterMode::OnlyThese,
            names: vec!["a".into()],
            ..Default::default()
        };
        let schemas = reg.effective_schemas(&only_a);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "a");
        assert!(reg.is_effective("a", &only_a));
        assert!(!reg.is_effective("b", &only_a));
    }

    #[test]
    fn hot_registration_and_unregistration() {
        let reg = registry();
        reg.register_tool(EchoTool { name: "mcp__srv__x" });
        assert!(reg.get("mcp__srv__x").is_some());
        reg.unregister("mcp__srv__x");
        assert!(reg.get("mcp__srv__x").is_none());
    }
}
