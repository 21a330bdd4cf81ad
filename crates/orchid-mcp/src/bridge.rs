// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bridging between MCP servers and the tool registry.
//!
//! Each discovered tool becomes a registry entry named
//! `mcp__{server}__{tool}`; execution delegates to `tools/call` and maps
//! the MCP `isError` flag onto the tool output.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use orchid_tools::{Tool, ToolCall, ToolContext, ToolOutput, ToolRegistry};

use crate::client::{McpClient, McpToolInfo};

/// Compose the registry name for a bridged tool.
pub fn bridge_tool_name(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

/// A registry tool that forwards to an MCP server.
pub struct McpBridgedTool {
    client: Arc<McpClient>,
    bridged_name: String,
    remote_name: String,
    description: String,
    input_schema: Value,
}

impl McpBridgedTool {
    pub fn new(client: Arc<McpClient>, info: McpToolInfo) -> Self {
        Self {
            bridged_name: bridge_tool_name(client.name(), &info.name),
            remote_name: info.name,
            description: info.description,
            input_schema: info.input_schema,
            client,
        }
    }
}

#[async_trait]
impl Tool for McpBridgedTool {
    fn name(&self) -> &str {
        &self.bridged_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.input_schema.clone()
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let request = self.client.call_tool(&self.remote_name, call.args.clone());
        tokio::pin!(request);
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return ToolOutput::err(&call.id, "MCP call cancelled");
            }
            r = &mut request => r,
        };
        match result {
            Ok(r) if r.is_error => ToolOutput::err(&call.id, r.content),
            Ok(r) => ToolOutput::ok(&call.id, r.content),
            Err(e) => ToolOutput::err(&call.id, format!("MCP call failed: {e}")),
        }
    }
}

/// Discover a server's tools and hot-register them.
/// Returns the bridged names that were registered.
pub async fn register_server(
    registry: &ToolRegistry,
    client: Arc<McpClient>,
) -> anyhow::Result<Vec<String>> {
    let tools = client.list_tools().await?;
    let mut names = Vec::with_capacity(tools.len());
    for info in tools {
        let tool = McpBridgedTool::new(Arc::clone(&client), info);
        names.push(tool.name().to_string());
        registry.register(Arc::new(tool));
    }
    info!(server = %client.name(), count = names.len(), "MCP tools registered");
    Ok(names)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridged_names_cannot_collide_with_builtins() {
        assert_eq!(bridge_tool_name("files", "read"), "mcp__files__read");
        assert_ne!(bridge_tool_name("files", "read"), "read_file");
    }

    #[test]
    fn bridged_names_separate_servers() {
        assert_ne!(
            bridge_tool_name("alpha", "search"),
            bridge_tool_name("beta", "search")
        );
    }
}
