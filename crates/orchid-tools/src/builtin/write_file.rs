// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};
use crate::trackers::{ChangeKind, FileChange};

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Writes a file to the local filesystem. This tool will overwrite the existing file if \
         one exists at the provided path. ALWAYS prefer editing existing files with edit_file. \
         NEVER proactively create documentation or README files unless explicitly requested. \
         Creates parent directories automatically."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn title(&self, args: &Value) -> String {
        match args.get("path").and_then(|v| v.as_str()) {
            Some(p) => format!("write {p}"),
            None => self.name().to_string(),
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'path'"),
        };
        let content = match call.args.get("content").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'content'"),
        };

        debug!(path = %path, bytes = content.len(), "write_file tool");

        let resolved = ctx.resolve(&path);
        let old_content = tokio::fs::read_to_string(&resolved).await.ok();
        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(&call.id, format!("creating parent directory: {e}"));
            }
        }
        if let Err(e) = tokio::fs::write(&resolved, &content).await {
            return ToolOutput::err(&call.id, format!("write error: {e}"));
        }

        let kind = if old_content.is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Created
        };
        ctx.file_changes.record(FileChange {
            path: resolved,
            kind,
            old_content,
            new_content: Some(content.clone()),
        });

        ToolOutput::ok(
            &call.id,
            format!("wrote {} bytes to {path}", content.len()),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
