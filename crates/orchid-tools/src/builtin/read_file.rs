// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{OutputCategory, Tool, ToolCall, ToolContext, ToolOutput};

/// Default number of lines returned when the caller does not specify a limit.
/// Kept small to avoid flooding the model context on the first read; the agent
/// can paginate with offset + limit to get more.
const DEFAULT_LINE_LIMIT: usize = 200;

/// Hard byte ceiling applied in addition to the line limit.
/// Whichever constraint is hit first determines where the output is cut.
const MAX_BYTES: usize = 20_000;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads a file. Default: 200 lines / 20 KB — whichever comes first.\n\
         Lines formatted as L{n}:content (1-indexed).\n\
         When more lines exist, a pagination notice shows the next offset.\n\
         Strategy: use grep to find the relevant region first, then read only those lines\n\
         with offset+limit. Avoid reading a whole large file — pull only what you need."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line number to start reading from (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 200)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn title(&self, args: &Value) -> String {
        match args.get("path").and_then(|v| v.as_str()) {
            Some(p) => format!("read {p}"),
            None => self.name().to_string(),
        }
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => {
                let args_preview =
                    serde_json::to_string(&call.args).unwrap_or_else(|_| "null".to_string());
                return ToolOutput::err(
                    &call.id,
                    format!("missing required parameter 'path'. Received: {args_preview}"),
                );
            }
        };
        let offset = call.args.get("offset").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
        let limit = call
            .args
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        debug!(path = %path, offset, limit, "read_file tool");

        let resolved = ctx.resolve(&path);
        let text = match tokio::fs::read_to_string(&resolved).await {
            Ok(t) => t,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };

        let total_lines = text.lines().count();
        let start = offset.max(1) - 1;
        let mut out = String::new();
        let mut bytes = 0usize;
        let mut shown = 0usize;
        for (i, line) in text.lines().enumerate().skip(start).take(limit) {
            let rendered = format!("L{}:{}\n", i + 1, line);
            if bytes + rendered.len() > MAX_BYTES {
                break;
            }
            bytes += rendered.len();
            out.push_str(&rendered);
            shown += 1;
        }

        if start >= total_lines && total_lines > 0 {
            return ToolOutput::err(
                &call.id,
                format!("offset {offset} is past the end of the file ({total_lines} lines)"),
            );
        }
        let next = start + shown;
        if next < total_lines {
            out.push_str(&format!(
                "[{} more lines; continue with offset={}]\n",
                total_lines - next,
                next + 1
            ));
        }
        ToolOutput::ok(&call.id, out)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx(dir: &std::path::Path) -> ToolContext {
        ToolContext::new("s", "m", dir.to_path_buf())
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: "read_file".into(),
            args,
        }
    }

    #[tokio::test]
    async fn reads_relative_path_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha\nbeta\n").unwrap();
        let out = ReadFileTool
            .execute(&call(json!({"path": "a.txt"})), &ctx(dir.path()))
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("L1:alpha"));
        assert!(out.content.contains("L2:beta"));
    }

    #[tokio::test]
    async fn pagination_notice_when_limited() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..10).map(|i| format!("line{i}\n")).collect();
        std::fs::write(dir.path().join("b.txt"), body).unwrap();
        let out = ReadFileTool
            .execute(
                &call(json!({"path": "b.txt", "limit": 3})),
                &ctx(dir.path()),
            )
            .await;
        assert!(out.content.contains("L3:line2"));
        assert!(out.content.contains("continue with offset=4"));
    }

    #[tokio::test]
    async fn missing_file_is_a_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = ReadFileTool
            .execute(&call(json!({"path": "nope.txt"})), &ctx(dir.path()))
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn missing_path_parameter_reports_received_args() {
        let dir = tempfile::tempdir().unwrap();
        let out = ReadFileTool
            .execute(&call(json!({"wrong": 1})), &ctx(dir.path()))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("missing required parameter 'path'"));
    }

    #[test]
    fn title_includes_path() {
        assert_eq!(
            ReadFileTool.title(&json!({"path": "README.md"})),
            "read README.md"
        );
    }
}
