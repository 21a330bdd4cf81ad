// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

const EXCLUDED: &[&str] = &[".git", "target", "node_modules"];

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List directory contents. depth: default 2, max 5. limit: 100 entries by default.\n\
         Excludes .git/ target/ node_modules/. Directories have trailing /.\n\
         For file pattern search use glob; for content search use grep."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the directory"
                },
                "depth": {
                    "type": "integer",
                    "description": "Maximum recursion depth (default 2, max 5)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of entries to return (default 100)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'path'"),
        };
        let depth = call
            .args
            .get("depth")
            .and_then(|v| v.as_u64())
            .unwrap_or(2)
            .min(5) as usize;
        let limit = call.args.get("limit").and_then(|v| v.as_u64()).unwrap_or(100) as usize;

        debug!(path = %path, depth, limit, "list_dir tool");

        let root = ctx.resolve(&path);
        if !root.is_dir() {
            return ToolOutput::err(&call.id, format!("not a directory: {path}"));
        }

        let mut entries = Vec::new();
        let walker = WalkDir::new(&root)
            .min_depth(1)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                !e.file_name()
                    .to_str()
                    .map(|n| EXCLUDED.contains(&n))
                    .unwrap_or(false)
            });
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if entries.len() >= limit {
                entries.push("[... more entries omitted; raise limit or narrow path ...]".into());
                break;
            }
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .display()
                .to_string();
            if entry.file_type().is_dir() {
                entries.push(format!("{rel}/"));
            } else {
                entries.push(rel);
            }
        }

        if entries.is_empty() {
            return ToolOutput::ok(&call.id, "(empty directory)");
        }
        ToolOutput::ok(&call.id, entries.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn lists_files_with_directory_markers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "y").unwrap();
        let ctx = ToolContext::new("s", "m", dir.path().to_path_buf());
        let out = ListDirTool
            .execute(
                &ToolCall {
                    id: "c".into(),
                    name: "list_dir".into(),
                    args: json!({"path": "."}),
                },
                &ctx,
            )
            .await;
        assert!(out.content.contains("a.txt"));
        assert!(out.content.contains("sub/"));
        assert!(out.content.contains("sub/b.txt"));
    }

    #[tokio::test]
    async fn excludes_git_and_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::write(dir.path().join("kept.txt"), "x").unwrap();
        let ctx = ToolContext::new("s", "m", dir.path().to_path_buf());
        let out = ListDirTool
            .execute(
                &ToolCall {
                    id: "c".into(),
                    name: "list_dir".into(),
                    args: json!({"path": "."}),
                },
                &ctx,
            )
            .await;
        assert!(out.content.contains("kept.txt"));
        assert!(!out.content.contains(".git"));
    }

    #[tokio::test]
    async fn non_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new("s", "m", dir.path().to_path_buf());
        let out = ListDirTool
            .execute(
                &ToolCall {
                    id: "c".into(),
                    name: "list_dir".into(),
                    args: json!({"path": "missing"}),
                },
                &ctx,
            )
            .await;
        assert!(out.is_error);
    }
}
