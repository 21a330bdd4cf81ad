// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};
use crate::trackers::{ChangeKind, FileChange};

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Performs exact string replacement in a file.\n\
         old_str must match the file contents exactly, including whitespace, and must be\n\
         unique in the file unless replace_all is set.  Use read_file first and copy the\n\
         text verbatim; strip the L{n}: prefix from read_file output."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                },
                "old_str": {
                    "type": "string",
                    "description": "Exact text to replace"
                },
                "new_str": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace every occurrence instead of requiring uniqueness (default false)"
                }
            },
            "required": ["path", "old_str", "new_str"],
            "additionalProperties": false
        })
    }

    fn title(&self, args: &Value) -> String {
        match args.get("path").and_then(|v| v.as_str()) {
            Some(p) => format!("edit {p}"),
            None => self.name().to_string(),
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'path'"),
        };
        let old_str = match call.args.get("old_str").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'old_str'"),
        };
        let new_str = match call.args.get("new_str").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'new_str'"),
        };
        let replace_all = call
            .args
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if old_str == new_str {
            return ToolOutput::err(&call.id, "old_str and new_str are identical");
        }

        debug!(path = %path, replace_all, "edit_file tool");

        let resolved = ctx.resolve(&path);
        let content = match tokio::fs::read_to_string(&resolved).await {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };

        let occurrences = content.matches(&old_str).count();
        if occurrences == 0 {
            return ToolOutput::err(
                &call.id,
                "old_str not found in file; re-read the file and copy the text exactly",
            );
        }
        if occurrences > 1 && !replace_all {
            return ToolOutput::err(
                &call.id,
                format!(
                    "old_str matches {occurrences} locations; \
                     add surrounding context to make it unique or set replace_all"
                ),
            );
        }

        let updated = if replace_all {
            content.replace(&old_str, &new_str)
        } else {
            content.replacen(&old_str, &new_str, 1)
        };
        if let Err(e) = tokio::fs::write(&resolved, &updated).await {
            return ToolOutput::err(&call.id, format!("write error: {e}"));
        }

        ctx.file_changes.record(FileChange {
            path: resolved,
            kind: ChangeKind::Modified,
            old_content: Some(content),
            new_content: Some(updated),
        });

        let replaced = if replace_all { occurrences } else { 1 };
        ToolOutput::ok(
            &call.id,
            format!("replaced {replaced} occurrence(s) in {path}"),
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: "edit_file".into(),
            args,
        }
    }

    #[tokio::test]
    async fn replaces_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.rs"), "fn old() {}\n").unwrap();
        let ctx = ToolContext::new("s", "m", dir.path().to_path_buf());
        let out = EditFileTool
            .execute(
                &call(json!({"path": "f.rs", "old_str": "old", "new_str": "new"})),
                &ctx,
            )
            .await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.rs")).unwrap(),
            "fn new() {}\n"
        );
        assert_eq!(ctx.file_changes.drain().len(), 1);
    }

    #[tokio::test]
    async fn ambiguous_match_requires_replace_all() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "x x x").unwrap();
        let ctx = ToolContext::new("s", "m", dir.path().to_path_buf());
        let out = EditFileTool
            .execute(
                &call(json!({"path": "f.txt", "old_str": "x", "new_str": "y"})),
                &ctx,
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("3 locations"));

        let out = EditFileTool
            .execute(
                &call(json!({"path": "f.txt", "old_str": "x", "new_str": "y", "replace_all": true})),
                &ctx,
            )
            .await;
        assert!(!out.is_error);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "y y y"
        );
    }

    #[tokio::test]
    async fn missing_old_str_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "content").unwrap();
        let ctx = ToolContext::new("s", "m", dir.path().to_path_buf());
        let out = EditFileTool
            .execute(
                &call(json!({"path": "f.txt", "old_str": "absent", "new_str": "y"})),
                &ctx,
            )
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("not found"));
    }
}
