// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::tool::{OutputCategory, Tool, ToolCall, ToolContext, ToolOutput};

const EXCLUDED: &[&str] = &[".git", "target", "node_modules"];

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Regex content search across files.\n\
         pattern: full regex (escape literal braces: \\{\\}). include: glob filter (*.rs).\n\
         case_sensitive: true by default. limit: 100 matches by default.\n\
         output_mode: content (default, file:line:text) | files_with_matches | count\n\
         Use files_with_matches for discovery, then read_file for details.\n\
         Binary files and .git/target/node_modules are skipped automatically."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search in (default: working directory)"
                },
                "include": {
                    "type": "string",
                    "description": "Glob pattern to filter file names, e.g. '*.rs'"
                },
                "case_sensitive": {
                    "type": "boolean",
                    "description": "Case-sensitive search (default true)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of matches to return (default 100)"
                },
                "output_mode": {
                    "type": "string",
                    "enum": ["content", "files_with_matches", "count"],
                    "description": "Output format: content (default), files_with_matches, or count"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn title(&self, args: &Value) -> String {
        match args.get("pattern").and_then(|v| v.as_str()) {
            Some(p) => format!("grep {p}"),
            None => self.name().to_string(),
        }
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let pattern = match call.args.get("pattern").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'pattern'"),
        };
        let root = call
            .args
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| ctx.resolve(p))
            .unwrap_or_else(|| ctx.working_dir.clone());
        let include = call
            .args
            .get("include")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let case_sensitive = call
            .args
            .get("case_sensitive")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let limit = call.args.get("limit").and_then(|v| v.as_u64()).unwrap_or(100) as usize;
        let output_mode = call
            .args
            .get("output_mode")
            .and_then(|v| v.as_str())
            .unwrap_or("content");

        debug!(pattern = %pattern, root = %root.display(), output_mode, "grep tool");

        let re = match RegexBuilder::new(&pattern)
            .case_insensitive(!case_sensitive)
            .build()
        {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(&call.id, format!("bad regex: {e}")),
        };
        let include_matcher = match include.as_deref().map(glob::Pattern::new) {
            Some(Ok(m)) => Some(m),
            Some(Err(e)) => return ToolOutput::err(&call.id, format!("bad include glob: {e}")),
            None => None,
        };

        let mut content_lines: Vec<String> = Vec::new();
        let mut files_with_matches: Vec<String> = Vec::new();
        let mut total = 0usize;

        let walker = WalkDir::new(&root).into_iter().filter_entry(|e| {
            !e.file_name()
                .to_str()
                .map(|n| EXCLUDED.contains(&n))
                .unwrap_or(false)
        });
        'files: for entry in walker.flatten() {
            if ctx.cancel.is_cancelled() {
                return ToolOutput::err(&call.id, "grep cancelled");
            }
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(matcher) = &include_matcher {
                let name = entry.file_name().to_string_lossy();
                if !matcher.matches(&name) {
                    continue;
                }
            }
            let bytes = match std::fs::read(entry.path()) {
                Ok(b) => b,
                Err(_) => continue,
            };
            // Binary sniff: a NUL byte in the first kilobyte skips the file.
            if bytes.iter().take(1024).any(|&b| b == 0) {
                continue;
            }
            let text = String::from_utf8_lossy(&bytes);
            let rel = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .display()
                .to_string();
            let mut file_hit = false;
            for (lineno, line) in text.lines().enumerate() {
                if re.is_match(line) {
                    total += 1;
                    file_hit = true;
                    if output_mode == "content" {
                        content_lines.push(format!("{rel}:{}:{line}", lineno + 1));
                        if content_lines.len() >= limit {
                            break 'files;
                        }
                    } else if output_mode == "files_with_matches" {
                        break;
                    }
                }
            }
            if file_hit && output_mode != "content" {
                files_with_matches.push(rel);
                if files_with_matches.len() >= limit {
                    break;
                }
            }
        }

        let body = match output_mode {
            "files_with_matches" => {
                if files_with_matches.is_empty() {
                    format!("no files match {pattern}")
                } else {
                    files_with_matches.join("\n")
                }
            }
            "count" => format!("{total}"),
            _ => {
                if content_lines.is_empty() {
                    format!("no matches for {pattern}")
                } else {
                    content_lines.join("\n")
                }
            }
        };
        ToolOutput::ok(&call.id, body)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn setup() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn alpha() {}\nfn beta() {}\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "alpha in text\n").unwrap();
        let ctx = ToolContext::new("s", "m", dir.path().to_path_buf());
        (dir, ctx)
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "c".into(),
            name: "grep".into(),
            args,
        }
    }

    #[tokio::test]
    async fn content_mode_reports_file_line_text() {
        let (_dir, ctx) = setup();
        let out = GrepTool
            .execute(&call(json!({"pattern": "alpha"})), &ctx)
            .await;
        assert!(out.content.contains("a.rs:1:fn alpha() {}"));
        assert!(out.content.contains("b.txt:1:alpha in text"));
    }

    #[tokio::test]
    async fn include_filters_by_file_name() {
        let (_dir, ctx) = setup();
        let out = GrepTool
            .execute(&call(json!({"pattern": "alpha", "include": "*.rs"})), &ctx)
            .await;
        assert!(out.content.contains("a.rs"));
        assert!(!out.content.contains("b.txt"));
    }

    #[tokio::test]
    async fn files_with_matches_lists_each_file_once() {
        let (_dir, ctx) = setup();
        let out = GrepTool
            .execute(
                &call(json!({"pattern": "alpha", "output_mode": "files_with_matches"})),
                &ctx,
            )
            .await;
        let mut lines: Vec<&str> = out.content.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["a.rs", "b.txt"]);
    }

    #[tokio::test]
    async fn count_mode_returns_a_number() {
        let (_dir, ctx) = setup();
        let out = GrepTool
            .execute(&call(json!({"pattern": "fn ", "output_mode": "count"})), &ctx)
            .await;
        assert_eq!(out.content, "2");
    }

    #[tokio::test]
    async fn bad_regex_is_a_tool_error() {
        let (_dir, ctx) = setup();
        let out = GrepTool.execute(&call(json!({"pattern": "("})), &ctx).await;
        assert!(out.is_error);
    }
}
