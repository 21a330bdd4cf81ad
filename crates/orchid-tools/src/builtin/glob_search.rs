// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::tool::{OutputCategory, Tool, ToolCall, ToolContext, ToolOutput};

const EXCLUDED: &[&str] = &[".git", "target", "node_modules"];

/// Built-in tool for recursive file search using glob patterns.
pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern. Results sorted by modification time (newest\n\
         first). Excludes .git/ and target/ automatically. max_results: 200 by default.\n\
         Patterns not containing / match against file names anywhere in the tree.\n\
         Examples: *.rs | src/**/*.rs | **/*.cfg\n\
         For content search use grep; for directory structure use list_dir."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern, e.g. '*.rs' or 'src/**/*.rs'"
                },
                "root": {
                    "type": "string",
                    "description": "Root directory to search from (default: working directory)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results (default 200)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn title(&self, args: &Value) -> String {
        match args.get("pattern").and_then(|v| v.as_str()) {
            Some(p) => format!("glob {p}"),
            None => self.name().to_string(),
        }
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let pattern = match call.args.get("pattern").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing 'pattern'"),
        };
        let root = call
            .args
            .get("root")
            .and_then(|v| v.as_str())
            .map(|r| ctx.resolve(r))
            .unwrap_or_else(|| ctx.working_dir.clone());
        let max = call
            .args
            .get("max_results")
            .and_then(|v| v.as_u64())
            .unwrap_or(200) as usize;

        debug!(pattern = %pattern, root = %root.display(), "glob tool");

        let matcher = match glob::Pattern::new(&pattern) {
            Ok(m) => m,
            Err(e) => return ToolOutput::err(&call.id, format!("bad glob pattern: {e}")),
        };
        // Patterns without a path separator match bare file names anywhere.
        let name_only = !pattern.contains('/');

        let mut hits: Vec<(std::time::SystemTime, String)> = Vec::new();
        let walker = WalkDir::new(&root).into_iter().filter_entry(|e| {
            !e.file_name()
                .to_str()
                .map(|n| EXCLUDED.contains(&n))
                .unwrap_or(false)
        });
        for entry in walker.flatten() {
            if ctx.cancel.is_cancelled() {
                return ToolOutput::err(&call.id, "glob cancelled");
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            let candidate = if name_only {
                entry.file_name().to_string_lossy().into_owned()
            } else {
                rel.display().to_string()
            };
            if matcher.matches(&candidate) {
                let mtime = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                hits.push((mtime, rel.display().to_string()));
            }
        }

        hits.sort_by(|a, b| b.0.cmp(&a.0));
        hits.truncate(max);
        if hits.is_empty() {
            return ToolOutput::ok(&call.id, format!("no files match {pattern}"));
        }
        let listing: Vec<String> = hits.into_iter().map(|(_, p)| p).collect();
        ToolOutput::ok(&call.id, listing.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
