// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{OutputCategory, Tool, ToolCall, ToolContext, ToolOutput};

const OUTPUT_LIMIT: usize = 100_000;

pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Executes a command in a shell.\n\n\
         IMPORTANT: This tool is for terminal operations like git, cargo, make, etc. \
         DO NOT use it for file operations — use specialized tools instead:\n\
         - DO NOT use cat, head, tail → use read_file\n\
         - DO NOT use grep or find   → use grep and glob\n\
         - DO NOT use sed or awk     → use edit_file\n\
         Always quote paths that contain spaces. Chain dependent commands with '&&'.\n\
         Avoid persistent servers or watchers; prefer one-shot commands.\n\
         NEVER run destructive commands (push --force, reset --hard) without an \
         explicit request."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cmd": {
                    "type": "string",
                    "description": "Shell command line to execute"
                },
                "working_dir": {
                    "type": "string",
                    "description": "Directory to run in (default: session working directory)"
                }
            },
            "required": ["cmd"],
            "additionalProperties": false
        })
    }

    fn title(&self, args: &Value) -> String {
        args.get("cmd")
            .or_else(|| args.get("command"))
            .and_then(|v| v.as_str())
            .map(|c| c.to_string())
            .unwrap_or_else(|| self.name().to_string())
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::HeadTail
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        // Accept both "cmd" and "command" — models use either.
        let cmd = match call
            .args
            .get("cmd")
            .or_else(|| call.args.get("command"))
            .and_then(|v| v.as_str())
        {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'cmd'"),
        };
        let dir = call
            .args
            .get("working_dir")
            .and_then(|v| v.as_str())
            .map(|d| ctx.resolve(d))
            .unwrap_or_else(|| ctx.working_dir.clone());

        debug!(cmd = %cmd, dir = %dir.display(), "bash tool");

        let child = match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .current_dir(&dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("failed to spawn: {e}")),
        };

        // Wait with cancellation.  Dropping the wait future drops the child
        // handle, and kill_on_drop(true) signals the process, so no child
        // outlives the cancellation.
        let wait = child.wait_with_output();
        tokio::pin!(wait);
        let output = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return ToolOutput::err(&call.id, "command cancelled");
            }
            out = &mut wait => out,
        };

        let output = match output {
            Ok(o) => o,
            Err(e) => return ToolOutput::err(&call.id, format!("wait failed: {e}")),
        };

        let mut text = String::new();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        if !output.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("--- stderr ---\n");
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        if text.len() > OUTPUT_LIMIT {
            text.truncate(OUTPUT_LIMIT);
            text.push_str("\n[output hard-capped at 100 KB]");
        }

        let code = output.status.code().unwrap_or(-1);
        if output.status.success() {
            ToolOutput::ok(&call.id, text)
        } else {
            ToolOutput::err(&call.id, format!("exit code {code}\n{text}"))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn ctx(dir: &std::path::Path) -> ToolContext {
        ToolContext::new("s", "m", dir.to_path_buf())
    }

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "c".into(),
            name: "bash".into(),
            args,
        }
    }

    #[tokio::test]
    async fn runs_command_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = BashTool
            .execute(&call(json!({"cmd": "ls"})), &ctx(dir.path()))
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("marker.txt"));
    }

    #[tokio::test]
    async fn accepts_command_alias() {
        let dir = tempfile::tempdir().unwrap();
        let out = BashTool
            .execute(&call(json!({"command": "echo aliased"})), &ctx(dir.path()))
            .await;
        assert!(out.content.contains("aliased"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = BashTool
            .execute(&call(json!({"cmd": "exit 3"})), &ctx(dir.path()))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("exit code 3"));
    }

    #[tokio::test]
    async fn stderr_is_labelled() {
        let dir = tempfile::tempdir().unwrap();
        let out = BashTool
            .execute(&call(json!({"cmd": "echo oops 1>&2"})), &ctx(dir.path()))
            .await;
        assert!(out.content.contains("--- stderr ---"));
        assert!(out.content.contains("oops"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let context = ctx(dir.path()).with_cancel(cancel.clone());
        let handle = tokio::spawn(async move {
            BashTool
                .execute(&call(json!({"cmd": "sleep 30"})), &context)
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        let out = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("cancellation within bounded time")
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("cancelled"));
    }
}
