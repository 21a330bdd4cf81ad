// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCall, ToolContext, ToolOutput};

const DEFAULT_MAX_CHARS: usize = 50_000;

pub struct WebFetchTool;

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch content from a URL and convert to readable text.\n\n\
         ## Supported\n\
         - HTTP and HTTPS URLs\n\
         - HTML content conversion to plain text\n\
         - Maximum 50,000 characters per request\n\n\
         ## Limitations\n\
         - No authentication support\n\
         - No binary content fetching\n\
         - No localhost or private IP access\n\
         - Read-only (no requests with side effects)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Fully-formed http(s) URL to fetch"
                },
                "max_chars": {
                    "type": "integer",
                    "description": "Maximum characters of extracted text (default 50000)"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn title(&self, args: &Value) -> String {
        match args.get("url").and_then(|v| v.as_str()) {
            Some(u) => format!("fetch {u}"),
            None => self.name().to_string(),
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let url = match call.args.get("url").and_then(|v| v.as_str()) {
            Some(u) => u.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'url'"),
        };
        let max_chars = call
            .args
            .get("max_chars")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_CHARS as u64) as usize;

        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolOutput::err(&call.id, "only http(s) URLs are supported");
        }
        if is_private_host(&url) {
            return ToolOutput::err(&call.id, "localhost and private addresses are not allowed");
        }

        debug!(url = %url, "web_fetch tool");

        let client = match reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
        {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("client error: {e}")),
        };

        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return ToolOutput::err(&call.id, "fetch cancelled");
            }
            r = client.get(&url).send() => r,
        };
        let response = match response {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(&call.id, format!("request failed: {e}")),
        };
        if !response.status().is_success() {
            return ToolOutput::err(&call.id, format!("HTTP {}", response.status()));
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(false);
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(&call.id, format!("body read failed: {e}")),
        };

        let mut text = if is_html {
            html2text::from_read(body.as_bytes(), 100)
        } else {
            body
        };
        if text.len() > max_chars {
            let mut cut = max_chars;
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("\n[content truncated]");
        }
        ToolOutput::ok(&call.id, text)
    }
}

/// Reject localhost and RFC 1918 targets; the tool is for public content.
fn is_private_host(url: &str) -> bool {
    let host = url
        .split("//")
        .nth(1)
        .and_then(|rest| rest.split(['/', '?', '#']).next())
        .map(|h| h.split('@').next_back().unwrap_or(h))
        .map(|h| h.split(':').next().unwrap_or(h))
        .unwrap_or("");
    host == "localhost"
        || host == "127.0.0.1"
        || host == "::1"
        || host.starts_with("10.")
        || host.starts_with("192.168.")
        || host.starts_with("172.16.")
        || host.starts_with("169.254.")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
