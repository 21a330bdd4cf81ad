// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "orchid";

/// How to reach an MCP server.
#[derive(Debug, Clone)]
pub enum McpTransport {
    Stdio { command: String, args: Vec<String> },
    Http { url: String },
}

/// A tool advertised by `tools/list`.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Result of `tools/call`, flattened to text.
#[derive(Debug, Clone)]
pub struct McpCallResult {
    pub content: String,
    pub is_error: bool,
}

enum Connection {
    Stdio {
        stdin: tokio::sync::Mutex<ChildStdin>,
        pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
        _child: Child,
    },
    Http {
        url: String,
        client: reqwest::Client,
    },
}

/// JSON-RPC 2.0 client for one MCP server.
pub struct McpClient {
    name: String,
    next_id: AtomicU64,
    connection: Connection,
}

impl McpClient {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect and run the `initialize` → `notifications/initialized`
    /// handshake.
    pub async fn connect(name: impl Into<String>, transport: McpTransport) -> anyhow::Result<Self> {
        let name = name.into();
        let connection = match transport {
            McpTransport::Stdio { command, args } => {
                let mut child = Command::new(&command)
                    .args(&args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| anyhow::anyhow!("spawning MCP server {command}: {e}"))?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("MCP server has no stdin"))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("MCP server has no stdout"))?;

                let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
                    Arc::new(Mutex::new(HashMap::new()));
                let reader_pending = Arc::clone(&pending);
                let server = name.clone();
                // Response pump: routes each response line to the waiting
                // request by id.  Server-initiated notifications are logged
                // and dropped.
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let value: Value = match serde_json::from_str(&line) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(server = %server, error = %e, "bad MCP frame");
                                continue;
                            }
                        };
                        match value["id"].as_u64() {
                            Some(id) => {
                                if let Some(tx) = reader_pending.lock().unwrap().remove(&id) {
                                    let _ = tx.send(value);
                                }
                            }
                            None => {
                                debug!(server = %server, method = %value["method"], "MCP notification");
                            }
                        }
                    }
                    debug!(server = %server, "MCP stdout closed");
                });

                Connection::Stdio {
                    stdin: tokio::sync::Mutex::new(stdin),
                    pending,
                    _child: child,
                }
            }
            McpTransport::Http { url } => Connection::Http {
                url,
                client: reqwest::Client::new(),
            },
        };

        let client = Self {
            name,
            next_id: AtomicU64::new(1),
            connection,
        };

        let init = client
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "clientInfo": { "name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION") },
                }),
            )
            .await?;
        debug!(server = %client.name, version = %init["protocolVersion"], "MCP initialized");
        client.notify("notifications/initialized", json!({})).await?;
        Ok(client)
    }

    /// `tools/list`.
    pub async fn list_tools(&self) -> anyhow::Result<Vec<McpToolInfo>> {
        let result = self.request("tools/list", json!({})).await?;
        let mut tools = Vec::new();
        for tool in result["tools"].as_array().into_iter().flatten() {
            tools.push(McpToolInfo {
                name: tool["name"].as_str().unwrap_or_default().to_string(),
                description: tool["description"].as_str().unwrap_or_default().to_string(),
                input_schema: tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object"})),
            });
        }
        Ok(tools)
    }

    /// `tools/call`.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> anyhow::Result<McpCallResult> {
        let result = self
            .request("tools/call", json!({ "name": tool, "arguments": arguments }))
            .await?;
        let is_error = result["isError"].as_bool().unwrap_or(false);
        let content = result["content"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|item| item["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(McpCallResult { content, is_error })
    }

    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = match &self.connection {
            Connection::Stdio { stdin, pending, .. } => {
                let (tx, rx) = oneshot::channel();
                pending.lock().unwrap().insert(id, tx);
                {
                    let mut stdin = stdin.lock().await;
                    let mut line = serde_json::to_string(&frame)?;
                    line.push('\n');
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.flush().await?;
                }
                tokio::time::timeout(std::time::Duration::from_secs(30), rx)
                    .await
                    .map_err(|_| anyhow::anyhow!("MCP request {method} timed out"))?
                    .map_err(|_| anyhow::anyhow!("MCP server closed during {method}"))?
            }
            Connection::Http { url, client } => {
                let resp = client.post(url).json(&frame).send().await?;
                if !resp.status().is_success() {
                    anyhow::bail!("MCP HTTP {method} failed: {}", resp.status());
                }
                resp.json().await?
            }
        };
        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            anyhow::bail!(
                "MCP {method} error {}: {}",
                error["code"],
                error["message"].as_str().unwrap_or("unknown")
            );
        }
        Ok(response["result"].clone())
    }

    async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        match &self.connection {
            Connection::Stdio { stdin, .. } => {
                let mut stdin = stdin.lock().await;
                let mut line = serde_json::to_string(&frame)?;
                line.push('\n');
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await?;
            }
            Connection::Http { url, client } => {
                let _ = client.post(url).json(&frame).send().await?;
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal MCP echo server as a shell script: answers initialize,
    /// tools/list with one tool, and tools/call by echoing the arguments.
    fn fake_server_script() -> &'static str {
        r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}\n' "$id" ;;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echoes","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echoed"}],"isError":false}}\n' "$id" ;;
    *) : ;;
  esac
done
"#
    }

    async fn connect_fake() -> McpClient {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("server.sh");
        std::fs::write(&script, fake_server_script()).unwrap();
        let client = McpClient::connect(
            "fake",
            McpTransport::Stdio {
                command: "sh".into(),
                args: vec![script.display().to_string()],
            },
        )
        .await
        .unwrap();
        // Keep the tempdir alive for the duration of the test process.
        std::mem::forget(dir);
        client
    }

    #[tokio::test]
    async fn handshake_and_list_tools() {
        let client = connect_fake().await;
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[tokio::test]
    async fn call_tool_returns_text_content() {
        let client = connect_fake().await;
        let result = client
            .call_tool("echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content, "echoed");
    }

    #[tokio::test]
    async fn connect_fails_for_missing_binary() {
        let result = McpClient::connect(
            "broken",
            McpTransport::Stdio {
                command: "/nonexistent/mcp-server".into(),
                args: vec![],
            },
        )
        .await;
        assert!(result.is_err());
    }
}
