// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP (Model Context Protocol) client and tool bridging.
//!
//! Speaks JSON-RPC 2.0 over stdio (newline-delimited frames to a spawned
//! server process) or HTTP POST.  Discovered tools register into the tool
//! registry under `mcp__{server}__{tool}` so they can never collide with
//! built-ins.
mod bridge;
mod client;

pub use bridge::{bridge_tool_name, register_server, McpBridgedTool};
pub use client::{McpCallResult, McpClient, McpToolInfo, McpTransport};
