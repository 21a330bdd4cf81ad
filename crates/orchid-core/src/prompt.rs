// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider prompt assembly: system prompt templating and flattening of
//! the history selection into wire messages.
use std::collections::HashMap;

use orchid_context::{ContextSelection, HistoryPayload};
use orchid_model::WireMessage;
use orchid_store::Agent;

/// Substitute `{{key}}` placeholders from the agent's prompt variables.
pub fn render_system_prompt(agent: &Agent) -> String {
    substitute(&agent.system_prompt, &agent.prompt_variables)
}

fn substitute(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in variables {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Build the message list for one provider call: system prompt, then the
/// history selection in chronological order, then the current user input.
///
/// The current input is excluded from the history mapping (it was already
/// recorded before retrieval) and appended explicitly so it is always the
/// final user message regardless of what retrieval returned.
pub fn build_wire_messages(
    agent: &Agent,
    selection: &ContextSelection,
    current_user_message_id: &str,
    current_user_input: &str,
) -> Vec<WireMessage> {
    let mut messages = vec![WireMessage::system(render_system_prompt(agent))];
    for entry in &selection.entries {
        if entry.message_id == current_user_message_id {
            continue;
        }
        messages.push(entry_to_wire(entry));
    }
    messages.push(WireMessage::user(current_user_input));
    messages
}

fn entry_to_wire(entry: &HistoryPayload) -> WireMessage {
    match entry.role.as_str() {
        "assistant" => WireMessage::assistant(entry.content.clone()),
        // Summary messages carry the system role.
        "system" => WireMessage::system(entry.content.clone()),
        // Tool outputs lose their call ids in history; replaying them as
        // orphan tool-result frames would be rejected by providers.
        "tool" => WireMessage::user(format!("[tool output]\n{}", entry.content)),
        _ => WireMessage::user(entry.content.clone()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
