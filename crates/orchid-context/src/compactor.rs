// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use orchid_bus::{Event, EventBus};
use orchid_model::{CompletionRequest, ModelProvider, WireMessage};
use orchid_store::{CompactionPart, MessagePart, PartPayload, Store};

use crate::history::VectorHistory;
use crate::vector::HistoryPayload;

/// Fixed summarization prompt for the hidden compaction agent.
pub const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

/// Result of one compaction pass.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub summary_id: String,
    pub compacted_message_count: u32,
    pub compacted_token_count: u64,
    /// True when the prefix was already compacted and nothing happened.
    pub noop: bool,
}

/// LLM-driven summarization of a contiguous history prefix.
///
/// Source rows are deleted from the vector collection only; in primary
/// storage they are flagged `is_compacted`, which also makes a repeated
/// call with the same set a no-op.
pub struct Compactor {
    provider: Arc<dyn ModelProvider>,
    store: Arc<Store>,
    bus: EventBus,
}

impl Compactor {
    pub fn new(provider: Arc<dyn ModelProvider>, store: Arc<Store>, bus: EventBus) -> Self {
        Self {
            provider,
            store,
            bus,
        }
    }

    /// Compact `prefix` (chronological, non-summary entries) of a session.
    pub async fn compact(
        &self,
        history: &VectorHistory,
        session_id: &str,
        prefix: &[HistoryPayload],
    ) -> anyhow::Result<CompactionOutcome> {
        let sources: Vec<&HistoryPayload> = prefix.iter().filter(|e| !e.is_summary).collect();
        if sources.is_empty() {
            return Ok(CompactionOutcome {
                summary_id: String::new(),
                compacted_message_count: 0,
                compacted_token_count: 0,
                noop: true,
            });
        }

        // Idempotence: when every source row is already flagged, a second
        // call with the same set does nothing.
        let mut all_compacted = true;
        for entry in &sources {
            match self.store.get_message(&entry.message_id) {
                Ok(msg) if !msg.is_compacted => {
                    all_compacted = false;
                    break;
                }
                Ok(_) => {}
                // Entries without a primary row (synthetic) don't block.
                Err(_) => {}
            }
        }
        if all_compacted {
            debug!(session_id, "compaction prefix already compacted; no-op");
            return Ok(CompactionOutcome {
                summary_id: String::new(),
                compacted_message_count: 0,
                compacted_token_count: 0,
                noop: true,
            });
        }

        let transcript = sources
            .iter()
            .map(|e| format!("{}: {}", e.role, e.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let token_count: u64 = sources.iter().map(|e| e.token_estimate as u64).sum();

        let response = self
            .provider
            .chat(CompletionRequest {
                messages: vec![
                    WireMessage::system(SUMMARIZE_PROMPT),
                    WireMessage::user(transcript),
                ],
                tools: vec![],
                stream: false,
            })
            .await?;
        if response.text.trim().is_empty() {
            anyhow::bail!("compaction model returned an empty summary");
        }

        let ids: Vec<String> = sources.iter().map(|e| e.message_id.clone()).collect();
        let summary_id = history
            .insert_summary(session_id, &response.text, ids.clone())
            .await?;
        history.remove(session_id, &ids).await?;
        self.store.mark_messages_compacted(&ids)?;

        // Record the boundary on the session's latest message.
        let compaction = CompactionPart {
            summary: response.text.clone(),
            compacted_message_count: sources.len() as u32,
            compacted_token_count: token_count,
            compacted_at: Utc::now(),
        };
        let mut boundary_message_id = String::new();
        match self.store.latest_message_id(session_id) {
            Ok(Some(message_id)) => {
                let order = self.store.next_order_index(&message_id)?;
                let mut part = MessagePart::new(
                    &message_id,
                    session_id,
                    order,
                    PartPayload::Compaction(compaction),
                );
                self.store.create_part(&mut part)?;
                boundary_message_id = message_id;
            }
            Ok(None) => warn!(session_id, "no message to attach compaction boundary to"),
            Err(e) => warn!(session_id, error = %e, "compaction boundary write failed"),
        }

        self.bus.publish(
            "compactor",
            Event::MessageCompacted {
                session_id: session_id.to_string(),
                message_id: boundary_message_id,
                compacted_count: sources.len() as u32,
            },
        );

        debug!(
            session_id,
            count = sources.len(),
            tokens = token_count,
            "history compacted"
        );
        Ok(CompactionOutcome {
            summary_id,
            compacted_message_count: sources.len() as u32,
            compacted_token_count: token_count,
            noop: false,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
