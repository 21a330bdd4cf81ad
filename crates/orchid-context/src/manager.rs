// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use orchid_config::ContextConfig;
use orchid_store::{PartPayload, Store};

use crate::compactor::Compactor;
use crate::history::VectorHistory;
use crate::vector::HistoryPayload;

/// Budget parameters for one retrieval.
#[derive(Debug, Clone, Copy)]
pub struct ContextParams {
    /// Model token budget `B`.
    pub budget: usize,
    /// Safety reserve `R`.
    pub reserve: usize,
    /// Minimum message count before compaction may run (`M_min`).
    pub min_compaction_messages: usize,
    pub recent_limit: usize,
    pub relevant_limit: usize,
    pub keep_tail: usize,
}

impl From<&ContextConfig> for ContextParams {
    fn from(cfg: &ContextConfig) -> Self {
        Self {
            budget: cfg.budget_tokens,
            reserve: cfg.reserve_tokens,
            min_compaction_messages: cfg.min_compaction_messages,
            recent_limit: cfg.recent_limit,
            relevant_limit: cfg.relevant_limit,
            keep_tail: cfg.keep_tail,
        }
    }
}

impl ContextParams {
    /// Available budget `A = B − R`, falling back to `B/2` when the
    /// reserve eats the whole budget.
    pub fn available(&self) -> usize {
        if self.budget > self.reserve {
            self.budget - self.reserve
        } else {
            (self.budget / 2).max(1)
        }
    }
}

/// The history slice handed to the provider-prompt builder.
#[derive(Debug, Clone)]
pub struct ContextSelection {
    /// Chronological entries within the available budget.
    pub entries: Vec<HistoryPayload>,
    pub compaction_ran: bool,
    /// True when the vector store failed and the selection fell back to
    /// recents from primary storage.
    pub degraded: bool,
}

impl ContextSelection {
    pub fn token_sum(&self) -> usize {
        self.entries.iter().map(|e| e.token_estimate).sum()
    }
}

/// Token-bounded history retrieval: recents when they fit, relevance-
/// merged selection when they don't, compaction when the merged set is
/// still too large.  Vector-store failures are non-fatal.
pub struct ContextManager {
    history: Arc<VectorHistory>,
    store: Arc<Store>,
    compactor: Option<Arc<Compactor>>,
    params: ContextParams,
}

impl ContextManager {
    pub fn new(
        history: Arc<VectorHistory>,
        store: Arc<Store>,
        compactor: Option<Arc<Compactor>>,
        params: ContextParams,
    ) -> Self {
        Self {
            history,
            store,
            compactor,
            params,
        }
    }

    pub fn history(&self) -> &Arc<VectorHistory> {
        &self.history
    }

    pub fn params(&self) -> ContextParams {
        self.params
    }

    /// Build the history selection for the next provider call.
    pub async fn build(&self, session_id: &str, query: &str) -> ContextSelection {
        let available = self.params.available();

        let recents = match self.history.recents(session_id, self.params.recent_limit).await {
            Ok(r) => r,
            Err(e) => {
                warn!(session_id, error = %e, "vector history unavailable; recents-only fallback");
                return self.fallback_from_store(session_id, available);
            }
        };

        let recent_sum: usize = recents.iter().map(|e| e.token_estimate).sum();
        if recent_sum <= available {
            return ContextSelection {
                entries: recents,
                compaction_ran: false,
                degraded: false,
            };
        }

        // Over budget: merge the relevance set with the always-keep tail.
        let relevant = match self
            .history
            .relevant(session_id, query, self.params.relevant_limit)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(session_id, error = %e, "relevance search failed; trimming recents");
                return ContextSelection {
                    entries: trim_to_budget(recents, available, self.params.keep_tail),
                    compaction_ran: false,
                    degraded: true,
                };
            }
        };

        let keep = self.params.keep_tail.min(recents.len());
        let tail: Vec<HistoryPayload> = recents[recents.len() - keep..].to_vec();
        let mut seen: HashSet<String> = HashSet::new();
        let mut merged: Vec<HistoryPayload> = Vec::new();
        for entry in tail.iter().cloned().chain(relevant.into_iter()) {
            if seen.insert(entry.message_id.clone()) {
                merged.push(entry);
            }
        }
        merged.sort_by_key(|e| e.created_at);

        let merged_sum: usize = merged.iter().map(|e| e.token_estimate).sum();
        let mut compaction_ran = false;
        if merged_sum > available && merged.len() >= self.params.min_compaction_messages {
            if let Some(compactor) = &self.compactor {
                let tail_ids: HashSet<&str> =
                    tail.iter().map(|e| e.message_id.as_str()).collect();
                let prefix = compaction_prefix(&merged, &tail_ids, available);
                if !prefix.is_empty() {
                    match compactor.compact(&self.history, session_id, &prefix).await {
                        Ok(outcome) if !outcome.noop => {
                            compaction_ran = true;
                            debug!(
                                session_id,
                                compacted = outcome.compacted_message_count,
                                "compaction ran during context build"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            // Compaction failure is silent towards the user;
                            // the selection degrades to trimming.
                            debug!(session_id, error = %e, "compaction failed; skipping");
                        }
                    }
                }
            }
            if compaction_ran {
                let refreshed = self
                    .history
                    .recents(session_id, self.params.recent_limit)
                    .await
                    .unwrap_or(merged);
                return ContextSelection {
                    entries: trim_to_budget(refreshed, available, self.params.keep_tail),
                    compaction_ran,
                    degraded: false,
                };
            }
        }

        ContextSelection {
            entries: trim_to_budget(merged, available, self.params.keep_tail),
            compaction_ran,
            degraded: false,
        }
    }

    /// Vector store down: rebuild recents from primary storage, trimmed to
    /// the budget; compaction is disabled for the call.
    fn fallback_from_store(&self, session_id: &str, available: usize) -> ContextSelection {
        let messages = match self.store.list_messages(session_id) {
            Ok(m) => m,
            Err(e) => {
                warn!(session_id, error = %e, "primary storage also unavailable");
                return ContextSelection {
                    entries: vec![],
                    compaction_ran: false,
                    degraded: true,
                };
            }
        };
        let mut entries = Vec::new();
        for msg in messages.iter().filter(|m| !m.is_compacted) {
            let text = match self.store.parts_by_message(&msg.id) {
                Ok(parts) => parts
                    .iter()
                    .filter_map(|p| match &p.payload {
                        PartPayload::Text { content } => Some(content.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(_) => continue,
            };
            if text.is_empty() {
                continue;
            }
            entries.push(HistoryPayload {
                message_id: msg.id.clone(),
                role: msg.role.as_str().to_string(),
                content: text.clone(),
                created_at: msg.created_at,
                token_estimate: crate::estimate_tokens(&text),
                is_summary: false,
                summarized_ids: vec![],
            });
        }
        let skip = entries.len().saturating_sub(self.params.recent_limit);
        let entries = entries.split_off(skip);
        ContextSelection {
            entries: trim_to_budget(entries, available, self.params.keep_tail),
            compaction_ran: false,
            degraded: true,
        }
    }
}

/// Drop oldest entries until the sum fits, never dropping the keep-tail.
fn trim_to_budget(
    mut entries: Vec<HistoryPayload>,
    available: usize,
    keep_tail: usize,
) -> Vec<HistoryPayload> {
    let mut sum: usize = entries.iter().map(|e| e.token_estimate).sum();
    let mut dropped = 0usize;
    while sum > available && entries.len() > keep_tail {
        let removed = entries.remove(0);
        sum -= removed.token_estimate;
        dropped += 1;
    }
    if dropped > 0 {
        debug!(dropped, "dropped oldest history entries to fit budget");
    }
    entries
}

/// Contiguous non-summary prefix (excluding the keep-tail) whose removal
/// brings the remainder under the budget.
fn compaction_prefix(
    merged: &[HistoryPayload],
    tail_ids: &HashSet<&str>,
    available: usize,
) -> Vec<HistoryPayload> {
    let total: usize = merged.iter().map(|e| e.token_estimate).sum();
    let mut prefix = Vec::new();
    let mut removed = 0usize;
    for entry in merged {
        if total - removed <= available {
            break;
        }
        if tail_ids.contains(entry.message_id.as_str()) || entry.is_summary {
            break;
        }
        removed += entry.token_estimate;
        prefix.push(entry.clone());
    }
    prefix
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::Path;

    use chrono::Utc;

    use super::*;
    use crate::{Compactor, HashEmbedder, MemoryVectorStore, VectorHistory};
    use orchid_bus::EventBus;
    use orchid_model::ScriptedMockProvider;
    use orchid_store::{Message, MessagePart, Role};

    fn params(budget: usize, reserve: usize) -> ContextParams {
        ContextParams {
            budget,
            reserve,
            min_compaction_messages: 10,
            recent_limit: 100,
            relevant_limit: 30,
            keep_tail: 10,
        }
    }

    async fn seeded_session(
        n: usize,
        chars_per_message: usize,
    ) -> (Arc<Store>, Arc<VectorHistory>, String) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let project = store.create_project("p", Path::new("/tmp/p")).unwrap();
        let session = store.create_session(project.id, None).unwrap();
        let history = Arc::new(VectorHistory::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(HashEmbedder::new(32)),
        ));
        let base = Utc::now();
        for i in 0..n {
            let msg = Message::new(&session.id, if i % 2 == 0 { Role::User } else { Role::Assistant });
            store.create_message(&msg).unwrap();
            let content = format!("message {i} {}", "x".repeat(chars_per_message));
            history
                .record(
                    &session.id,
                    &msg.id,
                    msg.role.as_str(),
                    &content,
                    base + chrono::Duration::seconds(i as i64),
                )
                .await
                .unwrap();
        }
        (store, history, session.id.clone())
    }

    #[test]
    fn available_budget_subtracts_reserve() {
        assert_eq!(params(1000, 200).available(), 800);
        // Non-positive A falls back to B/2.
        assert_eq!(params(1000, 1000).available(), 500);
        assert_eq!(params(100, 5000).available(), 50);
    }

    #[tokio::test]
    async fn recents_within_budget_come_back_chronologically() {
        let (store, history, session_id) = seeded_session(5, 30).await;
        let mgr = ContextManager::new(history, store, None, params(100_000, 0));
        let selection = mgr.build(&session_id, "anything").await;
        assert!(!selection.degraded);
        assert!(!selection.compaction_ran);
        assert_eq!(selection.entries.len(), 5);
        for pair in selection.entries.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[tokio::test]
    async fn over_budget_selection_fits_available() {
        // 50 messages ≈ 300 tokens each, A = 4000.
        let (store, history, session_id) = seeded_session(50, 1040).await;
        let mgr = ContextManager::new(history, store, None, params(4000, 0));
        let selection = mgr.build(&session_id, "message 49").await;
        assert!(selection.token_sum() <= 4000, "sum = {}", selection.token_sum());
        assert!(!selection.entries.is_empty());
    }

    #[tokio::test]
    async fn compaction_triggers_when_merged_set_is_large() {
        let (store, history, session_id) = seeded_session(50, 1040).await;
        let compactor = Arc::new(Compactor::new(
            Arc::new(ScriptedMockProvider::always_text("compact summary")),
            Arc::clone(&store),
            EventBus::new(),
        ));
        let mgr = ContextManager::new(
            Arc::clone(&history),
            Arc::clone(&store),
            Some(compactor),
            params(4000, 0),
        );
        let selection = mgr.build(&session_id, "message 49").await;
        assert!(selection.compaction_ran);
        assert!(selection.token_sum() <= 4000);
        // The boundary part is now discoverable.
        assert!(store.most_recent_compaction(&session_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn degraded_fallback_reads_primary_storage() {
        struct FailingStore;
        #[async_trait::async_trait]
        impl crate::VectorStore for FailingStore {
            async fn ensure_collection(&self, _: &str, _: usize) -> anyhow::Result<()> {
                anyhow::bail!("down")
            }
            async fn upsert_point(&self, _: &str, _: crate::VectorPoint) -> anyhow::Result<()> {
                anyhow::bail!("down")
            }
            async fn search(
                &self,
                _: &str,
                _: &[f32],
                _: usize,
            ) -> anyhow::Result<Vec<crate::ScoredPoint>> {
                anyhow::bail!("down")
            }
            async fn scroll_all(&self, _: &str) -> anyhow::Result<Vec<crate::VectorPoint>> {
                anyhow::bail!("down")
            }
            async fn delete_points(&self, _: &str, _: &[String]) -> anyhow::Result<()> {
                anyhow::bail!("down")
            }
            async fn delete_collection(&self, _: &str) -> anyhow::Result<()> {
                anyhow::bail!("down")
            }
        }

        let store = Arc::new(Store::open_in_memory().unwrap());
        let project = store.create_project("p", Path::new("/tmp/p")).unwrap();
        let session = store.create_session(project.id, None).unwrap();
        let msg = Message::new(&session.id, Role::User);
        store.create_message(&msg).unwrap();
        let mut part = MessagePart::new(
            &msg.id,
            &session.id,
            0,
            orchid_store::PartPayload::Text {
                content: "stored text".into(),
            },
        );
        store.create_part(&mut part).unwrap();

        let history = Arc::new(VectorHistory::new(
            Arc::new(FailingStore),
            Arc::new(HashEmbedder::new(16)),
        ));
        let mgr = ContextManager::new(history, Arc::clone(&store), None, params(1000, 0));
        let selection = mgr.build(&session.id, "q").await;
        assert!(selection.degraded);
        assert!(!selection.compaction_ran);
        assert_eq!(selection.entries.len(), 1);
        assert_eq!(selection.entries[0].content, "stored text");
    }

    #[test]
    fn trim_never_drops_the_keep_tail() {
        let now = Utc::now();
        let entries: Vec<HistoryPayload> = (0..5)
            .map(|i| HistoryPayload {
                message_id: format!("m{i}"),
                role: "user".into(),
                content: "x".into(),
                created_at: now + chrono::Duration::seconds(i),
                token_estimate: 100,
                is_summary: false,
                summarized_ids: vec![],
            })
            .collect();
        // Budget fits only one entry but the tail of 3 is protected.
        let kept = trim_to_budget(entries, 100, 3);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].message_id, "m2");
    }
}
