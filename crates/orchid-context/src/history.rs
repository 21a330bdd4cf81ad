// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::estimate::estimate_tokens;
use crate::vector::{HistoryPayload, VectorPoint, VectorStore};
use crate::Embedder;

/// Per-session conversation history in the vector store.
///
/// One collection per session isolates workloads; points are keyed by
/// message id so re-recording a message is an upsert, not a duplicate.
pub struct VectorHistory {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl VectorHistory {
    pub fn new(store: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    pub fn collection_name(session_id: &str) -> String {
        format!("session_{session_id}")
    }

    /// Record one message into the session's collection.
    pub async fn record(
        &self,
        session_id: &str,
        message_id: &str,
        role: &str,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let collection = Self::collection_name(session_id);
        self.store
            .ensure_collection(&collection, self.embedder.dimension())
            .await?;
        let vector = self.embedder.embed(content).await?;
        self.store
            .upsert_point(
                &collection,
                VectorPoint {
                    id: message_id.to_string(),
                    vector,
                    payload: HistoryPayload {
                        message_id: message_id.to_string(),
                        role: role.to_string(),
                        content: content.to_string(),
                        created_at,
                        token_estimate: estimate_tokens(content),
                        is_summary: false,
                        summarized_ids: vec![],
                    },
                },
            )
            .await
    }

    /// Insert a synthetic summary message replacing `summarized_ids`.
    /// Returns the summary point id.
    pub async fn insert_summary(
        &self,
        session_id: &str,
        summary: &str,
        summarized_ids: Vec<String>,
    ) -> anyhow::Result<String> {
        let collection = Self::collection_name(session_id);
        self.store
            .ensure_collection(&collection, self.embedder.dimension())
            .await?;
        let id = Uuid::new_v4().to_string();
        let vector = self.embedder.embed(summary).await?;
        self.store
            .upsert_point(
                &collection,
                VectorPoint {
                    id: id.clone(),
                    vector,
                    payload: HistoryPayload {
                        message_id: id.clone(),
                        role: "system".to_string(),
                        content: summary.to_string(),
                        created_at: Utc::now(),
                        token_estimate: estimate_tokens(summary),
                        is_summary: true,
                        summarized_ids,
                    },
                },
            )
            .await?;
        Ok(id)
    }

    /// The most recent `limit` entries, returned in chronological order.
    pub async fn recents(
        &self,
        session_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<HistoryPayload>> {
        let collection = Self::collection_name(session_id);
        let mut points = self.store.scroll_all(&collection).await?;
        points.sort_by_key(|p| p.payload.created_at);
        let skip = points.len().saturating_sub(limit);
        Ok(points.into_iter().skip(skip).map(|p| p.payload).collect())
    }

    /// Nearest-neighbour entries for a query, most relevant first.
    pub async fn relevant(
        &self,
        session_id: &str,
        query: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<HistoryPayload>> {
        let collection = Self::collection_name(session_id);
        let vector = self.embedder.embed(query).await?;
        let hits = self.store.search(&collection, &vector, limit).await?;
        debug!(session_id, hits = hits.len(), "relevance search");
        Ok(hits.into_iter().map(|h| h.point.payload).collect())
    }

    /// Remove points by message id (after compaction).  Rows in primary
    /// storage are untouched.
    pub async fn remove(&self, session_id: &str, ids: &[String]) -> anyhow::Result<()> {
        let collection = Self::collection_name(session_id);
        self.store.delete_points(&collection, ids).await
    }

    /// Drop the whole collection (session deletion).
    pub async fn drop_session(&self, session_id: &str) -> anyhow::Result<()> {
        self.store
            .delete_collection(&Self::collection_name(session_id))
            .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
