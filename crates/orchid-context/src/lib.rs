// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Token-bounded history retrieval and LLM-driven compaction.
//!
//! The vector store and embedding model are consumed behind traits; any
//! failure on that side degrades to recents-only retrieval from primary
//! storage and is never fatal to the loop.
mod compactor;
mod embed;
mod estimate;
mod history;
mod manager;
mod vector;

pub use compactor::{CompactionOutcome, Compactor, SUMMARIZE_PROMPT};
pub use embed::{Embedder, HashEmbedder, HttpEmbedder};
pub use estimate::estimate_tokens;
pub use history::VectorHistory;
pub use manager::{ContextManager, ContextParams, ContextSelection};
pub use vector::{
    HistoryPayload, MemoryVectorStore, QdrantStore, ScoredPoint, VectorPoint, VectorStore,
};
