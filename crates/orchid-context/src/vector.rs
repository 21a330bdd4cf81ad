// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Payload stored with every point in a session collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPayload {
    pub message_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub token_estimate: usize,
    #[serde(default)]
    pub is_summary: bool,
    #[serde(default)]
    pub summarized_ids: Vec<String>,
}

/// One point: id, fixed-dimension vector, payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HistoryPayload,
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub point: VectorPoint,
    pub score: f32,
}

/// Contract consumed from the vector database (cosine distance).
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> anyhow::Result<()>;
    async fn upsert_point(&self, collection: &str, point: VectorPoint) -> anyhow::Result<()>;
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<ScoredPoint>>;
    async fn scroll_all(&self, collection: &str) -> anyhow::Result<Vec<VectorPoint>>;
    async fn delete_points(&self, collection: &str, ids: &[String]) -> anyhow::Result<()>;
    async fn delete_collection(&self, name: &str) -> anyhow::Result<()>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// In-process vector store used offline and in tests.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, HashMap<String, VectorPoint>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, name: &str, _dimension: usize) -> anyhow::Result<()> {
        self.collections
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn upsert_point(&self, collection: &str, point: VectorPoint) -> anyhow::Result<()> {
        self.collections
            .write()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .insert(point.id.clone(), point);
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<ScoredPoint>> {
        let collections = self.collections.read().unwrap();
        let points = match collections.get(collection) {
            Some(p) => p,
            None => return Ok(vec![]),
        };
        let mut scored: Vec<ScoredPoint> = points
            .values()
            .map(|p| ScoredPoint {
                score: cosine_similarity(vector, &p.vector),
                point: p.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn scroll_all(&self, collection: &str) -> anyhow::Result<Vec<VectorPoint>> {
        let collections = self.collections.read().unwrap();
        Ok(collections
            .get(collection)
            .map(|points| points.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_points(&self, collection: &str, ids: &[String]) -> anyhow::Result<()> {
        if let Some(points) = self.collections.write().unwrap().get_mut(collection) {
            for id in ids {
                points.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> anyhow::Result<()> {
        self.collections.write().unwrap().remove(name);
        Ok(())
    }
}

/// Qdrant REST adapter.  Collections are created with cosine distance;
/// payloads round-trip through the point payload JSON.
pub struct QdrantStore {
    base_url: String,
    client: reqwest::Client,
}

impl QdrantStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, name: &str, dimension: usize) -> anyhow::Result<()> {
        let body = json!({
            "vectors": { "size": dimension, "distance": "Cosine" }
        });
        let resp = self
            .client
            .put(self.url(&format!("/collections/{name}")))
            .json(&body)
            .send()
            .await?;
        // 409 means the collection already exists, which is the goal.
        if !resp.status().is_success() && resp.status().as_u16() != 409 {
            anyhow::bail!("ensure-collection failed: HTTP {}", resp.status());
        }
        Ok(())
    }

    async fn upsert_point(&self, collection: &str, point: VectorPoint) -> anyhow::Result<()> {
        let body = json!({
            "points": [{
                "id": point.id,
                "vector": point.vector,
                "payload": point.payload,
            }]
        });
        let resp = self
            .client
            .put(self.url(&format!("/collections/{collection}/points?wait=true")))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("upsert-point failed: HTTP {}", resp.status());
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> anyhow::Result<Vec<ScoredPoint>> {
        let body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
            "with_vector": true,
        });
        let resp = self
            .client
            .post(self.url(&format!("/collections/{collection}/points/search")))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("search failed: HTTP {}", resp.status());
        }
        let parsed: serde_json::Value = resp.json().await?;
        let mut out = Vec::new();
        for hit in parsed["result"].as_array().into_iter().flatten() {
            let payload: HistoryPayload = serde_json::from_value(hit["payload"].clone())?;
            let vector: Vec<f32> = serde_json::from_value(hit["vector"].clone()).unwrap_or_default();
            out.push(ScoredPoint {
                score: hit["score"].as_f64().unwrap_or(0.0) as f32,
                point: VectorPoint {
                    id: hit["id"].as_str().unwrap_or_default().to_string(),
                    vector,
                    payload,
                },
            });
        }
        Ok(out)
    }

    async fn scroll_all(&self, collection: &str) -> anyhow::Result<Vec<VectorPoint>> {
        let mut out = Vec::new();
        let mut offset: Option<serde_json::Value> = None;
        loop {
            let mut body = json!({
                "limit": 256,
                "with_payload": true,
                "with_vector": true,
            });
            if let Some(off) = &offset {
                body["offset"] = off.clone();
            }
            let resp = self
                .client
                .post(self.url(&format!("/collections/{collection}/points/scroll")))
                .json(&body)
                .send()
                .await?;
            if !resp.status().is_success() {
                anyhow::bail!("scroll failed: HTTP {}", resp.status());
            }
            let parsed: serde_json::Value = resp.json().await?;
            for point in parsed["result"]["points"].as_array().into_iter().flatten() {
                let payload: HistoryPayload = serde_json::from_value(point["payload"].clone())?;
                let vector: Vec<f32> =
                    serde_json::from_value(point["vector"].clone()).unwrap_or_default();
                out.push(VectorPoint {
                    id: point["id"].as_str().unwrap_or_default().to_string(),
                    vector,
                    payload,
                });
            }
            match parsed["result"]["next_page_offset"].clone() {
                serde_json::Value::Null => break,
                next => offset = Some(next),
            }
        }
        Ok(out)
    }

    async fn delete_points(&self, collection: &str, ids: &[String]) -> anyhow::Result<()> {
        let body = json!({ "points": ids });
        let resp = self
            .client
            .post(self.url(&format!(
                "/collections/{collection}/points/delete?wait=true"
            )))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("delete-points failed: HTTP {}", resp.status());
        }
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/collections/{name}")))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("delete-collection failed: HTTP {}", resp.status());
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn point(id: &str, vector: Vec<f32>) -> VectorPoint {
        VectorPoint {
            id: id.into(),
            vector,
            payload: HistoryPayload {
                message_id: id.into(),
                role: "user".into(),
                content: format!("content {id}"),
                created_at: Utc::now(),
                token_estimate: 3,
                is_summary: false,
                summarized_ids: vec![],
            },
        }
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, 0.25, 0.1];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_handles_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn memory_store_search_orders_by_similarity() {
        let store = MemoryVectorStore::new();
        store.ensure_collection("c", 2).await.unwrap();
        store
            .upsert_point("c", point("near", vec![1.0, 0.0]))
            .await
            .unwrap();
        store
            .upsert_point("c", point("far", vec![0.0, 1.0]))
            .await
            .unwrap();
        let hits = store.search("c", &[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits[0].point.id, "near");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn memory_store_upsert_replaces_by_id() {
        let store = MemoryVectorStore::new();
        store.upsert_point("c", point("p", vec![1.0])).await.unwrap();
        let mut updated = point("p", vec![0.5]);
        updated.payload.content = "replaced".into();
        store.upsert_point("c", updated).await.unwrap();
        let all = store.scroll_all("c").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload.content, "replaced");
    }

    #[tokio::test]
    async fn memory_store_delete_points_removes_only_named_ids() {
        let store = MemoryVectorStore::new();
        store.upsert_point("c", point("a", vec![1.0])).await.unwrap();
        store.upsert_point("c", point("b", vec![1.0])).await.unwrap();
        store.delete_points("c", &["a".into()]).await.unwrap();
        let remaining = store.scroll_all("c").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "b");
    }

    #[tokio::test]
    async fn memory_store_delete_collection_is_total() {
        let store = MemoryVectorStore::new();
        store.upsert_point("c", point("a", vec![1.0])).await.unwrap();
        store.delete_collection("c").await.unwrap();
        assert!(store.scroll_all("c").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_on_missing_collection_is_empty_not_error() {
        let store = MemoryVectorStore::new();
        assert!(store.search("missing", &[1.0], 5).await.unwrap().is_empty());
    }
}
