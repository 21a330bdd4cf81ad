// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::ModelProvider;

/// Registry of configured providers, keyed by provider id.
///
/// Written only during startup wiring; reads after that are lock-free.
/// Each provider carries a concurrency semaphore so parallel sessions and
/// subagents queue instead of exceeding the per-provider stream limit.
pub struct ProviderRegistry {
    providers: HashMap<String, Entry>,
}

struct Entry {
    provider: Arc<dyn ModelProvider>,
    limiter: Arc<Semaphore>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        id: impl Into<String>,
        provider: Arc<dyn ModelProvider>,
        max_concurrent: usize,
    ) {
        self.providers.insert(
            id.into(),
            Entry {
                provider,
                limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.get(id).map(|e| Arc::clone(&e.provider))
    }

    /// Acquire a concurrency slot for the given provider.  The permit is
    /// held for the duration of one streamed call.
    pub async fn acquire(&self, id: &str) -> Option<SemaphorePermit<'_>> {
        let entry = self.providers.get(id)?;
        // acquire() only errors when the semaphore is closed, which never
        // happens here.
        entry.limiter.acquire().await.ok()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockProvider;

    #[test]
    fn register_and_get() {
        let mut reg = ProviderRegistry::new();
        reg.register("mock", Arc::new(MockProvider), 4);
        assert!(reg.get("mock").is_some());
        assert!(reg.get("other").is_none());
    }

    #[tokio::test]
    async fn acquire_limits_concurrency() {
        let mut reg = ProviderRegistry::new();
        reg.register("mock", Arc::new(MockProvider), 1);
        let first = reg.acquire("mock").await.unwrap();
        // A second acquire would block; try_acquire shows the slot is taken.
        let second = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            reg.acquire("mock"),
        )
        .await;
        assert!(second.is_err(), "second acquire should still be queued");
        drop(first);
        assert!(reg.acquire("mock").await.is_some());
    }

    #[test]
    fn ids_are_sorted() {
        let mut reg = ProviderRegistry::new();
        reg.register("b", Arc::new(MockProvider), 1);
        reg.register("a", Arc::new(MockProvider), 1);
        assert_eq!(reg.ids(), vec!["a", "b"]);
    }
}
