// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-session write exclusion.
///
/// Message and part writes within one session must never interleave (the
/// order-index invariant depends on it); a per-session async mutex gives
/// that without a global lock, so distinct sessions — including a parent
/// and its subagents' internal sessions — proceed in parallel.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a session, creating it on first use.
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            Arc::clone(
                locks
                    .entry(session_id.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry for a deleted session.
    pub fn forget(&self, session_id: &str) {
        self.locks.lock().unwrap().remove(session_id);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
