// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

/// Fixed token heuristic for history accounting: ceil(chars / 3.5).
///
/// Provider-reported usage is the authoritative figure for billing; this
/// estimate exists only so retrieval and compaction decisions are cheap
/// and deterministic, and is never reconciled against provider numbers.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() as f64 / 3.5).ceil() as usize
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
