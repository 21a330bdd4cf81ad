// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("part {id} is a {actual} part, not {expected}")]
    WrongPartType {
        id: String,
        expected: &'static str,
        actual: String,
    },

    #[error("invalid state transition for part {part_id}: {from} -> {to}")]
    InvalidTransition {
        part_id: String,
        from: String,
        to: String,
    },

    #[error("order index {order_index} already taken in message {message_id}")]
    OrderIndexConflict {
        message_id: String,
        order_index: u32,
    },

    #[error("{0}")]
    InvalidInput(String),
}
