// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Persistent storage: domain records, the polymorphic message-part model,
//! and the SQLite adapters behind them.
//!
//! This crate is the single site that knows how part variants map to their
//! storage payloads; everything above it matches on the typed enum.
mod domain;
mod error;
mod part;
mod store;

pub use domain::{
    Agent, Message, Project, Role, Session, SubSession, SubSessionStatus, TokenUsage,
};
pub use error::StoreError;
pub use part::{
    CompactionPart, MessagePart, PartKind, PartPayload, StepStatus, SubtaskPart, ToolPart,
    ToolStatus, TypedPart,
};
pub use store::{EventRecord, Store};
