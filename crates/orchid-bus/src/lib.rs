// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Process-wide publish/subscribe bus.
//!
//! Publishing never blocks the caller: events land in an unbounded queue
//! and a dispatcher task drains them in batches on a ~16 ms tick so bursts
//! of stream chunks coalesce into single UI updates.
mod bus;
mod event;

pub use bus::{EventBus, Subscription, MAX_BATCH, QUEUE_WARN_THRESHOLD, TICK};
pub use event::{ChunkKind, Envelope, Event, UsageSummary};
