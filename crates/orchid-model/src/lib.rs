// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider abstraction: wire-level message types, the streamed completion
//! contract, retry classification, and mock providers for tests.
//!
//! Concrete HTTP drivers are external collaborators; this crate fixes the
//! interface they implement and ships deterministic in-process providers.
mod mock;
mod provider;
mod registry;
mod retry;
mod types;

pub use mock::{FlakyMockProvider, MockProvider, ScriptedMockProvider};
pub use provider::{ChatResponse, EventStream, ModelProvider};
pub use registry::ProviderRegistry;
pub use retry::{is_transient_error, with_backoff, RetryPolicy};
pub use types::{
    CompletionRequest, FinishReason, FunctionCall, MessageContent, Role, StreamEvent, ToolSchema,
    Usage, WireMessage,
};
