// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::{retry, CompletionRequest, StreamEvent, Usage};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// Result of a single-shot (non-streamed) completion.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Usage,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider identifier for status display and message attribution.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    ///
    /// Implementations must observe `cancel` at every network read; a
    /// cancelled stream ends with `Finish { reason: Cancelled, .. }` or
    /// simply terminates.
    async fn stream_chat(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<EventStream>;

    /// Single-shot completion used for summarization and other hidden
    /// agents.  Default implementation drains the streamed variant.
    async fn chat(&self, req: CompletionRequest) -> anyhow::Result<ChatResponse> {
        use futures::StreamExt;
        let mut stream = self
            .stream_chat(
                CompletionRequest {
                    stream: false,
                    ..req
                },
                CancellationToken::new(),
            )
            .await?;
        let mut out = ChatResponse::default();
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta(t) => out.text.push_str(&t),
                StreamEvent::Finish { usage, .. } => out.usage = usage,
                _ => {}
            }
        }
        Ok(out)
    }

    /// True when `err` is worth retrying with backoff (rate limits,
    /// transport hiccups).  Auth and other 4xx failures are permanent.
    fn retryable(&self, err: &anyhow::Error) -> bool {
        retry::is_transient_error(err)
    }

    /// Context window used for budgeting when the catalog knows nothing
    /// better.
    fn context_window(&self) -> usize {
        128_000
    }
}
