// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio_util::sync::CancellationToken;

use crate::{
    provider::EventStream, CompletionRequest, FinishReason, Role, StreamEvent, Usage,
};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream_chat(
        &self,
        req: CompletionRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<EventStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Finish {
                reason: FinishReason::Stop,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 10,
                    ..Default::default()
                },
            }),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock provider.  Each call to `stream_chat` pops the next
/// event script from the front of the queue.  This lets tests specify exact
/// event sequences — including tool calls — without network access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<VecDeque<Vec<StreamEvent>>>>,
    /// Errors injected before scripts are consumed; each `stream_chat` call
    /// pops one error first, enabling retry-path tests.
    errors: Arc<Mutex<VecDeque<anyhow::Error>>>,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// All requests seen, in order.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into_iter().collect())),
            errors: Arc::new(Mutex::new(VecDeque::new())),
            last_request: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Provider that answers every call with the same plain text turn.
    pub fn always_text(text: &str) -> Self {
        let script = vec![
            StreamEvent::TextDelta(text.to_string()),
            StreamEvent::Finish {
                reason: FinishReason::Stop,
                usage: Usage::default(),
            },
        ];
        // A generous number of copies; tests never run hundreds of turns.
        Self::new(vec![script; 64])
    }

    /// Queue an error to be returned before the next script is consumed.
    pub fn push_error(&self, err: anyhow::Error) {
        self.errors.lock().unwrap().push_back(err);
    }

    /// Convenience: one complete tool-call turn followed by a text turn.
    pub fn tool_then_text(
        call_id: &str,
        tool: &str,
        arguments: &str,
        final_text: &str,
    ) -> Self {
        Self::new(vec![
            vec![
                StreamEvent::ToolCallPart {
                    index: 0,
                    id: call_id.to_string(),
                    name: tool.to_string(),
                    arguments: arguments.to_string(),
                },
                StreamEvent::Finish {
                    reason: FinishReason::ToolCalls,
                    usage: Usage::default(),
                },
            ],
            vec![
                StreamEvent::TextDelta(final_text.to_string()),
                StreamEvent::Finish {
                    reason: FinishReason::Stop,
                    usage: Usage::default(),
                },
            ],
        ])
    }

    pub fn remaining_scripts(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn stream_chat(
        &self,
        req: CompletionRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<EventStream> {
        *self.last_request.lock().unwrap() = Some(req.clone());
        self.requests.lock().unwrap().push(req);

        if let Some(err) = self.errors.lock().unwrap().pop_front() {
            return Err(err);
        }

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                vec![
                    StreamEvent::TextDelta("[script exhausted]".to_string()),
                    StreamEvent::Finish {
                        reason: FinishReason::Stop,
                        usage: Usage::default(),
                    },
                ]
            });
        let events: Vec<anyhow::Result<StreamEvent>> = script.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(events)))
    }
}

/// Fails the first `failures` calls with a transient error, then behaves
/// like [`MockProvider`].  Exercises the backoff/retry path.
pub struct FlakyMockProvider {
    remaining_failures: Arc<Mutex<u32>>,
}

impl FlakyMockProvider {
    pub fn new(failures: u32) -> Self {
        Self {
            remaining_failures: Arc::new(Mutex::new(failures)),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for FlakyMockProvider {
    fn name(&self) -> &str {
        "flaky-mock"
    }
    fn model_name(&self) -> &str {
        "flaky-mock-model"
    }

    async fn stream_chat(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<EventStream> {
        {
            let mut remaining = self.remaining_failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                anyhow::bail!("503 service unavailable (simulated)");
            }
        }
        MockProvider.stream_chat(req, cancel).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{ModelProvider, WireMessage};

    async fn drain(mut s: EventStream) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(e) = s.next().await {
            out.push(e.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let req = CompletionRequest {
            messages: vec![WireMessage::user("ping")],
            ..Default::default()
        };
        let events = drain(
            MockProvider
                .stream_chat(req, CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        assert!(matches!(&events[0], StreamEvent::TextDelta(t) if t == "MOCK: ping"));
        assert!(matches!(
            events.last().unwrap(),
            StreamEvent::Finish {
                reason: FinishReason::Stop,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn scripted_pops_scripts_in_order() {
        let p = ScriptedMockProvider::new(vec![
            vec![
                StreamEvent::TextDelta("first".into()),
                StreamEvent::Finish {
                    reason: FinishReason::Stop,
                    usage: Usage::default(),
                },
            ],
            vec![
                StreamEvent::TextDelta("second".into()),
                StreamEvent::Finish {
                    reason: FinishReason::Stop,
                    usage: Usage::default(),
                },
            ],
        ]);
        let req = CompletionRequest::default();
        let a = drain(
            p.stream_chat(req.clone(), CancellationToken::new())
                .await
                .unwrap(),
        )
        .await;
        let b = drain(
            p.stream_chat(req, CancellationToken::new()).await.unwrap(),
        )
        .await;
        assert!(matches!(&a[0], StreamEvent::TextDelta(t) if t == "first"));
        assert!(matches!(&b[0], StreamEvent::TextDelta(t) if t == "second"));
    }

    #[tokio::test]
    async fn scripted_records_requests() {
        let p = ScriptedMockProvider::always_text("ok");
        let req = CompletionRequest {
            messages: vec![WireMessage::user("q")],
            ..Default::default()
        };
        let _ = p.stream_chat(req, CancellationToken::new()).await.unwrap();
        assert_eq!(p.requests.lock().unwrap().len(), 1);
        assert!(p.last_request.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn chat_default_impl_concatenates_text() {
        let p = ScriptedMockProvider::always_text("summary text");
        let resp = p.chat(CompletionRequest::default()).await.unwrap();
        assert_eq!(resp.text, "summary text");
    }

    #[tokio::test]
    async fn flaky_fails_then_recovers() {
        let p = FlakyMockProvider::new(1);
        let req = CompletionRequest {
            messages: vec![WireMessage::user("x")],
            ..Default::default()
        };
        assert!(p
            .stream_chat(req.clone(), CancellationToken::new())
            .await
            .is_err());
        assert!(p.stream_chat(req, CancellationToken::new()).await.is_ok());
    }
}
