// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One question shown to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub allow_multiple: bool,
    #[serde(default)]
    pub allow_custom: bool,
}

/// A batch of questions sent to the UI collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionAnswer {
    /// Selected options and/or the custom answer text.
    pub selected: Vec<String>,
}

/// Scope of a granted permission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskScope {
    /// Valid for this invocation only.
    Once,
    /// Cached for the lifetime of the session.
    Session,
    /// Persisted across sessions.
    Always,
}

/// Result of asking the user for a permission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskOutcome {
    Granted(AskScope),
    Denied,
}

/// The single mandatory UI callback of the core.
///
/// Primary agents get the real frontend implementation; subagents always
/// get [`DenyAllAsker`] because they cannot request user input.
#[async_trait]
pub trait AskUser: Send + Sync {
    /// Free-form questions surfaced by tools.
    async fn ask(&self, request: QuestionRequest) -> anyhow::Result<Vec<QuestionAnswer>>;

    /// Permission decision for a gated tool call.
    async fn ask_permission(&self, tool_name: &str, summary: &str) -> AskOutcome;
}

/// One build/lint finding reported by the UI collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: String,
    pub line: u32,
    pub severity: String,
    pub message: String,
}

/// Diagnostics are provided by the frontend (editor, language server);
/// the core never assumes a language toolchain of its own.
#[async_trait]
pub trait Diagnostics: Send + Sync {
    async fn diagnostics(&self, files: &[String]) -> anyhow::Result<Vec<Diagnostic>>;
}

/// Stub that denies everything; installed for subagents and headless runs.
pub struct DenyAllAsker;

#[async_trait]
impl AskUser for DenyAllAsker {
    async fn ask(&self, _request: QuestionRequest) -> anyhow::Result<Vec<QuestionAnswer>> {
        anyhow::bail!("no interactive user available")
    }

    async fn ask_permission(&self, _tool_name: &str, _summary: &str) -> AskOutcome {
        AskOutcome::Denied
    }
}

/// Test helper granting everything at the given scope.
pub struct GrantAllAsker(pub AskScope);

#[async_trait]
impl AskUser for GrantAllAsker {
    async fn ask(&self, request: QuestionRequest) -> anyhow::Result<Vec<QuestionAnswer>> {
        Ok(request
            .questions
            .iter()
            .map(|q| QuestionAnswer {
                selected: q.options.first().cloned().into_iter().collect(),
            })
            .collect())
    }

    async fn ask_permission(&self, _tool_name: &str, _summary: &str) -> AskOutcome {
        AskOutcome::Granted(self.0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deny_all_denies_permissions() {
        let outcome = DenyAllAsker.ask_permission("bash", "rm -rf /").await;
        assert_eq!(outcome, AskOutcome::Denied);
    }

    #[tokio::test]
    async fn deny_all_fails_questions() {
        let result = DenyAllAsker
            .ask(QuestionRequest {
                questions: vec![Question {
                    text: "continue?".into(),
                    options: vec!["yes".into()],
                    allow_multiple: false,
                    allow_custom: false,
                }],
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn grant_all_answers_with_first_option() {
        let answers = GrantAllAsker(AskScope::Once)
            .ask(QuestionRequest {
                questions: vec![Question {
                    text: "pick".into(),
                    options: vec!["a".into(), "b".into()],
                    allow_multiple: false,
                    allow_custom: false,
                }],
            })
            .await
            .unwrap();
        assert_eq!(answers[0].selected, vec!["a"]);
    }
}
