// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use orchid_bus::{Event, EventBus};
use orchid_store::{
    Agent, MessagePart, PartPayload, Store, SubSession, SubSessionStatus, SubtaskPart,
};
use orchid_tools::{DenyAllAsker, RuleSet};

use crate::agent_loop::{AgentLoop, Termination};
use crate::runtime::CoreDeps;

/// Arguments of one `task` tool invocation.
#[derive(Debug, Clone)]
pub struct TaskArgs {
    pub subagent_type: String,
    pub prompt: String,
    pub description: String,
    pub run_in_background: bool,
    pub max_turns: Option<u32>,
}

/// Spawns subagents into isolated child sessions, forwards their progress
/// to the parent, and collects their results.
pub struct SubagentSupervisor {
    deps: Arc<CoreDeps>,
}

const SOURCE: &str = "subagent-supervisor";

impl SubagentSupervisor {
    pub fn new(deps: Arc<CoreDeps>) -> Self {
        Self { deps }
    }

    /// Run one subagent on behalf of `parent_agent`.  Returns the text to
    /// surface as the `task` tool output, or an error string when the
    /// spawn is refused.  `cancel` is the parent's cancellation handle;
    /// cancelling it winds the subagent down to a terminal state.
    pub async fn spawn(
        &self,
        parent_session_id: &str,
        parent_message_id: &str,
        parent_agent: &Agent,
        parent_rules: &RuleSet,
        cancel: CancellationToken,
        args: TaskArgs,
    ) -> Result<String, String> {
        // Capability checks.  Subagent records are stored with
        // can_spawn_subagents = false, so a subagent calling `task` lands
        // here and is denied: recursion is structurally impossible.
        if !parent_agent.can_spawn_subagents {
            return Err(format!(
                "permission denied: agent '{}' cannot spawn subagents",
                parent_agent.slug
            ));
        }
        if !parent_agent.allowed_subagent_types.is_empty()
            && !parent_agent
                .allowed_subagent_types
                .iter()
                .any(|t| t == &args.subagent_type)
        {
            return Err(format!(
                "permission denied: subagent type '{}' is not in the allowed list",
                args.subagent_type
            ));
        }
        let mut sub_agent = self
            .deps
            .store
            .agent_by_slug(&args.subagent_type)
            .map_err(|_| format!("unknown subagent type: {}", args.subagent_type))?;
        // Enforced regardless of what the stored record claims.
        sub_agent.can_spawn_subagents = false;
        if let Some(max_turns) = args.max_turns {
            sub_agent.max_iterations = sub_agent.max_iterations.min(max_turns).max(1);
        }

        // Effective permissions: the child is never stronger than the parent.
        let effective =
            Arc::new(parent_rules.intersect(&RuleSet::from_rules(sub_agent.permissions.clone())));

        // SubSession record + subtask part in the parent conversation.
        let parent_session = self
            .deps
            .store
            .get_session(parent_session_id)
            .map_err(|e| format!("parent session lookup failed: {e}"))?;
        let sub = SubSession {
            id: uuid::Uuid::new_v4().to_string(),
            parent_session_id: parent_session_id.to_string(),
            parent_message_id: parent_message_id.to_string(),
            agent_type: sub_agent.slug.clone(),
            status: SubSessionStatus::Pending,
            prompt: args.prompt.clone(),
            result: None,
            error: None,
            effective_permissions: effective.rules(),
            created_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };
        self.deps
            .store
            .create_sub_session(&sub)
            .map_err(|e| format!("sub-session create failed: {e}"))?;
        self.deps.bus.publish(
            SOURCE,
            Event::SubSessionCreated {
                session_id: parent_session_id.to_string(),
                sub_session_id: sub.id.clone(),
                agent_type: sub_agent.slug.clone(),
            },
        );
        let subtask_part_id =
            self.create_subtask_part(parent_session_id, parent_message_id, &sub, &args);

        // Isolated internal session in the same project.
        let child_session = self
            .deps
            .store
            .create_session(
                parent_session.project_id,
                Some(&format!("subagent: {}", sub_agent.slug)),
            )
            .map_err(|e| format!("child session create failed: {e}"))?;

        let worker = Worker {
            deps: Arc::clone(&self.deps),
            sub_session_id: sub.id.clone(),
            parent_session_id: parent_session_id.to_string(),
            child_session_id: child_session.id.clone(),
            subtask_part_id,
            sub_agent,
            effective,
            prompt: args.prompt.clone(),
            cancel,
        };

        if args.run_in_background {
            let sub_id = sub.id.clone();
            tokio::spawn(async move {
                let _ = worker.run().await;
            });
            return Ok(format!(
                "started sub-session {sub_id} in the background; \
                 completion arrives as a sub-session-completed event"
            ));
        }
        // Detached even in foreground mode: when the awaiting `task` call
        // is dropped by a cancellation race, the worker still winds the
        // SubSession down to a terminal state within bounded time.
        match tokio::spawn(worker.run()).await {
            Ok(result) => result,
            Err(e) => Err(format!("subagent worker panicked: {e}")),
        }
    }

    fn create_subtask_part(
        &self,
        parent_session_id: &str,
        parent_message_id: &str,
        sub: &SubSession,
        args: &TaskArgs,
    ) -> Option<String> {
        let order = self
            .deps
            .store
            .next_order_index(parent_message_id)
            .unwrap_or(0);
        let mut part = MessagePart::new(
            parent_message_id,
            parent_session_id,
            order,
            PartPayload::Subtask(SubtaskPart {
                sub_session_id: sub.id.clone(),
                agent_type: sub.agent_type.clone(),
                prompt: args.prompt.clone(),
                status: SubSessionStatus::Pending,
                result: None,
                error: None,
            }),
        );
        match self.deps.store.create_part(&mut part) {
            Ok(()) => Some(part.id),
            Err(e) => {
                warn!(error = %e, "subtask part create failed");
                None
            }
        }
    }
}

/// One subagent execution; holds everything needed so it can run detached
/// in background mode.
struct Worker {
    deps: Arc<CoreDeps>,
    sub_session_id: String,
    parent_session_id: String,
    child_session_id: String,
    subtask_part_id: Option<String>,
    sub_agent: Agent,
    effective: Arc<RuleSet>,
    prompt: String,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) -> Result<String, String> {
        self.transition(SubSessionStatus::Running, None, None);

        // Live progress: part events from the child session are forwarded
        // to the parent as sub-session-progress.
        let _forward = forward_progress(
            &self.deps.bus,
            Arc::clone(&self.deps.store),
            &self.child_session_id,
            &self.parent_session_id,
            &self.sub_session_id,
        );

        let agent_loop = AgentLoop::new(Arc::clone(&self.deps));
        let outcome = agent_loop
            .run_with_rules(
                &self.child_session_id,
                &self.sub_agent,
                &self.prompt,
                Arc::clone(&self.effective),
                Arc::new(DenyAllAsker),
                self.cancel.clone(),
            )
            .await;

        // The bus delivers in ~16 ms batches; give the dispatcher time to
        // push the child's final part events through the forwarder before
        // it is torn down, so progress always precedes the terminal event.
        tokio::time::sleep(orchid_bus::TICK * 3).await;

        match outcome {
            Ok(outcome) if outcome.termination == Termination::Cancelled => {
                self.transition(SubSessionStatus::Cancelled, None, Some("cancelled"));
                self.deps.bus.publish(
                    SOURCE,
                    Event::SubSessionCancelled {
                        session_id: self.parent_session_id.clone(),
                        sub_session_id: self.sub_session_id.clone(),
                    },
                );
                Err("subagent cancelled".to_string())
            }
            Ok(outcome) => {
                self.transition(SubSessionStatus::Completed, Some(&outcome.final_text), None);
                self.deps.bus.publish(
                    SOURCE,
                    Event::SubSessionCompleted {
                        session_id: self.parent_session_id.clone(),
                        sub_session_id: self.sub_session_id.clone(),
                    },
                );
                debug!(
                    sub_session = %self.sub_session_id,
                    iterations = outcome.iterations,
                    "subagent completed"
                );
                Ok(format!(
                    "## Subagent Result ({})\n\n{}",
                    self.sub_agent.slug, outcome.final_text
                ))
            }
            Err(e) => {
                let error = e.to_string();
                self.transition(SubSessionStatus::Failed, None, Some(&error));
                self.deps.bus.publish(
                    SOURCE,
                    Event::SubSessionFailed {
                        session_id: self.parent_session_id.clone(),
                        sub_session_id: self.sub_session_id.clone(),
                        error: error.clone(),
                    },
                );
                Err(format!("subagent failed: {error}"))
            }
        }
    }

    /// Advance the SubSession row and its subtask part, publishing the
    /// status-change event.
    fn transition(&self, to: SubSessionStatus, result: Option<&str>, error: Option<&str>) {
        let from = self
            .deps
            .store
            .get_sub_session(&self.sub_session_id)
            .map(|s| s.status)
            .unwrap_or(SubSessionStatus::Pending);
        if let Err(e) =
            self.deps
                .store
                .update_sub_session_status(&self.sub_session_id, to, result, error)
        {
            warn!(sub_session = %self.sub_session_id, error = %e, "sub-session transition failed");
            return;
        }
        self.deps.bus.publish(
            SOURCE,
            Event::SubSessionStatusChanged {
                session_id: self.parent_session_id.clone(),
                sub_session_id: self.sub_session_id.clone(),
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            },
        );
        if let Some(part_id) = &self.subtask_part_id {
            if let Ok(mut part) = self.deps.store.get_part(part_id) {
                if let PartPayload::Subtask(s) = &mut part.payload {
                    s.status = to;
                    if let Some(r) = result {
                        s.result = Some(r.to_string());
                    }
                    if let Some(e) = error {
                        s.error = Some(e.to_string());
                    }
                }
                if let Err(e) = self.deps.store.update_part(&part) {
                    warn!(part_id = %part.id, error = %e, "subtask part update failed");
                }
            }
        }
    }
}

/// Subscribe to the child session's part events and republish them to the
/// parent as progress.  The subscription dies with the returned guard.
fn forward_progress(
    bus: &EventBus,
    store: Arc<Store>,
    child_session_id: &str,
    parent_session_id: &str,
    sub_session_id: &str,
) -> orchid_bus::Subscription {
    let child = child_session_id.to_string();
    let parent = parent_session_id.to_string();
    let sub_id = sub_session_id.to_string();
    let bus_out = bus.clone();
    bus.subscribe_filtered(
        move |env| env.session_id.as_deref() == Some(child.as_str()),
        move |env| {
            let (part_id, kind) = match &env.event {
                Event::PartCreated { part_id, kind, .. }
                | Event::PartUpdated { part_id, kind, .. } => (part_id.clone(), kind.clone()),
                _ => return,
            };
            let content = store
                .get_part(&part_id)
                .map(|p| p.payload.display_text())
                .unwrap_or_default();
            bus_out.publish(
                SOURCE,
                Event::SubSessionProgress {
                    session_id: parent.clone(),
                    sub_session_id: sub_id.clone(),
                    part_kind: kind,
                    content,
                },
            );
        },
    )
}
