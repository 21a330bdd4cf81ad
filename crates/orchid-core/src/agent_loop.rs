// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use similar::TextDiff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use orchid_bus::{ChunkKind, Event, UsageSummary};
use orchid_config::ExecutionMode;
use orchid_model::{
    with_backoff, CompletionRequest, EventStream, FinishReason, RetryPolicy, StreamEvent, Usage,
};
use orchid_store::{
    Agent, Message, MessagePart, PartPayload, Role, TokenUsage, ToolPart, ToolStatus,
};
use orchid_tools::{
    ChangeKind, FileChange, GateDecision, PermissionGate, RuleSet, TodoItem, Tool, ToolCall,
    ToolContext, ToolExecution,
};

use crate::prompt::build_wire_messages;
use crate::runtime::CoreDeps;
use crate::AskUserArc;

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// An iteration completed without tool calls.
    Completed,
    /// The iteration budget was exhausted.
    MaxIterations,
    /// The user cancelled; partial text was preserved.
    Cancelled,
    /// The agent's wall-clock timeout elapsed.
    TimedOut,
}

/// Result of one user turn.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub final_text: String,
    pub iterations: u32,
    pub termination: Termination,
    /// Snapshot of the session todo list after the run.
    pub todos: Vec<TodoItem>,
}

/// The reason→tool→observe cycle.
///
/// One `run` call drives a session until the agent answers without tool
/// calls, exhausts its iteration budget, times out, or is cancelled.
pub struct AgentLoop {
    deps: Arc<CoreDeps>,
}

const SOURCE: &str = "agent-loop";

impl AgentLoop {
    pub fn new(deps: Arc<CoreDeps>) -> Self {
        Self { deps }
    }

    /// Run with the agent's default effective permissions: the base config
    /// rules combined with the agent's own rule list.
    pub async fn run(
        &self,
        session_id: &str,
        agent: &Agent,
        user_input: &str,
        asker: AskUserArc,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        let rules = Arc::new(
            RuleSet::from_rules(self.deps.config.permissions.clone())
                .intersect(&RuleSet::from_rules(agent.permissions.clone())),
        );
        self.run_with_rules(session_id, agent, user_input, rules, asker, cancel)
            .await
    }

    /// Run with an explicit effective rule set (subagents pass the
    /// parent-intersected set).
    pub async fn run_with_rules(
        &self,
        session_id: &str,
        agent: &Agent,
        user_input: &str,
        rules: Arc<RuleSet>,
        asker: AskUserArc,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        let input = user_input.trim();
        if input.is_empty() {
            anyhow::bail!("empty user input");
        }

        // Serialize all writes for this session; subagent sessions have
        // their own locks and proceed in parallel.
        let _guard = self.deps.locks.acquire(session_id).await;

        // Persist the user turn before anything can fail downstream.
        let mut user_msg = Message::new(session_id, Role::User);
        user_msg.agent_id = Some(agent.id.clone());
        self.deps.store.create_message(&user_msg)?;
        let mut user_part = MessagePart::new(
            &user_msg.id,
            session_id,
            0,
            PartPayload::Text {
                content: input.to_string(),
            },
        );
        self.deps.store.create_part(&mut user_part)?;
        self.publish(Event::MessageCreated {
            session_id: session_id.to_string(),
            message_id: user_msg.id.clone(),
            role: "user".to_string(),
        });
        self.record_history(session_id, &user_msg.id, "user", input).await;

        // Outer wall-clock limit: a watchdog cancels the run's child token
        // and flags the difference from a user cancellation.
        let run_cancel = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = agent.timeout_secs.map(|secs| {
            let token = run_cancel.clone();
            let flag = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            })
        });

        let result = match agent.execution_mode {
            ExecutionMode::SingleShot => {
                self.single_shot(session_id, agent, &user_msg.id, input).await
            }
            ExecutionMode::Streaming => {
                self.drive(
                    session_id, agent, &rules, &asker, &run_cancel, &user_msg.id, input, 1, false,
                )
                .await
            }
            ExecutionMode::Agentic | ExecutionMode::Planning => {
                self.drive(
                    session_id,
                    agent,
                    &rules,
                    &asker,
                    &run_cancel,
                    &user_msg.id,
                    input,
                    agent.max_iterations.max(1),
                    true,
                )
                .await
            }
        };

        if let Some(handle) = watchdog {
            handle.abort();
        }

        // A watchdog-triggered cancellation surfaces as a timeout.
        result.map(|mut outcome| {
            if outcome.termination == Termination::Cancelled && timed_out.load(Ordering::SeqCst) {
                outcome.termination = Termination::TimedOut;
            }
            outcome
        })
    }

    // ─── Execution modes ──────────────────────────────────────────────────────

    /// One non-streamed completion with no tools.
    async fn single_shot(
        &self,
        session_id: &str,
        agent: &Agent,
        user_msg_id: &str,
        input: &str,
    ) -> anyhow::Result<RunOutcome> {
        let provider = self
            .deps
            .providers
            .get(&agent.provider_id)
            .ok_or_else(|| anyhow::anyhow!("unknown provider: {}", agent.provider_id))?;
        let _permit = self.deps.providers.acquire(&agent.provider_id).await;

        let selection = self.deps.context.build(session_id, input).await;
        let messages = build_wire_messages(agent, &selection, user_msg_id, input);
        let response = provider
            .chat(CompletionRequest {
                messages,
                tools: vec![],
                stream: false,
            })
            .await?;

        let mut assistant = self.new_assistant_message(session_id, agent);
        assistant.usage = Some(usage_to_store(&response.usage));
        assistant.finish_reason = Some(FinishReason::Stop.as_str().to_string());
        self.deps.store.create_message(&assistant)?;
        let mut part = MessagePart::new(
            &assistant.id,
            session_id,
            0,
            PartPayload::Text {
                content: response.text.clone(),
            },
        );
        self.deps.store.create_part(&mut part)?;
        self.publish(Event::MessageCreated {
            session_id: session_id.to_string(),
            message_id: assistant.id.clone(),
            role: "assistant".to_string(),
        });
        self.record_history(session_id, &assistant.id, "assistant", &response.text)
            .await;

        Ok(RunOutcome {
            final_text: response.text,
            iterations: 1,
            termination: Termination::Completed,
            todos: vec![],
        })
    }

    // ─── The iterative loop ───────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        session_id: &str,
        agent: &Agent,
        rules: &Arc<RuleSet>,
        asker: &AskUserArc,
        cancel: &CancellationToken,
        user_msg_id: &str,
        input: &str,
        max_iterations: u32,
        with_tools: bool,
    ) -> anyhow::Result<RunOutcome> {
        let gate = PermissionGate::new(
            Arc::clone(rules),
            Arc::clone(asker),
            self.deps.bus.clone(),
            session_id,
            self.deps.grant_sink.clone(),
        );
        let agent_arc = Arc::new(agent.clone());
        let base_ctx = ToolContext::new(session_id, "", self.working_dir(session_id))
            .with_agent(Arc::clone(&agent_arc))
            .with_rules(Arc::clone(rules))
            .with_asker(Arc::clone(asker))
            .with_cancel(cancel.clone())
            .with_spill_dir(self.spill_dir());

        let mut partial_text = String::new();
        let mut iterations = 0u32;

        for iteration in 1..=max_iterations {
            iterations = iteration;
            if cancel.is_cancelled() {
                self.mark_in_flight_cancelled(session_id);
                return Ok(RunOutcome {
                    final_text: partial_text,
                    iterations,
                    termination: Termination::Cancelled,
                    todos: base_ctx.todos.snapshot(),
                });
            }
            self.publish(Event::AgentIterationStarted {
                session_id: session_id.to_string(),
                iteration,
            });

            // 1. Context build.
            let selection = self.deps.context.build(session_id, input).await;
            let messages = build_wire_messages(agent, &selection, user_msg_id, input);
            let tools = if with_tools {
                self.deps
                    .tools
                    .effective_schemas(&agent.tools)
                    .into_iter()
                    .map(|s| orchid_model::ToolSchema {
                        name: s.name,
                        description: s.description,
                        parameters: s.parameters,
                    })
                    .collect()
            } else {
                vec![]
            };

            // 2. Assistant message skeleton.
            let assistant = self.new_assistant_message(session_id, agent);
            self.deps.store.create_message(&assistant)?;
            self.publish(Event::MessageCreated {
                session_id: session_id.to_string(),
                message_id: assistant.id.clone(),
                role: "assistant".to_string(),
            });
            self.publish(Event::StreamStarted {
                session_id: session_id.to_string(),
                message_id: assistant.id.clone(),
            });

            // 3. Open the provider stream, retrying transient failures with
            // a retry part per attempt.
            let provider = self
                .deps
                .providers
                .get(&agent.provider_id)
                .ok_or_else(|| anyhow::anyhow!("unknown provider: {}", agent.provider_id))?;
            let _permit = self.deps.providers.acquire(&agent.provider_id).await;
            let req = CompletionRequest {
                messages,
                tools,
                stream: true,
            };
            let stream = {
                let deps = Arc::clone(&self.deps);
                let assistant_id = assistant.id.clone();
                let sid = session_id.to_string();
                with_backoff(
                    RetryPolicy::default(),
                    || provider.stream_chat(req.clone(), cancel.child_token()),
                    move |attempt, err| {
                        record_retry_part(&deps, &sid, &assistant_id, attempt, err);
                    },
                )
                .await
            };
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    self.publish(Event::SystemError {
                        component: SOURCE.to_string(),
                        code: "provider".to_string(),
                        message: "model completion failed".to_string(),
                    });
                    let _ = self.deps.store.update_message_usage(
                        &assistant.id,
                        None,
                        Some(FinishReason::Error.as_str()),
                    );
                    return Err(e.context("model completion failed"));
                }
            };

            // 4. Consume the stream.
            let turn = self
                .consume_stream(session_id, &assistant.id, stream, cancel)
                .await?;

            if let Some((reason, usage)) = &turn.finish {
                self.deps.store.update_message_usage(
                    &assistant.id,
                    Some(&usage_to_store(usage)),
                    Some(reason.as_str()),
                )?;
            }
            self.publish(Event::StreamCompleted {
                session_id: session_id.to_string(),
                message_id: assistant.id.clone(),
                finish_reason: turn
                    .finish
                    .as_ref()
                    .map(|(r, _)| r.as_str().to_string())
                    .unwrap_or_else(|| FinishReason::Error.as_str().to_string()),
                usage: turn.finish.as_ref().map(|(_, u)| usage_summary(u)),
            });

            if !turn.text.is_empty() {
                if !partial_text.is_empty() {
                    partial_text.push('\n');
                }
                partial_text.push_str(&turn.text);
                self.record_history(session_id, &assistant.id, "assistant", &turn.text)
                    .await;
            }

            if turn.cancelled {
                self.mark_in_flight_cancelled(session_id);
                return Ok(RunOutcome {
                    final_text: partial_text,
                    iterations,
                    termination: Termination::Cancelled,
                    todos: base_ctx.todos.snapshot(),
                });
            }

            // 5. No tool calls: the turn is the answer.
            if turn.tool_calls.is_empty() {
                self.publish(Event::AgentIterationCompleted {
                    session_id: session_id.to_string(),
                    iteration,
                });
                return Ok(RunOutcome {
                    final_text: partial_text,
                    iterations,
                    termination: Termination::Completed,
                    todos: base_ctx.todos.snapshot(),
                });
            }

            // 6. Execute the calls sequentially, in provider order.
            let mut ctx = base_ctx.clone();
            ctx.message_id = assistant.id.clone();
            let cancelled_mid_batch = self
                .run_tool_batch(session_id, agent, &assistant, &gate, &ctx, &turn.tool_calls)
                .await?;

            self.publish(Event::AgentIterationCompleted {
                session_id: session_id.to_string(),
                iteration,
            });

            if cancelled_mid_batch {
                return Ok(RunOutcome {
                    final_text: partial_text,
                    iterations,
                    termination: Termination::Cancelled,
                    todos: base_ctx.todos.snapshot(),
                });
            }
        }

        // Budget exhausted.
        self.publish(Event::AgentMaxIterations {
            session_id: session_id.to_string(),
            iterations,
        });
        if !partial_text.is_empty() {
            partial_text.push('\n');
        }
        partial_text.push_str("[stopped: maximum iterations reached before the task completed]");
        Ok(RunOutcome {
            final_text: partial_text,
            iterations,
            termination: Termination::MaxIterations,
            todos: base_ctx.todos.snapshot(),
        })
    }

    /// Steps 6a–6f for one batch of tool calls.  Returns true when the
    /// batch was cut short by cancellation.
    async fn run_tool_batch(
        &self,
        session_id: &str,
        agent: &Agent,
        assistant: &Message,
        gate: &PermissionGate,
        ctx: &ToolContext,
        calls: &[ToolCall],
    ) -> anyhow::Result<bool> {
        // Tool parts are created up front, in provider order.
        let mut parts = Vec::with_capacity(calls.len());
        let mut order = self.deps.store.next_order_index(&assistant.id)?;
        for call in calls {
            let title = self
                .deps
                .tools
                .get(&call.name)
                .map(|t| t.title(&call.args))
                .unwrap_or_else(|| call.name.clone());
            let mut part = MessagePart::new(
                &assistant.id,
                session_id,
                order,
                PartPayload::Tool(ToolPart::pending(
                    &call.id,
                    &call.name,
                    title,
                    call.args.to_string(),
                )),
            );
            self.deps.store.create_part(&mut part)?;
            self.publish(Event::PartCreated {
                session_id: session_id.to_string(),
                message_id: assistant.id.clone(),
                part_id: part.id.clone(),
                kind: "tool".to_string(),
            });
            parts.push(part);
            order += 1;
        }

        let mut tool_messages: Vec<Message> = Vec::new();
        let mut tool_message_parts: Vec<MessagePart> = Vec::new();
        let mut cancelled = false;

        for (part, call) in parts.iter_mut().zip(calls) {
            if cancelled {
                // Remaining calls are never started, but each still gets a
                // terminal part state and an answering tool message so a
                // resumed session carries no unanswered calls.
                self.finish_tool_part(session_id, part, None, "cancelled", "tool cancelled")?;
                let mut tool_msg = Message::new(session_id, Role::Tool);
                tool_msg.parent_message_id = Some(assistant.id.clone());
                tool_msg.agent_id = Some(agent.id.clone());
                tool_message_parts.push(MessagePart::new(
                    &tool_msg.id,
                    session_id,
                    0,
                    PartPayload::Text {
                        content: "tool execution cancelled".to_string(),
                    },
                ));
                tool_messages.push(tool_msg);
                continue;
            }

            // a. Pending → Running.
            if let PartPayload::Tool(t) = &mut part.payload {
                t.status = ToolStatus::Running;
                t.started_at = Some(Utc::now());
            }
            self.deps.store.update_part(part)?;
            self.publish(Event::ToolExecutionStarted {
                session_id: session_id.to_string(),
                message_id: assistant.id.clone(),
                part_id: part.id.clone(),
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
            });

            // b–d. Lookup, gate, execute.
            let execution = if !self.deps.tools.is_effective(&call.name, &agent.tools) {
                ToolExecution {
                    output: orchid_tools::ToolOutput::err(
                        &call.id,
                        format!("unknown tool: {}", call.name),
                    ),
                    pruned: false,
                    spill_path: None,
                    error_code: Some("unknown_tool".to_string()),
                }
            } else {
                match gate.check(call).await {
                    decision @ GateDecision::Deny { .. } => ToolExecution {
                        output: orchid_tools::ToolOutput::err(
                            &call.id,
                            decision.denial_message(),
                        ),
                        pruned: false,
                        spill_path: None,
                        error_code: Some("permission_denied".to_string()),
                    },
                    GateDecision::Allow => {
                        self.deps
                            .tools
                            .execute(call, ctx, agent.tools.overrides.get(&call.name))
                            .await
                    }
                }
            };
            cancelled = execution.error_code.as_deref() == Some("cancelled");

            // e. Terminal transition.
            if let PartPayload::Tool(t) = &mut part.payload {
                t.status = if execution.output.is_error {
                    ToolStatus::Error
                } else {
                    ToolStatus::Completed
                };
                t.completed_at = Some(Utc::now());
                t.output = Some(execution.output.content.clone());
                t.is_pruned = execution.pruned;
                t.spill_path = execution
                    .spill_path
                    .as_ref()
                    .map(|p| p.display().to_string());
                t.attachments = execution.output.attachments.clone();
                if execution.output.is_error {
                    t.error_message = Some(execution.output.content.clone());
                    t.error_code = execution.error_code.clone();
                }
            }
            self.deps.store.update_part(part)?;
            self.publish(Event::ToolExecutionCompleted {
                session_id: session_id.to_string(),
                message_id: assistant.id.clone(),
                part_id: part.id.clone(),
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                is_error: execution.output.is_error,
            });
            self.publish(Event::PartUpdated {
                session_id: session_id.to_string(),
                message_id: assistant.id.clone(),
                part_id: part.id.clone(),
                kind: "tool".to_string(),
            });

            // f. The answering tool-role message: output text plus any
            // patch/file parts synthesized from the tracker.
            let mut tool_msg = Message::new(session_id, Role::Tool);
            tool_msg.parent_message_id = Some(assistant.id.clone());
            tool_msg.agent_id = Some(agent.id.clone());
            let mut msg_order = 0u32;
            tool_message_parts.push(MessagePart::new(
                &tool_msg.id,
                session_id,
                msg_order,
                PartPayload::Text {
                    content: execution.output.content.clone(),
                },
            ));
            msg_order += 1;
            for change in ctx.file_changes.drain() {
                tool_message_parts.push(MessagePart::new(
                    &tool_msg.id,
                    session_id,
                    msg_order,
                    change_to_payload(change),
                ));
                msg_order += 1;
            }
            tool_messages.push(tool_msg);
        }

        // Atomic append: either the whole exchange lands or none of it.
        self.deps
            .store
            .append_tool_exchange(&tool_messages, &tool_message_parts)?;
        for msg in &tool_messages {
            self.publish(Event::MessageCreated {
                session_id: session_id.to_string(),
                message_id: msg.id.clone(),
                role: "tool".to_string(),
            });
        }
        for (msg, part) in tool_messages.iter().zip(
            tool_message_parts
                .iter()
                .filter(|p| p.order_index == 0),
        ) {
            if let PartPayload::Text { content } = &part.payload {
                self.record_history(session_id, &msg.id, "tool", content).await;
            }
        }

        Ok(cancelled)
    }

    // ─── Stream consumption ───────────────────────────────────────────────────

    async fn consume_stream(
        &self,
        session_id: &str,
        assistant_id: &str,
        mut stream: EventStream,
        cancel: &CancellationToken,
    ) -> anyhow::Result<TurnResult> {
        let mut text_cursor: Option<PartCursor> = None;
        let mut reasoning_cursor: Option<PartCursor> = None;
        let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
        let mut result = TurnResult::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    result.cancelled = true;
                    break;
                }
                ev = stream.next() => ev,
            };
            let Some(event) = next else { break };
            let event = match event {
                Ok(e) => e,
                Err(e) => {
                    self.close_cursor(session_id, assistant_id, &mut text_cursor, true)?;
                    self.close_cursor(session_id, assistant_id, &mut reasoning_cursor, false)?;
                    return Err(e.context("provider stream failed"));
                }
            };
            match event {
                StreamEvent::TextDelta(delta) if !delta.is_empty() => {
                    self.close_cursor(session_id, assistant_id, &mut reasoning_cursor, false)?;
                    self.append_delta(
                        session_id,
                        assistant_id,
                        &mut text_cursor,
                        ChunkKind::Text,
                        &delta,
                    )?;
                    result.text.push_str(&delta);
                }
                StreamEvent::TextDelta(_) => {}
                StreamEvent::ReasoningDelta(delta) => {
                    self.close_cursor(session_id, assistant_id, &mut text_cursor, true)?;
                    self.append_delta(
                        session_id,
                        assistant_id,
                        &mut reasoning_cursor,
                        ChunkKind::Reasoning,
                        &delta,
                    )?;
                }
                StreamEvent::ToolCallPart {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    // A tool call closes the open text/reasoning cursors.
                    self.close_cursor(session_id, assistant_id, &mut text_cursor, true)?;
                    self.close_cursor(session_id, assistant_id, &mut reasoning_cursor, false)?;
                    let entry = pending.entry(index).or_insert_with(PendingToolCall::empty);
                    if !id.is_empty() {
                        entry.id = id;
                    }
                    if !name.is_empty() {
                        entry.name = name;
                    }
                    entry.args_buf.push_str(&arguments);
                }
                StreamEvent::Finish { reason, usage } => {
                    result.finish = Some((reason, usage));
                    break;
                }
            }
        }

        self.close_cursor(session_id, assistant_id, &mut text_cursor, true)?;
        self.close_cursor(session_id, assistant_id, &mut reasoning_cursor, false)?;

        // Flush accumulated tool calls in index order.  Calls with an empty
        // name cannot be dispatched and are dropped; an empty id gets a
        // synthetic fallback so the exchange can still be answered.
        for (i, (_, ptc)) in pending.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping tool call with empty name from model");
                continue;
            }
            let mut call = ptc.finish();
            if call.id.is_empty() {
                call.id = format!("tc_synthetic_{i}");
                warn!(tool_name = %call.name, tool_call_id = %call.id,
                      "tool call from model had empty id; generated synthetic id");
            }
            result.tool_calls.push(call);
        }
        Ok(result)
    }

    /// Create the part on the first delta; later deltas only stream events.
    fn append_delta(
        &self,
        session_id: &str,
        assistant_id: &str,
        cursor: &mut Option<PartCursor>,
        kind: ChunkKind,
        delta: &str,
    ) -> anyhow::Result<()> {
        match cursor {
            Some(c) => c.buffer.push_str(delta),
            None => {
                let order = self.deps.store.next_order_index(assistant_id)?;
                let payload = match kind {
                    ChunkKind::Text => PartPayload::Text {
                        content: delta.to_string(),
                    },
                    ChunkKind::Reasoning => PartPayload::Reasoning {
                        content: delta.to_string(),
                    },
                };
                let mut part = MessagePart::new(assistant_id, session_id, order, payload);
                self.deps.store.create_part(&mut part)?;
                self.publish(Event::PartCreated {
                    session_id: session_id.to_string(),
                    message_id: assistant_id.to_string(),
                    part_id: part.id.clone(),
                    kind: match kind {
                        ChunkKind::Text => "text".to_string(),
                        ChunkKind::Reasoning => "reasoning".to_string(),
                    },
                });
                *cursor = Some(PartCursor {
                    part_id: part.id,
                    buffer: delta.to_string(),
                });
            }
        }
        self.publish(Event::StreamChunk {
            session_id: session_id.to_string(),
            message_id: assistant_id.to_string(),
            kind,
            delta: delta.to_string(),
        });
        Ok(())
    }

    /// Write the cursor's full buffer back to its part and reset it.
    fn close_cursor(
        &self,
        session_id: &str,
        assistant_id: &str,
        cursor: &mut Option<PartCursor>,
        is_text: bool,
    ) -> anyhow::Result<()> {
        let Some(c) = cursor.take() else {
            return Ok(());
        };
        let mut part = self.deps.store.get_part(&c.part_id)?;
        part.payload = if is_text {
            PartPayload::Text { content: c.buffer }
        } else {
            PartPayload::Reasoning { content: c.buffer }
        };
        self.deps.store.update_part(&part)?;
        self.publish(Event::PartUpdated {
            session_id: session_id.to_string(),
            message_id: assistant_id.to_string(),
            part_id: part.id.clone(),
            kind: part.kind().as_str().to_string(),
        });
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────────────

    fn new_assistant_message(&self, session_id: &str, agent: &Agent) -> Message {
        let mut msg = Message::new(session_id, Role::Assistant);
        msg.agent_id = Some(agent.id.clone());
        msg.model_id = Some(agent.model_id.clone());
        msg.provider_id = Some(agent.provider_id.clone());
        msg
    }

    fn finish_tool_part(
        &self,
        session_id: &str,
        part: &mut MessagePart,
        output: Option<String>,
        code: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        if let PartPayload::Tool(t) = &mut part.payload {
            t.status = ToolStatus::Error;
            t.completed_at = Some(Utc::now());
            t.output = output;
            t.error_code = Some(code.to_string());
            t.error_message = Some(message.to_string());
        }
        self.deps.store.update_part(part)?;
        self.publish(Event::PartUpdated {
            session_id: session_id.to_string(),
            message_id: part.message_id.clone(),
            part_id: part.id.clone(),
            kind: "tool".to_string(),
        });
        Ok(())
    }

    /// Cancellation wind-down: every tool part still Pending or Running in
    /// this session reaches a terminal state.
    fn mark_in_flight_cancelled(&self, session_id: &str) {
        for status in [ToolStatus::Pending, ToolStatus::Running] {
            let parts = match self.deps.store.tool_parts_by_status(session_id, status) {
                Ok(p) => p,
                Err(e) => {
                    warn!(session_id, error = %e, "cancel wind-down query failed");
                    continue;
                }
            };
            for mut part in parts {
                if let Err(e) =
                    self.finish_tool_part(session_id, &mut part, None, "cancelled", "tool cancelled")
                {
                    warn!(part_id = %part.id, error = %e, "cancel wind-down write failed");
                }
            }
        }
    }

    async fn record_history(&self, session_id: &str, message_id: &str, role: &str, content: &str) {
        if let Err(e) = self
            .deps
            .context
            .history()
            .record(session_id, message_id, role, content, Utc::now())
            .await
        {
            // Degraded search only; never fatal.
            debug!(session_id, error = %e, "vector history write failed");
        }
    }

    fn working_dir(&self, session_id: &str) -> std::path::PathBuf {
        self.deps
            .store
            .get_session(session_id)
            .and_then(|s| self.deps.store.get_project(s.project_id))
            .map(|p| p.root_path)
            .unwrap_or_else(|_| std::env::temp_dir())
    }

    fn spill_dir(&self) -> std::path::PathBuf {
        self.deps
            .config
            .tools
            .spill_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    fn publish(&self, event: Event) {
        self.deps.bus.publish(SOURCE, event);
    }
}

/// Insert a retry part recording one backoff attempt.  Best-effort: a
/// failed write must not break the retry itself.
fn record_retry_part(
    deps: &Arc<CoreDeps>,
    session_id: &str,
    assistant_id: &str,
    attempt: u32,
    err: &anyhow::Error,
) {
    let order = match deps.store.next_order_index(assistant_id) {
        Ok(o) => o,
        Err(_) => return,
    };
    let mut part = MessagePart::new(
        assistant_id,
        session_id,
        order,
        PartPayload::Retry {
            attempt,
            reason: "transient provider error".to_string(),
            prior_error: err.to_string(),
        },
    );
    if deps.store.create_part(&mut part).is_ok() {
        deps.bus.publish(
            SOURCE,
            Event::PartCreated {
                session_id: session_id.to_string(),
                message_id: assistant_id.to_string(),
                part_id: part.id,
                kind: "retry".to_string(),
            },
        );
    }
}

/// Map a tracker entry onto a patch or file part.
fn change_to_payload(change: FileChange) -> PartPayload {
    match (&change.kind, &change.old_content, &change.new_content) {
        (ChangeKind::Modified, Some(old), Some(new)) => {
            let diff = TextDiff::from_lines(old.as_str(), new.as_str());
            let unified = diff
                .unified_diff()
                .header(
                    &change.path.display().to_string(),
                    &change.path.display().to_string(),
                )
                .to_string();
            let additions = diff
                .iter_all_changes()
                .filter(|c| c.tag() == similar::ChangeTag::Insert)
                .count() as u32;
            let deletions = diff
                .iter_all_changes()
                .filter(|c| c.tag() == similar::ChangeTag::Delete)
                .count() as u32;
            PartPayload::Patch {
                file_path: change.path.display().to_string(),
                old_content: old.clone(),
                new_content: new.clone(),
                unified_diff: unified,
                additions,
                deletions,
            }
        }
        _ => PartPayload::File {
            path: change.path.display().to_string(),
            content: change.new_content,
            mime_type: None,
            size_bytes: None,
        },
    }
}

fn usage_to_store(usage: &Usage) -> TokenUsage {
    TokenUsage {
        input: usage.input_tokens,
        output: usage.output_tokens,
        reasoning: usage.reasoning_tokens,
        cache_read: usage.cache_read_tokens,
        cache_write: usage.cache_write_tokens,
    }
}

fn usage_summary(usage: &Usage) -> UsageSummary {
    UsageSummary {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        reasoning_tokens: usage.reasoning_tokens,
        cache_read_tokens: usage.cache_read_tokens,
        cache_write_tokens: usage.cache_write_tokens,
    }
}

#[derive(Default)]
struct TurnResult {
    text: String,
    tool_calls: Vec<ToolCall>,
    cancelled: bool,
    finish: Option<(FinishReason, Usage)>,
}

struct PartCursor {
    part_id: String,
    buffer: String,
}

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn empty() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            args_buf: String::new(),
        }
    }

    fn finish(self) -> ToolCall {
        // Always resolve to a JSON object: providers reject null tool input
        // on the next request, which would fail the whole turn later.
        let args = if self.args_buf.is_empty() {
            warn!(tool_name = %self.name, "model sent tool call with empty arguments; substituting {{}}");
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(parse_err) => match attempt_json_repair(&self.args_buf) {
                    Ok(v) => {
                        warn!(tool_name = %self.name, "repaired invalid JSON arguments from model");
                        v
                    }
                    Err(_) => {
                        warn!(
                            tool_name = %self.name,
                            error = %parse_err,
                            "model sent tool call with invalid JSON arguments; substituting {{}}"
                        );
                        serde_json::Value::Object(Default::default())
                    }
                },
            }
        };
        ToolCall {
            id: self.id,
            name: self.name,
            args,
        }
    }
}

/// Attempt to repair common JSON syntax errors from models: invalid escape
/// sequences inside strings, missing closing quote, missing closing brace.
fn attempt_json_repair(json_str: &str) -> anyhow::Result<serde_json::Value> {
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&fixed) {
        return Ok(v);
    }

    if !fixed.trim().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&completed) {
            return Ok(v);
        }
    }

    anyhow::bail!("JSON repair failed: all repair strategies exhausted")
}

/// Walk through a JSON string and replace any invalid escape sequences
/// inside string values with a properly escaped backslash.
///
/// Valid JSON escape characters are: `"`, `\`, `/`, `b`, `f`, `n`, `r`,
/// `t`, `u`.  Anything else (e.g. `\c`, `\(`) is turned into `\\X` so the
/// result round-trips through serde_json without a parse error.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod json_repair_tests {
    use super::*;

    #[test]
    fn valid_json_passes_through_finish() {
        let ptc = PendingToolCall {
            id: "c1".into(),
            name: "read_file".into(),
            args_buf: r#"{"path":"a.rs"}"#.into(),
        };
        let call = ptc.finish();
        assert_eq!(call.args["path"], "a.rs");
    }

    #[test]
    fn invalid_escape_is_repaired() {
        let repaired = attempt_json_repair(r#"{"cmd":"grep \c foo"}"#).unwrap();
        assert_eq!(repaired["cmd"], "grep \\c foo");
    }

    #[test]
    fn truncated_object_is_completed() {
        let repaired = attempt_json_repair(r#"{"path":"src/main.rs"#).unwrap();
        assert_eq!(repaired["path"], "src/main.rs");
    }

    #[test]
    fn hopeless_garbage_becomes_empty_object() {
        let ptc = PendingToolCall {
            id: "c1".into(),
            name: "bash".into(),
            args_buf: "not json at [[[".into(),
        };
        let call = ptc.finish();
        assert!(call.args.as_object().unwrap().is_empty());
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        let ptc = PendingToolCall {
            id: "c1".into(),
            name: "glob".into(),
            args_buf: String::new(),
        };
        assert!(ptc.finish().args.as_object().unwrap().is_empty());
    }

    #[test]
    fn escapes_outside_strings_are_untouched() {
        assert_eq!(fix_invalid_json_escapes(r#"{"a":1}"#), r#"{"a":1}"#);
    }
}
