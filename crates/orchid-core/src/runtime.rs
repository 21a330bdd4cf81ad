// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orchid_bus::{Envelope, Event, EventBus, Subscription};
use orchid_config::Config;
use orchid_context::{
    Compactor, ContextManager, ContextParams, Embedder, HashEmbedder, HttpEmbedder,
    MemoryVectorStore, QdrantStore, VectorHistory, VectorStore,
};
use orchid_model::{MockProvider, ModelProvider, ProviderRegistry};
use orchid_store::{
    EventRecord, Message, MessagePart, PartPayload, Store, SubSession, ToolStatus,
};
use orchid_tools::{
    BashTool, EditFileTool, GlobTool, GrantSink, GrepTool, ListDirTool, ReadFileTool,
    ToolRegistry, WebFetchTool, WriteFileTool,
};

use crate::agent_loop::{AgentLoop, RunOutcome};
use crate::locks::SessionLocks;
use crate::supervisor::SubagentSupervisor;
use crate::task_tool::TaskTool;
use crate::AskUserArc;

/// Everything the loop, the supervisor, and the task tool share.
pub struct CoreDeps {
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub tools: Arc<ToolRegistry>,
    pub providers: Arc<ProviderRegistry>,
    pub context: Arc<ContextManager>,
    pub locks: Arc<SessionLocks>,
    pub config: Arc<Config>,
    pub grant_sink: Option<Arc<dyn GrantSink>>,
}

/// Persists "always" permission grants in the app_state table.
struct StoreGrantSink {
    store: Arc<Store>,
}

const GRANT_KEY: &str = "permission_grants";

impl GrantSink for StoreGrantSink {
    fn load(&self) -> Vec<String> {
        self.store
            .state_get(GRANT_KEY)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
            .unwrap_or_default()
    }

    fn save(&self, key: &str) {
        let mut grants = self.load();
        if grants.iter().any(|g| g == key) {
            return;
        }
        grants.push(key.to_string());
        if let Ok(raw) = serde_json::to_string(&grants) {
            if let Err(e) = self.store.state_set(GRANT_KEY, &raw) {
                warn!(error = %e, "persisting permission grant failed");
            }
        }
    }
}

/// Event kinds copied into the audited event log.
fn is_audited(event: &Event) -> bool {
    matches!(
        event,
        Event::ToolExecutionStarted { .. }
            | Event::ToolExecutionCompleted { .. }
            | Event::PermissionRequested { .. }
            | Event::PermissionGranted { .. }
            | Event::PermissionDenied { .. }
            | Event::SubSessionCreated { .. }
            | Event::SubSessionStatusChanged { .. }
            | Event::SubSessionCompleted { .. }
            | Event::SubSessionFailed { .. }
            | Event::SubSessionCancelled { .. }
            | Event::MessageCompacted { .. }
            | Event::SystemError { .. }
    )
}

/// The assembled core: storage, bus, tools, providers, context, and the
/// supervisor, behind the session/chat/state APIs the frontends consume.
pub struct Runtime {
    deps: Arc<CoreDeps>,
    _audit: Subscription,
}

impl Runtime {
    /// Production construction from config: opens the database, connects
    /// the configured vector store and embedder, and registers providers
    /// and built-in tools.
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let store_path = config
            .store_path
            .clone()
            .unwrap_or_else(Store::default_path);
        let store = Arc::new(Store::open(&store_path)?);

        let mut providers = ProviderRegistry::new();
        for (id, pcfg) in &config.providers {
            match pcfg.kind.as_str() {
                "mock" => providers.register(
                    id.clone(),
                    Arc::new(MockProvider) as Arc<dyn ModelProvider>,
                    pcfg.max_concurrent,
                ),
                other => {
                    // Concrete HTTP drivers are external collaborators;
                    // they register here when linked in by the frontend.
                    warn!(provider = %id, kind = %other, "no bundled driver for provider kind");
                }
            }
        }

        let vector: Arc<dyn VectorStore> = match &config.vector.url {
            Some(url) => Arc::new(QdrantStore::new(url.clone())),
            None => Arc::new(MemoryVectorStore::new()),
        };
        let embedder: Arc<dyn Embedder> = match &config.vector.embedding_url {
            Some(url) => {
                let api_key = config
                    .vector
                    .embedding_api_key_env
                    .as_ref()
                    .and_then(|env| std::env::var(env).ok());
                Arc::new(HttpEmbedder::new(
                    url.clone(),
                    api_key,
                    "text-embedding-3-small",
                    config.vector.dimension,
                ))
            }
            None => Arc::new(HashEmbedder::new(config.vector.dimension)),
        };

        Self::assemble(config, store, Arc::new(providers), vector, embedder)
    }

    /// Assembly from prepared pieces; tests inject in-memory stores and
    /// scripted providers through this.
    pub fn assemble(
        config: Arc<Config>,
        store: Arc<Store>,
        providers: Arc<ProviderRegistry>,
        vector: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> anyhow::Result<Self> {
        let bus = EventBus::new();
        let tools = Arc::new(ToolRegistry::new(config.tools.clone()));
        tools.register_tool(ReadFileTool);
        tools.register_tool(WriteFileTool);
        tools.register_tool(EditFileTool);
        tools.register_tool(ListDirTool);
        tools.register_tool(GlobTool);
        tools.register_tool(GrepTool);
        tools.register_tool(BashTool);
        if config.tools.enable_web {
            tools.register_tool(WebFetchTool);
        }

        let history = Arc::new(VectorHistory::new(vector, embedder));

        // The hidden compaction agent: its provider when configured, any
        // registered provider otherwise.  Without a provider, compaction
        // is disabled and retrieval degrades to trimming.
        let compaction_provider = store
            .agent_by_slug("compactor")
            .ok()
            .and_then(|a| providers.get(&a.provider_id))
            .or_else(|| providers.ids().first().and_then(|id| providers.get(id)));
        let compactor = compaction_provider.map(|provider| {
            Arc::new(Compactor::new(provider, Arc::clone(&store), bus.clone()))
        });

        let context = Arc::new(ContextManager::new(
            history,
            Arc::clone(&store),
            compactor,
            ContextParams::from(&config.context),
        ));

        let grant_sink: Arc<dyn GrantSink> = Arc::new(StoreGrantSink {
            store: Arc::clone(&store),
        });

        let deps = Arc::new(CoreDeps {
            store: Arc::clone(&store),
            bus: bus.clone(),
            tools: Arc::clone(&tools),
            providers,
            context,
            locks: Arc::new(SessionLocks::new()),
            config,
            grant_sink: Some(grant_sink),
        });

        let supervisor = Arc::new(SubagentSupervisor::new(Arc::clone(&deps)));
        tools.register_tool(TaskTool::new(supervisor));

        // Audited events flow into the event log; failures degrade to
        // tracing only.
        let audit_store = Arc::clone(&store);
        let audit = bus.subscribe_filtered(
            |env| is_audited(&env.event),
            move |env| {
                let record = EventRecord {
                    id: env.id.clone(),
                    event_type: env.event.kind().to_string(),
                    session_id: env.session_id.clone(),
                    payload: serde_json::to_value(&env.event).unwrap_or_default(),
                    created_at: env.timestamp,
                };
                if let Err(e) = audit_store.log_event(&record) {
                    warn!(error = %e, "event log write failed");
                }
            },
        );

        Ok(Self {
            deps,
            _audit: audit,
        })
    }

    pub fn deps(&self) -> &Arc<CoreDeps> {
        &self.deps
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.deps.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.deps.bus
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.deps.tools
    }

    // ─── Chat API ─────────────────────────────────────────────────────────────

    /// Drive one user turn against the session's active agent.
    pub async fn run(
        &self,
        session_id: &str,
        user_input: &str,
        asker: AskUserArc,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        let session = self.deps.store.get_session(session_id)?;
        let slug = session.active_agent_id.ok_or_else(|| {
            anyhow::anyhow!("session has no active agent; select one before running")
        })?;
        let agent = self.deps.store.agent_by_slug(&slug)?;
        let agent_loop = AgentLoop::new(Arc::clone(&self.deps));
        agent_loop
            .run(session_id, &agent, user_input, asker, cancel)
            .await
    }

    /// Session-scoped live event stream (mirrors the internal taxonomy).
    pub fn subscribe_session(
        &self,
        session_id: &str,
    ) -> (Subscription, tokio::sync::mpsc::UnboundedReceiver<Envelope>) {
        self.deps.bus.subscribe_session(session_id)
    }

    // ─── State API ────────────────────────────────────────────────────────────

    pub fn sub_sessions(&self, session_id: &str) -> anyhow::Result<Vec<SubSession>> {
        Ok(self.deps.store.sub_sessions_for_session(session_id)?)
    }

    /// Crash recovery: tool parts left Pending/Running by a previous
    /// process reach a terminal state before any new loop starts.
    pub fn recover(&self) -> anyhow::Result<usize> {
        let mut recovered = 0usize;
        for project in self.deps.store.list_projects()? {
            for session in self.deps.store.list_sessions(project.id)? {
                for status in [ToolStatus::Pending, ToolStatus::Running] {
                    for mut part in self
                        .deps
                        .store
                        .tool_parts_by_status(&session.id, status)?
                    {
                        if let PartPayload::Tool(t) = &mut part.payload {
                            t.status = ToolStatus::Error;
                            t.completed_at = Some(Utc::now());
                            t.error_code = Some("interrupted".to_string());
                            t.error_message =
                                Some("interrupted by runtime restart".to_string());
                        }
                        self.deps.store.update_part(&part)?;
                        recovered += 1;
                    }
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered interrupted tool parts");
        }
        Ok(recovered)
    }

    // ─── Admin operations ─────────────────────────────────────────────────────

    /// Re-embed a session's messages into its vector collection.
    pub async fn rebuild_index(&self, session_id: &str) -> anyhow::Result<usize> {
        let history = self.deps.context.history();
        history.drop_session(session_id).await?;
        let mut count = 0usize;
        for msg in self.deps.store.list_messages(session_id)? {
            if msg.is_compacted {
                continue;
            }
            let text = self.message_text(&msg)?;
            if text.is_empty() {
                continue;
            }
            history
                .record(
                    session_id,
                    &msg.id,
                    msg.role.as_str(),
                    &text,
                    msg.created_at,
                )
                .await?;
            count += 1;
        }
        info!(session_id, count, "session index rebuilt");
        Ok(count)
    }

    /// Full JSON dump of a session: messages with their parts, plus the
    /// sub-session roster.
    pub fn dump_session(&self, session_id: &str) -> anyhow::Result<serde_json::Value> {
        let session = self.deps.store.get_session(session_id)?;
        let mut messages = Vec::new();
        for msg in self.deps.store.list_messages(session_id)? {
            let parts: Vec<MessagePart> = self.deps.store.parts_by_message(&msg.id)?;
            messages.push(serde_json::json!({
                "message": msg,
                "parts": parts,
            }));
        }
        let sub_sessions = self.deps.store.sub_sessions_for_session(session_id)?;
        Ok(serde_json::json!({
            "session": session,
            "messages": messages,
            "sub_sessions": sub_sessions,
        }))
    }

    fn message_text(&self, msg: &Message) -> anyhow::Result<String> {
        let parts = self.deps.store.parts_by_message(&msg.id)?;
        Ok(parts
            .iter()
            .filter_map(|p| match &p.payload {
                PartPayload::Text { content } => Some(content.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }
}
