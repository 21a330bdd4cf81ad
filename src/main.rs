// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use orchid_bus::Event;
use orchid_core::Runtime;
use orchid_mcp::{McpClient, McpTransport};
use orchid_store::Agent;
use orchid_tools::{AskOutcome, AskScope, AskUser, QuestionAnswer, QuestionRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ShowConfig must work even when the runtime cannot start.
    if let Some(Commands::ShowConfig) = &cli.command {
        let config = orchid_config::load(cli.config.as_deref())?;
        println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
        return Ok(());
    }

    let config = Arc::new(orchid_config::load(cli.config.as_deref())?);
    init_logging(cli.verbose, config.log_file.as_deref());

    let runtime = Runtime::new(Arc::clone(&config)).context("starting runtime")?;
    runtime.recover().context("crash recovery")?;
    connect_mcp_servers(&runtime, &config).await;

    match cli.command {
        None => run_ui(runtime, None, None).await,
        Some(Commands::Ui { project, session }) => run_ui(runtime, project, session).await,
        Some(Commands::RebuildIndex { session }) => {
            let count = runtime.rebuild_index(&session).await?;
            println!("re-embedded {count} messages for session {session}");
            Ok(())
        }
        Some(Commands::DumpSession { session }) => {
            let dump = runtime.dump_session(&session)?;
            println!("{}", serde_json::to_string_pretty(&dump)?);
            Ok(())
        }
        Some(Commands::ShowConfig) => unreachable!("handled above"),
    }
}

/// Writing to stderr corrupts an interactive frontend, so tracing goes to
/// the configured log file unless --verbose explicitly opts into stderr.
fn init_logging(verbose: bool, log_file: Option<&std::path::Path>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    if verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return;
    }
    let Some(path) = log_file else { return };
    match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(file).with_ansi(false))
                .init();
        }
        Err(e) => eprintln!("warning: cannot open log file {}: {e}", path.display()),
    }
}

async fn connect_mcp_servers(runtime: &Runtime, config: &orchid_config::Config) {
    for server in &config.mcp {
        let transport = match server.transport.as_str() {
            "stdio" => match &server.command {
                Some(command) => McpTransport::Stdio {
                    command: command.clone(),
                    args: server.args.clone(),
                },
                None => {
                    warn!(server = %server.name, "stdio MCP server without a command; skipped");
                    continue;
                }
            },
            "http" => match &server.url {
                Some(url) => McpTransport::Http { url: url.clone() },
                None => {
                    warn!(server = %server.name, "http MCP server without a url; skipped");
                    continue;
                }
            },
            other => {
                warn!(server = %server.name, transport = %other, "unknown MCP transport; skipped");
                continue;
            }
        };
        match McpClient::connect(&server.name, transport).await {
            Ok(client) => {
                if let Err(e) = orchid_mcp::register_server(runtime.tools(), Arc::new(client)).await
                {
                    warn!(server = %server.name, error = %e, "MCP tool registration failed");
                }
            }
            Err(e) => warn!(server = %server.name, error = %e, "MCP connect failed"),
        }
    }
}

// ── Line frontend ─────────────────────────────────────────────────────────────

/// Terminal ask-user collaborator: permission prompts read y/s/a/n from
/// stdin between input lines.
struct TerminalAsker;

#[async_trait]
impl AskUser for TerminalAsker {
    async fn ask(&self, request: QuestionRequest) -> anyhow::Result<Vec<QuestionAnswer>> {
        let mut answers = Vec::new();
        for question in request.questions {
            println!("? {}", question.text);
            for (i, option) in question.options.iter().enumerate() {
                println!("  {}. {option}", i + 1);
            }
            let line = read_stdin_line().await?;
            answers.push(QuestionAnswer {
                selected: vec![line.trim().to_string()],
            });
        }
        Ok(answers)
    }

    async fn ask_permission(&self, tool_name: &str, summary: &str) -> AskOutcome {
        println!("permission: {tool_name} wants to run: {summary}");
        println!("  [y]es once / [s]ession / [a]lways / [n]o");
        match read_stdin_line().await.as_deref().map(str::trim) {
            Ok("y") | Ok("Y") => AskOutcome::Granted(AskScope::Once),
            Ok("s") | Ok("S") => AskOutcome::Granted(AskScope::Session),
            Ok("a") | Ok("A") => AskOutcome::Granted(AskScope::Always),
            _ => AskOutcome::Denied,
        }
    }
}

async fn read_stdin_line() -> anyhow::Result<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok::<_, std::io::Error>(line)
    })
    .await?
    .map_err(Into::into)
}

async fn run_ui(
    runtime: Runtime,
    project: Option<PathBuf>,
    session: Option<String>,
) -> anyhow::Result<()> {
    let session_id = match session {
        Some(id) => {
            runtime.store().get_session(&id)?;
            id
        }
        None => open_session(&runtime, project)?,
    };

    // Mirror streamed text to stdout as it arrives.
    let (_sub, mut events) = runtime.subscribe_session(&session_id);
    let printer = tokio::spawn(async move {
        use std::io::Write;
        while let Some(env) = events.recv().await {
            match env.event {
                Event::StreamChunk { delta, kind, .. }
                    if kind == orchid_bus::ChunkKind::Text =>
                {
                    print!("{delta}");
                    let _ = std::io::stdout().flush();
                }
                Event::ToolExecutionStarted { tool_name, .. } => {
                    println!("\n[tool: {tool_name}]");
                }
                Event::SubSessionProgress { part_kind, .. } => {
                    println!("[subagent: {part_kind}]");
                }
                _ => {}
            }
        }
    });

    println!("session {session_id} — empty line or Ctrl-D exits");
    loop {
        print!("> ");
        use std::io::Write;
        std::io::stdout().flush()?;
        let line = read_stdin_line().await?;
        let input = line.trim();
        if input.is_empty() {
            break;
        }
        let outcome = runtime
            .run(
                &session_id,
                input,
                Arc::new(TerminalAsker),
                CancellationToken::new(),
            )
            .await;
        match outcome {
            Ok(outcome) => println!(
                "\n[{:?} after {} iteration(s)]",
                outcome.termination, outcome.iterations
            ),
            Err(e) => println!("\nerror: {e:#}"),
        }
    }
    printer.abort();
    Ok(())
}

/// Open (or create) the project for the given root and start a session
/// with a default agent selected.
fn open_session(runtime: &Runtime, project: Option<PathBuf>) -> anyhow::Result<String> {
    let root = match project {
        Some(p) => p,
        None => std::env::current_dir()?,
    };
    let root = root.canonicalize().unwrap_or(root);
    let store = runtime.store();

    let project = store
        .list_projects()?
        .into_iter()
        .find(|p| p.root_path == root);
    let project = match project {
        Some(p) => p,
        None => {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "project".to_string());
            store.create_project(&name, &root)?
        }
    };

    let agent = default_agent(runtime)?;
    let session = store.create_session(project.id, None)?;
    store.set_active_agent(&session.id, &agent.slug)?;
    Ok(session.id)
}

/// First primary agent in the roster, or a bootstrapped default bound to
/// the first configured provider.
fn default_agent(runtime: &Runtime) -> anyhow::Result<Agent> {
    let store = runtime.store();
    if let Some(agent) = store
        .list_agents()?
        .into_iter()
        .find(|a| a.category == orchid_config::AgentCategory::Primary)
    {
        return Ok(agent);
    }
    let provider_id = runtime
        .deps()
        .providers
        .ids()
        .first()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no providers configured; add one to the config file"))?;
    let agent = Agent {
        id: uuid::Uuid::new_v4().to_string(),
        slug: "assistant".to_string(),
        name: "Assistant".to_string(),
        category: orchid_config::AgentCategory::Primary,
        provider_id,
        model_id: "default".to_string(),
        system_prompt: "You are a capable software engineering assistant working in the \
                        user's project directory. Use the available tools to read, search, \
                        and modify files, and explain what you did."
            .to_string(),
        prompt_variables: Default::default(),
        execution_mode: Default::default(),
        max_iterations: 25,
        timeout_secs: None,
        can_spawn_subagents: true,
        allowed_subagent_types: vec![],
        tools: Default::default(),
        permissions: vec![],
    };
    store.upsert_agent(&agent)?;
    Ok(agent)
}
