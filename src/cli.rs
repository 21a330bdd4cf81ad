// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// A local agent orchestration runtime for LLM tool-use sessions.
#[derive(Debug, Parser)]
#[command(name = "orchid", version, about)]
pub struct Cli {
    /// Explicit config file (also honoured via ORCHID_CONFIG).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (otherwise logging goes to the
    /// configured log file, if any).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the interactive frontend (the default when no subcommand is given).
    Ui {
        /// Project root directory (default: current directory).
        #[arg(long)]
        project: Option<PathBuf>,
        /// Resume an existing session instead of opening a new one.
        #[arg(long)]
        session: Option<String>,
    },
    /// Re-embed a session's messages into its vector collection.
    RebuildIndex {
        /// Session id to rebuild.
        #[arg(long)]
        session: String,
    },
    /// Print a session's full transcript (messages, parts, sub-sessions) as JSON.
    DumpSession {
        /// Session id to dump.
        session: String,
    },
    /// Print the merged configuration as YAML.
    ShowConfig,
}
