// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Budget kind for `revis loop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum BudgetTypeArg {
    /// Wall-clock budget; accepts `2h`, `90m`, `3600s`, or plain seconds.
    Time,
    /// Run-count budget.
    #[default]
    Runs,
}

#[derive(Parser, Debug)]
#[command(
    name = "revis",
    about = "Autonomous iteration engine for ML training campaigns",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (default: revis.yaml in the repository root)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create .revis/, the store, and a default revis.yaml
    Init,

    /// Start a new optimization session
    Loop {
        /// Session name (unique forever; also names the branch revis/<name>)
        #[arg(long, short = 'n')]
        name: String,
        /// Budget amount: runs count, or a duration for --type time
        #[arg(long, short = 'b')]
        budget: String,
        /// Budget type
        #[arg(long = "type", value_enum, default_value = "runs")]
        budget_type: BudgetTypeArg,
        /// Baseline run id anchoring percentage improvements
        #[arg(long)]
        baseline: Option<String>,
        /// Detach: re-invoke under tmux and return immediately
        #[arg(long)]
        background: bool,
    },

    /// Resume a non-running session with its remaining budget
    Resume { name: String },

    /// Show the running session's progress and flag orphaned sessions
    Status {
        /// Refresh every 5 seconds
        #[arg(long, short = 'w')]
        watch: bool,
    },

    /// Attach to a backgrounded session's tmux shell
    Watch { name: String },

    /// Print or follow a session's orchestrator log
    Logs {
        name: String,
        /// Number of lines to print
        #[arg(long, short = 'n', default_value = "50")]
        lines: usize,
        /// Keep following the log
        #[arg(long, short = 'f')]
        follow: bool,
    },

    /// Signal the running session to stop at the next iteration boundary
    Stop,

    /// List sessions
    List {
        /// Show every session instead of the most recent
        #[arg(long)]
        all: bool,
    },

    /// Detailed information about one session
    Show {
        name: String,
        /// Also print every recorded tool call
        #[arg(long)]
        trace: bool,
    },

    /// Push the session branch and open a pull request
    Export {
        name: String,
        /// Push only; skip pull-request creation
        #[arg(long)]
        no_pr: bool,
        /// Re-export an already exported session
        #[arg(long)]
        force: bool,
    },

    /// Remove sessions from the store and delete their local branches
    Delete {
        /// Session names
        #[arg(required = true)]
        names: Vec<String>,
        /// Delete even a running session
        #[arg(long)]
        force: bool,
        /// Keep the local git branch
        #[arg(long)]
        keep_branch: bool,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
