// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{BudgetTypeArg, Cli, Commands};
use revis_core::paths;
use revis_core::{export_session, ExportOptions, GitManager, RevisLoop};
use revis_store::{Budget, BudgetKind, Session, SessionStatus, Store};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let repo_root = match std::env::current_dir() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("error: cannot determine working directory: {e}");
            return ExitCode::from(1);
        }
    };

    // While a session runs, everything also goes to its log file.
    let session_log = match &cli.command {
        Commands::Loop { name, background: false, .. } | Commands::Resume { name } => {
            let path = paths::session_log_path(&repo_root, name);
            let _ = std::fs::create_dir_all(paths::logs_dir(&repo_root));
            Some(path)
        }
        _ => None,
    };
    init_logging(cli.verbose, session_log.as_deref());

    // Interrupts leave the detached training alive and the store
    // consistent; the session can be resumed afterwards.
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted");
            std::process::exit(130);
        }
    });

    match run(cli, repo_root).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: u8, log_file: Option<&Path>) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let registry = tracing_subscriber::registry().with(filter).with(stderr_layer);

    match log_file.and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    }) {
        Some(file) => {
            let file_layer = fmt::layer().with_ansi(false).with_writer(Arc::new(file));
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
}

async fn run(cli: Cli, repo_root: PathBuf) -> anyhow::Result<()> {
    match cli.command {
        Commands::Init => run_init(&repo_root),
        Commands::Loop { ref name, ref budget, budget_type, ref baseline, background } => {
            let parsed = parse_budget(budget, budget_type)?;
            if background {
                run_loop_background(name, budget, budget_type, baseline.as_deref())
            } else {
                run_loop_cmd(&cli, &repo_root, name, parsed, baseline.as_deref()).await
            }
        }
        Commands::Resume { ref name } => run_resume(&cli, &repo_root, name).await,
        Commands::Status { watch } => run_status(&repo_root, watch).await,
        Commands::Watch { ref name } => run_watch(&repo_root, name).await,
        Commands::Logs { ref name, lines, follow } => run_logs(&repo_root, name, lines, follow),
        Commands::Stop => run_stop(&repo_root),
        Commands::List { all } => run_list(&repo_root, all).await,
        Commands::Show { ref name, trace } => run_show(&repo_root, name, trace).await,
        Commands::Export { ref name, no_pr, force } => {
            run_export(&repo_root, name, ExportOptions { no_pr, force }).await
        }
        Commands::Delete { ref names, force, keep_branch } => {
            run_delete(&repo_root, names, force, keep_branch).await
        }
    }
}

fn open_store(repo_root: &Path) -> anyhow::Result<Store> {
    let db = paths::db_path(repo_root);
    if !db.exists() {
        anyhow::bail!("no revis store at {} (run `revis init` first)", db.display());
    }
    Ok(Store::open(&db)?)
}

fn load_config(cli: &Cli, repo_root: &Path) -> anyhow::Result<revis_config::Config> {
    let path = revis_config::config_path(repo_root, cli.config.as_deref());
    revis_config::load(&path)
}

/// `--budget 5` for runs; `--budget 2h` (or plain seconds) for time.
fn parse_budget(value: &str, budget_type: BudgetTypeArg) -> anyhow::Result<Budget> {
    match budget_type {
        BudgetTypeArg::Runs => {
            let runs: i64 = value
                .parse()
                .with_context(|| format!("run budget must be an integer, got '{value}'"))?;
            if runs <= 0 {
                anyhow::bail!("run budget must be positive");
            }
            Ok(Budget::new(BudgetKind::Runs, runs))
        }
        BudgetTypeArg::Time => {
            let seconds = match value.parse::<i64>() {
                Ok(secs) if secs > 0 => secs,
                _ => revis_config::parse_duration(value)?.as_secs() as i64,
            };
            Ok(Budget::new(BudgetKind::Time, seconds))
        }
    }
}

fn run_init(repo_root: &Path) -> anyhow::Result<()> {
    let revis_dir = paths::revis_dir(repo_root);
    std::fs::create_dir_all(paths::logs_dir(repo_root))?;
    std::fs::create_dir_all(paths::artifacts_dir(repo_root))?;
    std::fs::create_dir_all(revis_dir.join("runs"))?;

    // Opening creates the schema.
    let _store = Store::open(paths::db_path(repo_root))?;

    let config_path = repo_root.join(revis_config::CONFIG_FILE);
    if revis_config::write_default_config(&config_path)? {
        println!("wrote {}", config_path.display());
    } else {
        println!("{} already exists, leaving it alone", config_path.display());
    }

    // Keep campaign state out of version control.
    let gitignore = repo_root.join(".gitignore");
    let entry = format!("{}/", paths::REVIS_DIR);
    let current = std::fs::read_to_string(&gitignore).unwrap_or_default();
    if !current.lines().any(|l| l.trim() == entry || l.trim() == paths::REVIS_DIR) {
        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&entry);
        updated.push('\n');
        std::fs::write(&gitignore, updated)?;
        println!("added {entry} to .gitignore");
    }

    println!("initialized {}", revis_dir.display());
    println!("edit revis.yaml, then start with: revis loop --name <name> --budget <n>");
    Ok(())
}

async fn run_loop_cmd(
    cli: &Cli,
    repo_root: &Path,
    name: &str,
    budget: Budget,
    baseline: Option<&str>,
) -> anyhow::Result<()> {
    let config = load_config(cli, repo_root)?;
    let store = open_store(repo_root)?;
    let mut runner = RevisLoop::new(config, store, repo_root.to_path_buf());
    let session = runner.run(name, budget, baseline).await?;
    print_termination(&session);
    Ok(())
}

/// Re-invoke ourselves inside a detached tmux session.
fn run_loop_background(
    name: &str,
    budget: &str,
    budget_type: BudgetTypeArg,
    baseline: Option<&str>,
) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("locating revis binary")?;
    let type_arg = match budget_type {
        BudgetTypeArg::Time => "time",
        BudgetTypeArg::Runs => "runs",
    };
    let mut inner = format!(
        "{} loop --name {name} --budget {budget} --type {type_arg}",
        exe.display()
    );
    if let Some(baseline) = baseline {
        inner.push_str(&format!(" --baseline {baseline}"));
    }

    let tmux_session = paths::background_session_name(name);
    let status = std::process::Command::new("tmux")
        .args(["new-session", "-d", "-s", &tmux_session, &inner])
        .status()
        .context("spawning tmux (is tmux installed?)")?;
    if !status.success() {
        anyhow::bail!("failed to start background session '{tmux_session}'");
    }
    println!("session '{name}' started in background");
    println!("  follow:  revis logs {name} -f");
    println!("  attach:  revis watch {name}");
    println!("  stop:    revis stop");
    Ok(())
}

async fn run_resume(cli: &Cli, repo_root: &Path, name: &str) -> anyhow::Result<()> {
    let config = load_config(cli, repo_root)?;
    let store = open_store(repo_root)?;
    let session = store
        .get_session_by_name(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no session named '{name}'"))?;
    if session.status == SessionStatus::Running {
        let alive = session.pid.is_some()
            && store.get_orphaned_sessions().await?.iter().all(|s| s.id != session.id);
        if alive {
            anyhow::bail!("session '{name}' is already running");
        }
        // Orphaned: the holder process died; safe to take over.
    }
    if session.budget.remaining() == 0 {
        anyhow::bail!("session '{name}' has no remaining budget");
    }

    let mut runner = RevisLoop::new(config, store, repo_root.to_path_buf());
    let finished = runner.resume(&session).await?;
    print_termination(&finished);
    Ok(())
}

async fn run_status(repo_root: &Path, watch: bool) -> anyhow::Result<()> {
    let store = open_store(repo_root)?;
    loop {
        print_status(&store).await?;
        if !watch {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        println!();
    }
}

async fn print_status(store: &Store) -> anyhow::Result<()> {
    match store.get_running_session().await? {
        Some(session) => {
            println!("session '{}' ({})", session.name, session.id);
            println!("  branch:     {}", session.branch);
            println!("  iterations: {}", session.iteration_count);
            println!(
                "  budget:     {}/{} {}",
                session.budget.used, session.budget.value, session.budget.kind
            );
            println!("  model cost: ${:.2}", session.llm_cost_usd);
            println!("  retries:    {} left", session.retry_budget);

            let runs = store.query_runs(&session.id, 5).await?;
            if !runs.is_empty() {
                println!("  recent runs:");
                for run in runs {
                    let metrics = store.get_run_metrics(&run.id).await?;
                    let metric_text = metrics
                        .iter()
                        .map(|m| format!("{}={:.4}", m.name, m.value))
                        .collect::<Vec<_>>()
                        .join(" ");
                    println!(
                        "    #{:<3} {:<9} {}",
                        run.iteration_number,
                        run.status.as_str(),
                        metric_text
                    );
                }
            }
        }
        None => println!("no running session"),
    }

    let orphaned = store.get_orphaned_sessions().await?;
    for session in orphaned {
        println!(
            "warning: session '{}' is marked running but its process (pid {}) is gone; \
             resume it with: revis resume {}",
            session.name,
            session.pid.unwrap_or(0),
            session.name
        );
    }
    Ok(())
}

async fn run_watch(repo_root: &Path, name: &str) -> anyhow::Result<()> {
    let store = open_store(repo_root)?;
    let session = store.get_session_by_name(name).await?;

    // Prefer the backgrounded orchestrator shell; fall back to the training
    // pane itself.
    let mut candidates = vec![paths::background_session_name(name)];
    if let Some(session) = session {
        candidates.push(paths::training_session_name(&session.id));
    }

    for tmux_session in &candidates {
        let probe = std::process::Command::new("tmux")
            .args(["has-session", "-t", tmux_session])
            .output();
        if matches!(probe, Ok(out) if out.status.success()) {
            let status = std::process::Command::new("tmux")
                .args(["attach", "-t", tmux_session])
                .status()
                .context("attaching tmux")?;
            if !status.success() {
                anyhow::bail!("tmux attach to '{tmux_session}' failed");
            }
            return Ok(());
        }
    }
    anyhow::bail!("no tmux session found for '{name}' (tried {})", candidates.join(", "));
}

fn run_logs(repo_root: &Path, name: &str, lines: usize, follow: bool) -> anyhow::Result<()> {
    let path = paths::session_log_path(repo_root, name);
    if !path.exists() {
        anyhow::bail!("no log file at {}", path.display());
    }

    let content = std::fs::read_to_string(&path)?;
    let tail: Vec<&str> = content.lines().rev().take(lines).collect();
    for line in tail.iter().rev() {
        println!("{line}");
    }

    if !follow {
        return Ok(());
    }
    let mut offset = content.len() as u64;
    loop {
        std::thread::sleep(Duration::from_secs(2));
        let meta = std::fs::metadata(&path)?;
        if meta.len() > offset {
            use std::io::{Read, Seek, SeekFrom};
            let mut file = std::fs::File::open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut fresh = String::new();
            file.read_to_string(&mut fresh)?;
            print!("{fresh}");
            offset = meta.len();
        }
    }
}

fn run_stop(repo_root: &Path) -> anyhow::Result<()> {
    let revis_dir = paths::revis_dir(repo_root);
    if !revis_dir.exists() {
        anyhow::bail!("no .revis directory here (run `revis init` first)");
    }
    std::fs::write(paths::stop_signal_path(repo_root), b"")?;
    println!("stop signal written; the session will stop at the next iteration boundary");
    Ok(())
}

async fn run_list(repo_root: &Path, all: bool) -> anyhow::Result<()> {
    let store = open_store(repo_root)?;
    let limit = if all { 1000 } else { 20 };
    let sessions = store.list_sessions(None, limit).await?;
    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:>5} {:>12} {:>8}  {}",
        "NAME", "STATUS", "ITER", "BUDGET", "COST", "EXPORTED"
    );
    for s in sessions {
        let budget = format!("{}/{} {}", s.budget.used, s.budget.value, s.budget.kind);
        let exported = match (&s.pr_url, s.exported_at) {
            (Some(url), _) => url.clone(),
            (None, Some(_)) => "pushed".to_string(),
            (None, None) => "-".to_string(),
        };
        println!(
            "{:<20} {:<10} {:>5} {:>12} {:>8}  {}",
            s.name,
            s.status.as_str(),
            s.iteration_count,
            budget,
            format!("${:.2}", s.llm_cost_usd),
            exported
        );
    }
    Ok(())
}

async fn run_show(repo_root: &Path, name: &str, trace: bool) -> anyhow::Result<()> {
    let store = open_store(repo_root)?;
    let session = store
        .get_session_by_name(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no session named '{name}'"))?;

    println!("session '{}' ({})", session.name, session.id);
    println!("  status:     {}", session.status);
    if let Some(reason) = session.termination_reason {
        println!("  reason:     {reason}");
    }
    println!("  branch:     {} (base {})", session.branch, &session.base_sha[..12.min(session.base_sha.len())]);
    println!("  started:    {}", session.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(ended) = session.ended_at {
        println!("  ended:      {}", ended.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!(
        "  budget:     {}/{} {}",
        session.budget.used, session.budget.value, session.budget.kind
    );
    println!("  model cost: ${:.2}", session.llm_cost_usd);
    if let Some(url) = &session.pr_url {
        println!("  pr:         {url}");
    }

    let runs = store.query_runs(&session.id, 100).await?;
    for run in runs.iter().rev() {
        println!();
        println!(
            "run #{} ({}) — {}{}",
            run.iteration_number,
            run.id,
            run.status.as_str(),
            run.exit_code
                .filter(|c| *c != 0)
                .map(|c| format!(", exit {c}"))
                .unwrap_or_default()
        );
        if let Some(desc) = &run.change_description {
            println!("  change:  {desc}");
        }
        if let Some(hypothesis) = &run.hypothesis {
            println!("  why:     {hypothesis}");
        }
        let metrics = store.get_run_metrics(&run.id).await?;
        if !metrics.is_empty() {
            let text = metrics
                .iter()
                .map(|m| format!("{}={:.4}", m.name, m.value))
                .collect::<Vec<_>>()
                .join(" ");
            println!("  metrics: {text}");
        }
        for decision in store.get_decisions(&run.id).await? {
            println!(
                "  decision: [{}] {}{}",
                decision.action_type,
                decision.rationale,
                decision
                    .commit_sha
                    .as_deref()
                    .map(|sha| format!(" ({})", &sha[..7.min(sha.len())]))
                    .unwrap_or_default()
            );
        }
        if trace {
            for event in store.get_traces(&run.id).await? {
                println!("  [{}] {}: {}", event.timestamp, event.event_type, event.data);
            }
        }
    }
    Ok(())
}

async fn run_export(repo_root: &Path, name: &str, options: ExportOptions) -> anyhow::Result<()> {
    let store = open_store(repo_root)?;
    let session = store
        .get_session_by_name(name)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no session named '{name}'"))?;
    let git = GitManager::new(repo_root.to_path_buf());

    match export_session(&store, &git, &session, options).await? {
        Some(url) => println!("pull request: {url}"),
        None => println!("branch {} pushed", session.branch),
    }
    Ok(())
}

async fn run_delete(
    repo_root: &Path,
    names: &[String],
    force: bool,
    keep_branch: bool,
) -> anyhow::Result<()> {
    let store = open_store(repo_root)?;
    let git = GitManager::new(repo_root.to_path_buf());

    for name in names {
        let session = match store.get_session_by_name(name).await? {
            Some(s) => s,
            None => {
                eprintln!("no session named '{name}', skipping");
                continue;
            }
        };
        store.delete_session(&session.id, force).await?;
        if !keep_branch {
            if let Err(e) = git.delete_branch(&session.branch).await {
                eprintln!("note: could not delete branch {}: {e:#}", session.branch);
            }
        }
        println!("deleted session '{name}'");
    }
    Ok(())
}

fn print_termination(session: &Session) {
    let reason = session
        .termination_reason
        .map(|r| r.as_str())
        .unwrap_or("unknown");
    println!(
        "session '{}' finished: {} ({reason}) after {} iteration(s), model cost ${:.2}",
        session.name, session.status, session.iteration_count, session.llm_cost_usd
    );
}
