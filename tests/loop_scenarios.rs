// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end orchestrator scenarios.
//!
//! The training process is simulated: a scripted executor "runs" each
//! attempt by writing the log and result file a real run would leave
//! behind, and a scripted model provider drives the agent loop.  Git and
//! the store are real.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::json;

use revis_core::{paths, RevisLoop};
use revis_executor::{ExitStatus, Executor};
use revis_metrics::ResultFileCollector;
use revis_model::mock::ScriptedProvider;
use revis_model::{Completion, LlmClient, ToolCallRequest, Usage};
use revis_store::{
    ActionType, Budget, BudgetKind, RunStatus, SessionStatus, Store, TerminationReason,
};

// ─── Simulated training executor ─────────────────────────────────────────────

/// One scripted training attempt.
struct SimRun {
    exit_code: i64,
    /// Body of `eval.json`, written into the run output directory.
    eval_json: Option<String>,
    log: String,
    /// Write the stop sentinel while this run executes (the orchestrator
    /// must only observe it at the next iteration boundary).
    write_stop_signal: bool,
}

impl SimRun {
    fn ok(loss: f64) -> Self {
        Self {
            exit_code: 0,
            eval_json: Some(format!(r#"{{"metrics": {{"loss": {loss}}}}}"#)),
            log: format!("epoch 1 loss={loss}\n"),
            write_stop_signal: false,
        }
    }

    fn failing() -> Self {
        Self {
            exit_code: 1,
            eval_json: None,
            log: "Traceback (most recent call last):\nRuntimeError: shape mismatch\n".into(),
            write_stop_signal: false,
        }
    }
}

/// Executor that materializes scripted runs instead of spawning tmux.
struct SimExecutor {
    work_dir: PathBuf,
    runs: Mutex<VecDeque<SimRun>>,
    last_exit: Mutex<Option<i64>>,
    launches: Mutex<Vec<String>>,
}

impl SimExecutor {
    fn new(work_dir: &Path, runs: Vec<SimRun>) -> Arc<Self> {
        Arc::new(Self {
            work_dir: work_dir.to_path_buf(),
            runs: Mutex::new(runs.into()),
            last_exit: Mutex::new(None),
            launches: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Executor for SimExecutor {
    async fn launch(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        session_name: &str,
    ) -> anyhow::Result<String> {
        let run = self
            .runs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted runs left"))?;
        self.launches.lock().unwrap().push(command.to_string());

        let output_dir = env
            .get("REVIS_OUTPUT_DIR")
            .ok_or_else(|| anyhow::anyhow!("REVIS_OUTPUT_DIR missing"))?;
        let dir = self.work_dir.join(output_dir);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("train.log"), &run.log)?;
        if let Some(eval) = &run.eval_json {
            std::fs::write(dir.join("eval.json"), eval)?;
        }
        if run.write_stop_signal {
            std::fs::write(paths::stop_signal_path(&self.work_dir), b"")?;
        }
        *self.last_exit.lock().unwrap() = Some(run.exit_code);
        Ok(session_name.to_string())
    }

    async fn wait(&self, _pid: &str, _timeout: Option<Duration>) -> anyhow::Result<ExitStatus> {
        let code = self
            .last_exit
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("wait without launch"))?;
        Ok(ExitStatus::from_code(code))
    }

    async fn kill(&self, _pid: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_running(&self, _pid: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn get_log_tail(&self, log_path: &str, lines: usize) -> anyhow::Result<String> {
        let path = self.work_dir.join(log_path);
        let content = std::fs::read_to_string(path).unwrap_or_default();
        let tail: Vec<&str> = content.lines().rev().take(lines).collect();
        Ok(tail.into_iter().rev().collect::<Vec<_>>().join("\n"))
    }

    async fn sync_code(&self, _local: &Path, _remote: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn collect_artifacts(
        &self,
        _patterns: &[String],
        _since: SystemTime,
        _dest: &Path,
    ) -> anyhow::Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    async fn file_exists(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.work_dir.join(path).exists())
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        Ok(std::fs::read_to_string(self.work_dir.join(path))?)
    }

    async fn download_file(&self, _remote: &str, _local: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    async fn reconnect(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

// ─── Fixtures ────────────────────────────────────────────────────────────────

async fn git(repo: &Path, args: &[&str]) -> String {
    let out = tokio::process::Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Repository with a committed training config on `main`.
async fn scratch_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path();
    git(repo, &["init", "-b", "main"]).await;
    git(repo, &["config", "user.email", "revis@test"]).await;
    git(repo, &["config", "user.name", "revis"]).await;
    std::fs::create_dir_all(repo.join("configs")).unwrap();
    std::fs::write(
        repo.join("configs/train.yaml"),
        "training:\n  learning_rate: 0.001\n  batch_size: 32\n",
    )
    .unwrap();
    std::fs::write(repo.join("train.py"), "print('training')\n").unwrap();
    std::fs::write(repo.join(".gitignore"), ".revis/\n").unwrap();
    git(repo, &["add", "-A"]).await;
    git(repo, &["commit", "-m", "initial"]).await;
    std::fs::create_dir_all(repo.join(".revis")).unwrap();
    dir
}

fn config_yaml(target: Option<f64>) -> revis_config::Config {
    let target_line = target.map(|t| format!("  target: {t}\n")).unwrap_or_default();
    let yaml = format!(
        "executor:\n  type: local\n  work_dir: .\n\
         entry:\n  train: python train.py\n\
         metrics:\n  primary: loss\n  minimize: true\n{target_line}"
    );
    let config: revis_config::Config = serde_yaml::from_str(&yaml).unwrap();
    config.validate().unwrap();
    config
}

fn tool_turn(id: &str, name: &str, args: serde_json::Value) -> Completion {
    Completion {
        content: String::new(),
        tool_calls: vec![ToolCallRequest {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }],
        usage: Usage { prompt_tokens: 100, completion_tokens: 10 },
    }
}

fn text_turn(text: &str) -> Completion {
    Completion {
        content: text.into(),
        tool_calls: vec![],
        usage: Usage { prompt_tokens: 100, completion_tokens: 10 },
    }
}

/// One proposal round: lower the learning rate, then summarize.
fn proposal_scripts(n: usize) -> Vec<Completion> {
    let mut scripts = Vec::new();
    for i in 0..n {
        let lr = 0.001 / (10u32.pow(i as u32 + 1)) as f64;
        scripts.push(tool_turn(
            &format!("call-{i}"),
            "modify_config",
            json!({
                "path": "configs/train.yaml",
                "key": "training.learning_rate",
                "value": lr.to_string(),
            }),
        ));
        scripts.push(text_turn("RATIONALE: lower the learning rate\nSIGNIFICANT: no"));
    }
    scripts
}

fn runner_for(
    repo: &Path,
    config: revis_config::Config,
    store: Store,
    executor: Arc<SimExecutor>,
    scripts: Vec<Completion>,
) -> RevisLoop {
    let llm = LlmClient::with_providers(vec![Box::new(ScriptedProvider::new("sim", scripts))]);
    let collector = Box::new(ResultFileCollector::new(executor.clone() as Arc<dyn Executor>));
    RevisLoop::with_components(
        config,
        store,
        repo.to_path_buf(),
        executor as Arc<dyn Executor>,
        llm,
        collector,
        None,
    )
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn monotone_improvement_reaches_target() {
    let repo = scratch_repo().await;
    let store = Store::in_memory().unwrap();
    let executor = SimExecutor::new(
        repo.path(),
        vec![SimRun::ok(0.6), SimRun::ok(0.4), SimRun::ok(0.2)],
    );

    let mut runner = runner_for(
        repo.path(),
        config_yaml(Some(0.25)),
        store.clone(),
        executor,
        proposal_scripts(2),
    );
    let session = runner
        .run("monotone", Budget::new(BudgetKind::Runs, 3), None)
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.termination_reason, Some(TerminationReason::TargetAchieved));
    assert_eq!(session.iteration_count, 3);

    let runs = store.query_runs(&session.id, 10).await.unwrap();
    assert_eq!(runs.len(), 3);
    let mut expected = vec![(1, 0.6), (2, 0.4), (3, 0.2)];
    expected.reverse(); // newest first
    for (run, (iteration, loss)) in runs.iter().zip(expected) {
        assert_eq!(run.iteration_number, iteration);
        assert_eq!(run.status, RunStatus::Completed);
        let metrics = store.get_run_metrics(&run.id).await.unwrap();
        let stored = metrics.iter().find(|m| m.name == "loss").unwrap();
        assert_eq!(stored.value, loss);
    }

    // Termination restored the base branch.
    assert_eq!(git(repo.path(), &["rev-parse", "--abbrev-ref", "HEAD"]).await, "main");
    assert!(session.ended_at.is_some());
}

#[tokio::test]
async fn plateau_terminates_after_flat_window() {
    let repo = scratch_repo().await;
    let store = Store::in_memory().unwrap();
    let executor = SimExecutor::new(
        repo.path(),
        vec![
            SimRun::ok(0.50),
            SimRun::ok(0.48),
            SimRun::ok(0.471),
            SimRun::ok(0.470),
            SimRun::ok(0.4699),
        ],
    );

    let mut runner = runner_for(
        repo.path(),
        config_yaml(None),
        store.clone(),
        executor,
        proposal_scripts(4),
    );
    let session = runner
        .run("plateau", Budget::new(BudgetKind::Runs, 10), None)
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.termination_reason, Some(TerminationReason::Plateau));
    assert_eq!(session.iteration_count, 5);

    // Each of the first four iterations carries the agent's config commit.
    let runs = store.query_runs(&session.id, 10).await.unwrap();
    for run in runs.iter().filter(|r| r.iteration_number < 5) {
        assert!(
            run.git_sha.is_some(),
            "iteration {} should carry a commit",
            run.iteration_number
        );
        let decisions = store.get_decisions(&run.id).await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].action_type, ActionType::Config);
        // The recorded commit is on the session branch.
        let sha = run.git_sha.as_deref().unwrap();
        let out = tokio::process::Command::new("git")
            .args(["merge-base", "--is-ancestor", sha, "revis/plateau"])
            .current_dir(repo.path())
            .status()
            .await
            .unwrap();
        assert!(out.success(), "commit {sha} not on session branch");
    }
}

#[tokio::test]
async fn retry_exhaustion_after_three_failures() {
    let repo = scratch_repo().await;
    let store = Store::in_memory().unwrap();
    let executor = SimExecutor::new(
        repo.path(),
        vec![SimRun::failing(), SimRun::failing(), SimRun::failing()],
    );

    // Fix rounds switch the training command; the third failure exhausts
    // the retry budget before any fix runs.
    let scripts = vec![
        tool_turn("f1", "set_next_command", json!({"command": "python train.py --safe"})),
        text_turn("RATIONALE: retry with safe flags"),
        tool_turn("f2", "set_next_command", json!({"command": "python train.py --safer"})),
        text_turn("RATIONALE: retry with even safer flags"),
    ];

    let mut runner =
        runner_for(repo.path(), config_yaml(None), store.clone(), executor, scripts);
    let session = runner
        .run("retries", Budget::new(BudgetKind::Runs, 10), None)
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.termination_reason, Some(TerminationReason::RetryExhaustion));
    assert_eq!(session.retry_budget, 0);

    let runs = store.query_runs(&session.id, 10).await.unwrap();
    assert_eq!(runs.len(), 3);
    for run in &runs {
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.exit_code, Some(1));
    }

    // The two fix rounds each recorded a decision of an allowed type.
    let mut decision_count = 0;
    for run in &runs {
        for decision in store.get_decisions(&run.id).await.unwrap() {
            assert!(matches!(
                decision.action_type,
                ActionType::Config | ActionType::CodeHandoff | ActionType::CliArgs
            ));
            decision_count += 1;
        }
    }
    assert_eq!(decision_count, 2);
}

#[tokio::test]
async fn stop_signal_is_observed_at_iteration_boundary() {
    let repo = scratch_repo().await;
    let store = Store::in_memory().unwrap();
    let mut second = SimRun::ok(0.4);
    second.write_stop_signal = true; // appears mid-run
    let executor = SimExecutor::new(repo.path(), vec![SimRun::ok(0.5), second]);

    let mut runner = runner_for(
        repo.path(),
        config_yaml(None),
        store.clone(),
        executor,
        proposal_scripts(2),
    );
    let session = runner
        .run("stopme", Budget::new(BudgetKind::Runs, 10), None)
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.termination_reason, Some(TerminationReason::UserStop));

    // The running iteration completed normally before the stop took effect.
    let runs = store.query_runs(&session.id, 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Completed));

    // The sentinel was consumed.
    assert!(!paths::stop_signal_path(repo.path()).exists());
}

#[tokio::test]
async fn divergence_is_flagged_but_session_continues() {
    let repo = scratch_repo().await;
    let store = Store::in_memory().unwrap();
    let executor = SimExecutor::new(
        repo.path(),
        vec![SimRun::ok(0.5), SimRun::ok(8.0), SimRun::ok(0.45)],
    );

    let mut runner = runner_for(
        repo.path(),
        config_yaml(None),
        store.clone(),
        executor,
        proposal_scripts(3),
    );
    let session = runner
        .run("diverge", Budget::new(BudgetKind::Runs, 3), None)
        .await
        .unwrap();

    // The divergent run did not kill the campaign; the budget did.
    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.termination_reason, Some(TerminationReason::BudgetExhausted));
    assert_eq!(session.iteration_count, 3);
    assert!(session.budget.used >= session.budget.value);

    let runs = store.query_runs(&session.id, 10).await.unwrap();
    assert_eq!(runs.len(), 3);
    assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
}

#[tokio::test]
async fn agent_with_no_changes_is_a_plateau() {
    let repo = scratch_repo().await;
    let store = Store::in_memory().unwrap();
    let executor = SimExecutor::new(repo.path(), vec![SimRun::ok(0.5)]);

    let scripts = vec![text_turn("RATIONALE: nothing worth changing")];
    let mut runner =
        runner_for(repo.path(), config_yaml(None), store.clone(), executor, scripts);
    let session = runner
        .run("no-changes", Budget::new(BudgetKind::Runs, 5), None)
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.termination_reason, Some(TerminationReason::Plateau));
    assert_eq!(session.iteration_count, 1);
}

#[tokio::test]
async fn configured_baseline_run_is_carried_through() {
    let repo = scratch_repo().await;
    let store = Store::in_memory().unwrap();

    // A finished earlier campaign provides the baseline run.
    let prior = store
        .create_session("prior", "revis/prior", "sha", Budget::new(BudgetKind::Runs, 1), None)
        .await
        .unwrap();
    let baseline_rid = store.create_run(&prior, "{}", 1).await.unwrap();
    store
        .log_metrics(&baseline_rid, &HashMap::from([("loss".to_string(), 1.0)]), None)
        .await
        .unwrap();
    store
        .end_session(&prior, TerminationReason::BudgetExhausted, None)
        .await
        .unwrap();

    let executor = SimExecutor::new(repo.path(), vec![SimRun::ok(0.5)]);
    let scripts = vec![text_turn("RATIONALE: nothing worth changing")];
    let mut runner =
        runner_for(repo.path(), config_yaml(None), store.clone(), executor, scripts);
    let session = runner
        .run("anchored", Budget::new(BudgetKind::Runs, 3), Some(&baseline_rid))
        .await
        .unwrap();

    assert_eq!(session.baseline_run_id.as_deref(), Some(baseline_rid.as_str()));
    assert_eq!(session.termination_reason, Some(TerminationReason::Plateau));
    let baseline = store.get_baseline_run(&session.id).await.unwrap().unwrap();
    assert_eq!(baseline.id, baseline_rid);
}

#[tokio::test]
async fn escalation_terminates_the_session() {
    let repo = scratch_repo().await;
    let store = Store::in_memory().unwrap();
    let executor = SimExecutor::new(repo.path(), vec![SimRun::ok(0.5)]);

    let scripts = vec![text_turn("ESCALATE: requires an architecture change")];
    let mut runner =
        runner_for(repo.path(), config_yaml(None), store.clone(), executor, scripts);
    let session = runner
        .run("escalate", Budget::new(BudgetKind::Runs, 5), None)
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Stopped);
    assert_eq!(session.termination_reason, Some(TerminationReason::ModelEscalation));

    let runs = store.query_runs(&session.id, 10).await.unwrap();
    let decisions = store.get_decisions(&runs[0].id).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].action_type, ActionType::Escalate);
    assert!(decisions[0].rationale.contains("architecture change"));
}

#[tokio::test]
async fn command_override_applies_to_the_next_iteration_only() {
    let repo = scratch_repo().await;
    let store = Store::in_memory().unwrap();
    let executor = SimExecutor::new(repo.path(), vec![SimRun::ok(0.5), SimRun::ok(0.4)]);

    let scripts = vec![
        tool_turn("c1", "set_next_command", json!({"command": "python train.py --lr 1e-5"})),
        text_turn("RATIONALE: try a smaller learning rate via CLI"),
        // The second proposal never launches: the budget gate fires first.
        tool_turn("c2", "set_next_command", json!({"command": "python train.py --lr 1e-6"})),
        text_turn("RATIONALE: go smaller still"),
    ];
    let executor_handle = executor.clone();
    let mut runner = runner_for(
        repo.path(),
        config_yaml(None),
        store.clone(),
        executor,
        scripts,
    );
    let session = runner
        .run("cli-args", Budget::new(BudgetKind::Runs, 2), None)
        .await
        .unwrap();
    assert_eq!(session.termination_reason, Some(TerminationReason::BudgetExhausted));

    let launches = executor_handle.launches.lock().unwrap();
    assert_eq!(launches.len(), 2);
    assert!(launches[0].contains("python train.py 2>&1"));
    assert!(launches[1].contains("python train.py --lr 1e-5 2>&1"));
    // Both are wrapped so the pipe preserves the training exit code.
    assert!(launches.iter().all(|l| l.starts_with("set -o pipefail;")));
}

#[tokio::test]
async fn session_can_resume_with_remaining_budget() {
    let repo = scratch_repo().await;
    let store = Store::in_memory().unwrap();

    // First leg: stop after one completed run.
    let mut second = SimRun::ok(0.4);
    second.write_stop_signal = true;
    let executor = SimExecutor::new(repo.path(), vec![SimRun::ok(0.5), second]);
    let mut runner = runner_for(
        repo.path(),
        config_yaml(None),
        store.clone(),
        executor,
        proposal_scripts(2),
    );
    let stopped = runner
        .run("resumable", Budget::new(BudgetKind::Runs, 4), None)
        .await
        .unwrap();
    assert_eq!(stopped.termination_reason, Some(TerminationReason::UserStop));
    assert_eq!(stopped.iteration_count, 2);

    // Second leg: two more runs fit in the remaining budget.
    let executor = SimExecutor::new(repo.path(), vec![SimRun::ok(0.35), SimRun::ok(0.30)]);
    let mut runner = runner_for(
        repo.path(),
        config_yaml(None),
        store.clone(),
        executor,
        proposal_scripts(2),
    );
    let resumed = runner.resume(&stopped).await.unwrap();

    assert_eq!(resumed.termination_reason, Some(TerminationReason::BudgetExhausted));
    assert_eq!(resumed.iteration_count, 4);
    let runs = store.query_runs(&resumed.id, 10).await.unwrap();
    let numbers: Vec<i64> = runs.iter().rev().map(|r| r.iteration_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
}
