// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The session state machine.
//!
//! One `RevisLoop` drives one session: preemption and budget checks at the
//! iteration boundary, code sync, training launch inside a detached tmux
//! session, guardrail evaluation, the agent proposal loop, commit, and
//! termination with branch restore.  The user-triggered stop is cooperative
//! and only observed between iterations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, warn};

use revis_agent::{
    build_fix_task, build_iteration_context, run_agent, AgentOutcome, IterationContext,
    ToolExecutor, TraceSink, SYSTEM_PROMPT,
};
use revis_analyzer::{GuardrailChecker, RunAnalyzer};
use revis_config::{parse_duration, Config, ExecutorKind, MetricsSource};
use revis_executor::{Executor, LocalConfig, LocalExecutor, SshConfig, SshExecutor};
use revis_metrics::{MetricsCollector, ResultFileCollector, WandbCollector};
use revis_model::LlmClient;
use revis_store::{
    ActionType, Budget, BudgetKind, ChangeType, Decision, RunOutcome, RunStatus, Session, Store,
    SuggestionStatus, TerminationReason,
};

use crate::artifacts::ArtifactCache;
use crate::env::collect_training_env;
use crate::git::GitManager;
use crate::handoff::{detect_coding_agent, CodingAgent, HandoffContext};
use crate::paths;

/// Persists agent tool-call traces into the store, bound to one run.
pub struct StoreTraceSink {
    store: Store,
    run_id: String,
}

impl StoreTraceSink {
    pub fn new(store: Store, run_id: impl Into<String>) -> Self {
        Self { store, run_id: run_id.into() }
    }
}

#[async_trait]
impl TraceSink for StoreTraceSink {
    async fn log_trace(&self, event_type: &str, data: serde_json::Value) {
        // Trace persistence must never abort an iteration.
        if let Err(e) = self.store.log_trace(&self.run_id, event_type, data).await {
            warn!("failed to persist trace event: {e}");
        }
    }
}

/// The orchestrator.
pub struct RevisLoop {
    config: Config,
    store: Store,
    repo_path: PathBuf,
    executor: Arc<dyn Executor>,
    llm: LlmClient,
    git: GitManager,
    metrics_collector: Box<dyn MetricsCollector>,
    analyzer: RunAnalyzer,
    guardrails: GuardrailChecker,
    tool_executor: ToolExecutor,
    coding_agent: Option<Box<dyn CodingAgent>>,
    active_process: Option<String>,
}

impl RevisLoop {
    /// Build the orchestrator with backends selected by the configuration.
    pub fn new(config: Config, store: Store, repo_path: PathBuf) -> Self {
        let executor: Arc<dyn Executor> = match config.executor.kind {
            ExecutorKind::Local => Arc::new(LocalExecutor::new(LocalConfig {
                work_dir: config.executor.work_dir.clone(),
            })),
            ExecutorKind::Ssh => Arc::new(SshExecutor::new(SshConfig {
                // Validation guarantees host/user for the ssh kind.
                host: config.executor.host.clone().unwrap_or_default(),
                user: config.executor.user.clone().unwrap_or_default(),
                port: config.executor.port,
                key_path: config.executor.key_path.clone(),
                work_dir: config.executor.work_dir.clone(),
            })),
        };

        let metrics_collector: Box<dyn MetricsCollector> = match config.metrics.source {
            MetricsSource::EvalJson => Box::new(ResultFileCollector::new(Arc::clone(&executor))),
            MetricsSource::Wandb => Box::new(WandbCollector::new(
                config.metrics.api_base.clone(),
                std::env::var("WANDB_API_KEY").ok(),
                config.metrics.entity.clone(),
                config.metrics.project.clone(),
            )),
        };

        let llm = LlmClient::from_config(&config.llm);
        let coding_agent = detect_coding_agent(&config.coding_agent);
        Self::assemble(config, store, repo_path, executor, llm, metrics_collector, coding_agent)
    }

    /// Inject executor, model client, collector, and handoff agent directly.
    /// Scenario tests drive the full loop this way.
    pub fn with_components(
        config: Config,
        store: Store,
        repo_path: PathBuf,
        executor: Arc<dyn Executor>,
        llm: LlmClient,
        metrics_collector: Box<dyn MetricsCollector>,
        coding_agent: Option<Box<dyn CodingAgent>>,
    ) -> Self {
        Self::assemble(config, store, repo_path, executor, llm, metrics_collector, coding_agent)
    }

    fn assemble(
        config: Config,
        store: Store,
        repo_path: PathBuf,
        executor: Arc<dyn Executor>,
        llm: LlmClient,
        metrics_collector: Box<dyn MetricsCollector>,
        coding_agent: Option<Box<dyn CodingAgent>>,
    ) -> Self {
        let analyzer = RunAnalyzer::new(
            store.clone(),
            config.metrics.primary.clone(),
            config.metrics.minimize,
        );
        let guardrails = GuardrailChecker::new(config.guardrails.clone());
        let tool_executor = ToolExecutor::new(repo_path.clone(), config.context.deny.clone());
        let git = GitManager::new(repo_path.clone());
        Self {
            config,
            store,
            repo_path,
            executor,
            llm,
            git,
            metrics_collector,
            analyzer,
            guardrails,
            tool_executor,
            coding_agent,
            active_process: None,
        }
    }

    /// Start a new session and run until termination.
    pub async fn run(
        &mut self,
        name: &str,
        budget: Budget,
        baseline_run_id: Option<&str>,
    ) -> anyhow::Result<Session> {
        let stop_signal = paths::stop_signal_path(&self.repo_path);
        let _ = std::fs::remove_file(&stop_signal);

        let base_sha = self.git.head_sha().await?;
        let base_branch = self.git.current_branch().await?;
        let branch = format!("revis/{name}");

        let session_id = self
            .store
            .create_session(name, &branch, &base_sha, budget, baseline_run_id)
            .await?;
        info!(session = %session_id, branch = %branch, "started session '{name}'");

        if self.git.branch_exists(&branch).await {
            self.git.checkout(&branch).await?;
        } else {
            self.git.create_branch(&branch).await?;
        }

        self.drive(&session_id, budget, &base_branch).await
    }

    /// Resume a stopped, failed, or unterminated session with its remaining
    /// budget.
    pub async fn resume(&mut self, session: &Session) -> anyhow::Result<Session> {
        let stop_signal = paths::stop_signal_path(&self.repo_path);
        let _ = std::fs::remove_file(&stop_signal);

        let budget = Budget::new(session.budget.kind, session.budget.remaining());
        self.store.reopen_session(&session.id).await?;
        self.git.checkout(&session.branch).await?;
        info!(session = %session.id, "resuming session '{}'", session.name);

        // The base branch is not recorded; termination restores the
        // repository default.
        self.drive(&session.id, budget, "main").await
    }

    /// Run the loop, then tear down the training process and transport.
    async fn drive(
        &mut self,
        session_id: &str,
        budget: Budget,
        base_branch: &str,
    ) -> anyhow::Result<Session> {
        let result = self.run_loop(session_id, budget, base_branch).await;
        self.cleanup_active_process().await;
        self.executor.close().await;
        match result {
            Ok(session) => Ok(session),
            Err(e) => {
                error!("loop failed: {e:#}");
                let _ = self
                    .terminate(session_id, TerminationReason::Error, base_branch)
                    .await;
                Err(e)
            }
        }
    }

    async fn cleanup_active_process(&mut self) {
        if let Some(process_id) = self.active_process.take() {
            info!(process = %process_id, "killing active training process");
            if let Err(e) = self.executor.kill(&process_id).await {
                warn!("failed to kill training process: {e}");
            }
        }
    }

    async fn run_loop(
        &mut self,
        session_id: &str,
        budget: Budget,
        base_branch: &str,
    ) -> anyhow::Result<Session> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {session_id} vanished"))?;
        let mut iteration = session.iteration_count;
        let mut current_train_cmd = self.config.entry.train.clone();
        let start = Instant::now();
        let stop_signal = paths::stop_signal_path(&self.repo_path);
        let max_duration = parse_duration(&self.config.guardrails.max_run_duration)?;

        // `budget.value` is this leg's allowance (the full budget on a fresh
        // start, the remainder on resume); stored usage stays cumulative.
        let time_already_used = session.budget.used;
        let iteration_limit = iteration + budget.value;

        loop {
            // 1. Preemption: stop signal, then budget.
            if stop_signal.exists() {
                info!("stop signal received");
                let _ = std::fs::remove_file(&stop_signal);
                return self.terminate(session_id, TerminationReason::UserStop, base_branch).await;
            }
            match budget.kind {
                BudgetKind::Time => {
                    let elapsed = start.elapsed().as_secs() as i64;
                    self.store
                        .update_session_budget(session_id, time_already_used + elapsed)
                        .await?;
                    if elapsed >= budget.value {
                        info!("time budget exhausted");
                        return self
                            .terminate(session_id, TerminationReason::BudgetExhausted, base_branch)
                            .await;
                    }
                }
                BudgetKind::Runs => {
                    if iteration >= iteration_limit {
                        info!("run budget exhausted");
                        return self
                            .terminate(session_id, TerminationReason::BudgetExhausted, base_branch)
                            .await;
                    }
                }
            }

            // 2. Advance.
            iteration = self.store.increment_iteration(session_id).await?;
            info!(iteration, "starting iteration");

            debug!("syncing code to executor");
            self.executor
                .sync_code(&self.repo_path, &self.config.executor.work_dir)
                .await?;

            let run_id = self
                .store
                .create_run(session_id, &json!({"iteration": iteration}).to_string(), iteration)
                .await?;
            let run_output_dir = paths::run_output_dir(&run_id);
            let log_path = format!("{run_output_dir}/train.log");

            // 3. Launch.
            let mut run_env = collect_training_env(&self.config, &self.repo_path);
            run_env.insert("REVIS_OUTPUT_DIR".into(), run_output_dir.clone());
            run_env.insert("REVIS_RUN_ID".into(), run_id.clone());
            run_env.insert("REVIS_SESSION_ID".into(), session_id.to_string());

            // pipefail keeps the training exit code across the tee.
            let wrapped_cmd = format!(
                "set -o pipefail; mkdir -p {run_output_dir} && {current_train_cmd} 2>&1 | tee {log_path}"
            );
            let tmux_name = paths::training_session_name(session_id);
            let run_started = SystemTime::now();
            info!(command = %current_train_cmd, "launching training");

            let launch_result = match self.executor.launch(&wrapped_cmd, &run_env, &tmux_name).await {
                Ok(process_id) => {
                    self.active_process = Some(process_id.clone());
                    // 4. Wait with the per-run hard cap.  A transport fault
                    // that survives the executor's reconnect attempt is a
                    // run failure subject to the retry budget.
                    let waited = self.executor.wait(&process_id, Some(max_duration)).await;
                    self.active_process = None;
                    match waited {
                        Ok(exit) => {
                            self.store.set_run_exit_code(&run_id, exit.exit_code).await?;
                            Ok(exit)
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            };

            let exit = match launch_result {
                Ok(exit) => exit,
                Err(e) => {
                    error!("training launch failed: {e:#}");
                    self.store.set_run_status(&run_id, RunStatus::Failed).await?;
                    match self.consume_retry(session_id).await? {
                        Retry::Exhausted => {
                            return self
                                .terminate(
                                    session_id,
                                    TerminationReason::RetryExhaustion,
                                    base_branch,
                                )
                                .await;
                        }
                        Retry::Available => {}
                    }
                    let error_context =
                        format!("Training launch failed:\n{e:#}\n\nInvestigate and fix.");
                    // Escalation is not honored on the launch-error path.
                    if let Some(command) = self.fix_round(&run_id, &error_context).await? {
                        current_train_cmd = command;
                    }
                    continue;
                }
            };

            // 5. Failure path.
            if exit.failed {
                warn!(exit_code = exit.exit_code, "run failed");
                self.store.set_run_status(&run_id, RunStatus::Failed).await?;
                self.store.set_run_outcome(&run_id, RunOutcome::Failed).await?;
                match self.consume_retry(session_id).await? {
                    Retry::Exhausted => {
                        return self
                            .terminate(session_id, TerminationReason::RetryExhaustion, base_branch)
                            .await;
                    }
                    Retry::Available => {}
                }

                let log_tail = self
                    .executor
                    .get_log_tail(&log_path, self.config.context.log_tail_lines)
                    .await
                    .unwrap_or_default();
                let message = exit
                    .error_message
                    .unwrap_or_else(|| format!("exit {}", exit.exit_code));
                let error_context = format!("Training failed ({message}):\n{log_tail}");

                self.tool_executor.bind_run(Arc::clone(&self.executor), run_output_dir.clone());
                let outcome = self.run_fix_agent(&run_id, &error_context).await?;
                if let Some(outcome) = outcome {
                    if outcome.escalate {
                        info!(reason = ?outcome.escalate_reason, "agent escalated during fix");
                        return self
                            .terminate(session_id, TerminationReason::ModelEscalation, base_branch)
                            .await;
                    }
                    if let Some(command) = self.commit_fix(&run_id, &outcome).await? {
                        current_train_cmd = command;
                    }
                }
                continue;
            }

            self.store.set_run_status(&run_id, RunStatus::Completed).await?;

            // 6. Metrics.
            debug!("collecting evaluation results");
            let collect_tail = self.executor.get_log_tail(&log_path, 1000).await.unwrap_or_default();
            let metrics = match self.metrics_collector.collect(&run_output_dir, &collect_tail).await? {
                Some(m) => m,
                None => {
                    error!("failed to collect metrics");
                    self.store.set_run_status(&run_id, RunStatus::Failed).await?;
                    self.store.set_run_outcome(&run_id, RunOutcome::Failed).await?;
                    match self.consume_retry(session_id).await? {
                        Retry::Exhausted => {
                            return self
                                .terminate(
                                    session_id,
                                    TerminationReason::RetryExhaustion,
                                    base_branch,
                                )
                                .await;
                        }
                        Retry::Available => {}
                    }
                    let log_tail = self
                        .executor
                        .get_log_tail(&log_path, self.config.context.log_tail_lines)
                        .await
                        .unwrap_or_default();
                    let error_context = format!(
                        "Training completed but no usable metrics were produced \
                         (expected {run_output_dir}/eval.json or a tracker run).\n{log_tail}"
                    );
                    self.tool_executor.bind_run(Arc::clone(&self.executor), run_output_dir.clone());
                    if let Some(outcome) = self.run_fix_agent(&run_id, &error_context).await? {
                        if outcome.escalate {
                            info!(reason = ?outcome.escalate_reason, "agent escalated during fix");
                            return self
                                .terminate(
                                    session_id,
                                    TerminationReason::ModelEscalation,
                                    base_branch,
                                )
                                .await;
                        }
                        if let Some(command) = self.commit_fix(&run_id, &outcome).await? {
                            current_train_cmd = command;
                        }
                    }
                    continue;
                }
            };

            self.store.log_metrics(&run_id, &metrics, None).await?;
            // History now includes the current run; the first entry anchors
            // divergence detection.
            let history = self.analyzer.metric_history(session_id).await?;

            if !self.config.artifacts.patterns.is_empty() {
                if let Err(e) = self.collect_run_artifacts(&run_id, run_started).await {
                    warn!("artifact collection failed: {e:#}");
                }
            }

            let primary_value = metrics.get(&self.config.metrics.primary).copied();
            info!(
                metric = %self.config.metrics.primary,
                value = ?primary_value,
                "metrics collected"
            );

            // Target check.
            if let (Some(target), Some(value)) = (self.config.metrics.target, primary_value) {
                let achieved = if self.config.metrics.minimize {
                    value <= target
                } else {
                    value >= target
                };
                if achieved {
                    info!(value, target, "target achieved");
                    self.store.set_run_outcome(&run_id, RunOutcome::Improved).await?;
                    return self
                        .terminate(session_id, TerminationReason::TargetAchieved, base_branch)
                        .await;
                }
            }

            // 7. Guardrails.
            let initial_value = history.first().copied();
            let guardrail_results = self.guardrails.check_eval_result(
                &metrics,
                &self.config.metrics.primary,
                initial_value,
                &history,
                self.config.metrics.minimize,
            );
            if self.guardrails.has_critical_violation(&guardrail_results) {
                let messages: Vec<&str> = self
                    .guardrails
                    .violations(&guardrail_results)
                    .iter()
                    .map(|v| v.message.as_str())
                    .collect();
                warn!(violations = ?messages, "critical guardrail violations");
            }
            if guardrail_results
                .iter()
                .any(|r| r.guardrail == "plateau_detection" && r.triggered)
            {
                info!("plateau detected");
                self.store.set_run_outcome(&run_id, RunOutcome::Plateau).await?;
                return self.terminate(session_id, TerminationReason::Plateau, base_branch).await;
            }

            // Previous run's metrics for comparison.
            let previous_metrics = {
                let recent = self.store.query_runs(session_id, 2).await?;
                match recent.get(1) {
                    Some(prev_run) => {
                        let rows = self.store.get_run_metrics(&prev_run.id).await?;
                        if rows.is_empty() {
                            None
                        } else {
                            Some(rows.into_iter().map(|m| (m.name, m.value)).collect::<HashMap<_, _>>())
                        }
                    }
                    None => None,
                }
            };

            // Configured baseline run, when the session has one.
            let baseline_metrics = match self.store.get_baseline_run(session_id).await? {
                Some(baseline_run) => {
                    let rows = self.store.get_run_metrics(&baseline_run.id).await?;
                    if rows.is_empty() {
                        None
                    } else {
                        Some(rows.into_iter().map(|m| (m.name, m.value)).collect::<HashMap<_, _>>())
                    }
                }
                None => None,
            };

            let comparison = self.analyzer.compare(
                &metrics,
                previous_metrics.as_ref(),
                baseline_metrics.as_ref(),
            );
            // A run that dropped the primary metric has no meaningful delta.
            let metric_delta = metrics
                .contains_key(&self.config.metrics.primary)
                .then_some(comparison.delta_from_previous)
                .flatten();
            self.record_outcome(&run_id, metric_delta).await?;

            // 8. Propose.
            let run_summaries = self
                .analyzer
                .summarize_runs(session_id, self.config.context.history)
                .await?;
            info!("running agent to propose improvements");

            self.tool_executor.reset();
            self.tool_executor.bind_run(Arc::clone(&self.executor), run_output_dir.clone());

            let task = build_iteration_context(&IterationContext {
                run_summaries: &run_summaries,
                metrics: &metrics,
                primary_metric: &self.config.metrics.primary,
                // The configured baseline run anchors improvements; without
                // one the session's initial value does.
                baseline_value: comparison.baseline_value.or(initial_value),
                target_value: self.config.metrics.target,
                minimize: self.config.metrics.minimize,
                metric_delta,
                guardrail_results: &guardrail_results,
                constraints: &self.config.context.constraints,
                train_command: &current_train_cmd,
            });

            let tracer = StoreTraceSink::new(self.store.clone(), run_id.clone());
            let agent_result = run_agent(
                &task,
                SYSTEM_PROMPT,
                &mut self.tool_executor,
                &mut self.llm,
                self.config.context.max_agent_rounds,
                Some(&tracer),
            )
            .await;
            self.store.update_session_cost(session_id, self.llm.total_cost).await?;

            let outcome = match agent_result {
                Ok(o) => o,
                Err(e) => {
                    // Complete API failure is a run-level failure.
                    error!("agent invocation failed: {e:#}");
                    match self.consume_retry(session_id).await? {
                        Retry::Exhausted => {
                            return self
                                .terminate(
                                    session_id,
                                    TerminationReason::RetryExhaustion,
                                    base_branch,
                                )
                                .await;
                        }
                        Retry::Available => continue,
                    }
                }
            };
            info!(cost = self.llm.total_cost, "agent finished");
            self.store
                .set_run_analysis(&run_id, &outcome.rationale)
                .await?;

            // 9. Apply.
            if outcome.escalate {
                info!(reason = ?outcome.escalate_reason, "agent escalated");
                self.store
                    .attach_decision(
                        &run_id,
                        Decision {
                            action_type: ActionType::Escalate,
                            rationale: outcome
                                .escalate_reason
                                .clone()
                                .unwrap_or_else(|| outcome.rationale.clone()),
                            commit_sha: None,
                        },
                    )
                    .await?;
                return self
                    .terminate(session_id, TerminationReason::ModelEscalation, base_branch)
                    .await;
            }

            let has_config_changes = !self.tool_executor.config_changes.is_empty();
            let has_command_change = self.tool_executor.next_command.is_some();
            let has_code_request = self.tool_executor.code_change_request.is_some();

            if !has_config_changes && !has_command_change && !has_code_request {
                info!("agent proposed no changes, treating as plateau");
                return self.terminate(session_id, TerminationReason::Plateau, base_branch).await;
            }

            let mut change_type =
                if has_config_changes { ChangeType::Config } else { ChangeType::CliArgs };
            let mut change_descriptions: Vec<String> = Vec::new();

            for change in &self.tool_executor.config_changes {
                change_descriptions.push(format!(
                    "{}: {} -> {}",
                    change.key, change.old_value, change.new_value
                ));
            }
            if let Some(command) = &self.tool_executor.next_command {
                change_descriptions.push(format!("command: {command}"));
            }

            // Code-change request: record the suggestion and hand off.
            if let Some(request) = self.tool_executor.code_change_request.clone() {
                change_type = ChangeType::CodeHandoff;
                let suggestion_id = self
                    .store
                    .create_suggestion(session_id, Some(&run_id), &request.suggestion)
                    .await?;

                match &self.coding_agent {
                    Some(agent) => {
                        info!(agent = agent.name(), "handing off code change");
                        let handoff = agent
                            .handoff(HandoffContext {
                                iteration_history: &run_summaries,
                                latest_metrics: &metrics,
                                suggestion: &request.suggestion,
                                relevant_files: &request.relevant_files,
                                constraints: &self.config.context.constraints,
                            })
                            .await;
                        if handoff.success {
                            let preview: String = request.suggestion.chars().take(50).collect();
                            change_descriptions.push(format!("[code] {preview}..."));
                            self.store
                                .update_suggestion_status(
                                    &suggestion_id,
                                    SuggestionStatus::HandedOff,
                                    Some(agent.name()),
                                )
                                .await?;
                        } else {
                            warn!(error = ?handoff.error_message, "coding agent failed");
                            self.store
                                .update_suggestion_status(
                                    &suggestion_id,
                                    SuggestionStatus::Rejected,
                                    Some(agent.name()),
                                )
                                .await?;
                        }
                    }
                    None => {
                        warn!(
                            "code change requested but no coding agent is configured; \
                             suggestion recorded for manual follow-up"
                        );
                    }
                }
            }

            let change_description = (!change_descriptions.is_empty())
                .then(|| change_descriptions.join("; "));

            // Commit on-disk changes (config mutations plus handoff output).
            let committed = if has_config_changes || has_code_request {
                let diff = self.git.diff().await.unwrap_or_default();
                if self.git.has_uncommitted_changes().await? {
                    let message = format!("Revis iteration {iteration}: {}", outcome.rationale);
                    let sha = self.git.commit(&message).await?;
                    self.store.set_run_commit(&run_id, &sha).await?;
                    let short = &sha[..7.min(sha.len())];
                    info!(sha = %short, "committed iteration change");
                    self.store
                        .attach_decision(
                            &run_id,
                            Decision {
                                action_type: ActionType::from(change_type),
                                rationale: outcome.rationale.clone(),
                                commit_sha: Some(sha),
                            },
                        )
                        .await?;
                    Some(diff)
                } else {
                    // A code-handoff that wrote nothing leaves the tree clean.
                    self.store
                        .attach_decision(
                            &run_id,
                            Decision {
                                action_type: ActionType::from(change_type),
                                rationale: outcome.rationale.clone(),
                                commit_sha: None,
                            },
                        )
                        .await?;
                    None
                }
            } else {
                // Pure command change still records the decision.
                self.store
                    .attach_decision(
                        &run_id,
                        Decision {
                            action_type: ActionType::CliArgs,
                            rationale: outcome.rationale.clone(),
                            commit_sha: None,
                        },
                    )
                    .await?;
                None
            };

            self.store
                .update_run_change(
                    &run_id,
                    change_type,
                    change_description.as_deref(),
                    Some(&outcome.rationale),
                    committed.as_deref().filter(|d| !d.is_empty()),
                )
                .await?;

            // Training command override applies to the NEXT iteration only.
            if let Some(command) = self.tool_executor.next_command.take() {
                info!(command = %command, "next iteration will use a new command");
                current_train_cmd = command;
            }

            if budget.kind == BudgetKind::Runs {
                self.store.update_session_budget(session_id, iteration).await?;
            }
        }
    }

    /// Pull files the run produced into the content-addressed cache and
    /// record artifact rows.
    async fn collect_run_artifacts(
        &self,
        run_id: &str,
        since: SystemTime,
    ) -> anyhow::Result<()> {
        let staging = tempfile::tempdir()?;
        let collected = self
            .executor
            .collect_artifacts(&self.config.artifacts.patterns, since, staging.path())
            .await?;
        if collected.is_empty() {
            return Ok(());
        }
        let cache = ArtifactCache::new(self.repo_path.join(&self.config.artifacts.path));
        for file in &collected {
            let (rel_path, size) = cache.store(file)?;
            self.store
                .log_artifact(run_id, artifact_kind(file), &rel_path, Some(size as i64))
                .await?;
        }
        info!(count = collected.len(), "collected run artifacts");
        Ok(())
    }

    /// Decrement the retry budget; reports whether any attempts remain.
    async fn consume_retry(&self, session_id: &str) -> anyhow::Result<Retry> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {session_id} vanished"))?;
        let remaining = session.retry_budget - 1;
        self.store.update_session_retry_budget(session_id, remaining).await?;
        if remaining <= 0 {
            warn!("retry budget exhausted");
            Ok(Retry::Exhausted)
        } else {
            info!(remaining, "retry budget decremented");
            Ok(Retry::Available)
        }
    }

    /// Launch-error fix: run the agent, commit any changes.  Escalation is
    /// not honored on this path.  Returns a command override, if any.
    async fn fix_round(
        &mut self,
        run_id: &str,
        error_context: &str,
    ) -> anyhow::Result<Option<String>> {
        match self.run_fix_agent(run_id, error_context).await? {
            Some(outcome) => self.commit_fix(run_id, &outcome).await,
            None => Ok(None),
        }
    }

    /// Run the agent in fix mode.  Agent API failure is swallowed here; the
    /// retry budget already covers repeated run failures.
    async fn run_fix_agent(
        &mut self,
        run_id: &str,
        error_context: &str,
    ) -> anyhow::Result<Option<AgentOutcome>> {
        info!("running agent to fix error");
        self.tool_executor.reset();

        let task = build_fix_task(error_context);
        let tracer = StoreTraceSink::new(self.store.clone(), run_id.to_string());
        let result = run_agent(
            &task,
            SYSTEM_PROMPT,
            &mut self.tool_executor,
            &mut self.llm,
            self.config.context.max_agent_rounds,
            Some(&tracer),
        )
        .await;

        if let Some(run) = self.store.get_run(run_id).await? {
            self.store
                .update_session_cost(&run.session_id, self.llm.total_cost)
                .await?;
        }

        match result {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                error!("fix agent failed: {e:#}");
                Ok(None)
            }
        }
    }

    /// Record and commit whatever the fix round changed; returns a command
    /// override for the next attempt.
    async fn commit_fix(
        &mut self,
        run_id: &str,
        outcome: &AgentOutcome,
    ) -> anyhow::Result<Option<String>> {
        let action_type = if !self.tool_executor.config_changes.is_empty() {
            Some(ActionType::Config)
        } else if self.tool_executor.code_change_request.is_some() {
            Some(ActionType::CodeHandoff)
        } else if self.tool_executor.next_command.is_some() {
            Some(ActionType::CliArgs)
        } else {
            None
        };

        if let Some(action_type) = action_type {
            let commit_sha = if self.git.has_uncommitted_changes().await? {
                Some(
                    self.git
                        .commit(&format!("Revis fix: {}", outcome.rationale))
                        .await?,
                )
            } else {
                None
            };
            self.store
                .attach_decision(
                    run_id,
                    Decision {
                        action_type,
                        rationale: outcome.rationale.clone(),
                        commit_sha,
                    },
                )
                .await?;
        }
        Ok(self.tool_executor.next_command.take())
    }

    /// Classify the run against its predecessor.
    async fn record_outcome(
        &self,
        run_id: &str,
        metric_delta: Option<f64>,
    ) -> anyhow::Result<()> {
        let outcome = match metric_delta {
            None => return Ok(()), // first run has nothing to compare against
            Some(delta) if delta == 0.0 => RunOutcome::Plateau,
            Some(delta) => {
                let improved = (delta < 0.0) == self.config.metrics.minimize;
                if improved {
                    RunOutcome::Improved
                } else {
                    RunOutcome::Regressed
                }
            }
        };
        self.store.set_run_outcome(run_id, outcome).await?;
        Ok(())
    }

    /// End the session and restore the previously checked-out branch.
    /// Uncommitted changes from a failed partial iteration are stashed.
    async fn terminate(
        &mut self,
        session_id: &str,
        reason: TerminationReason,
        base_branch: &str,
    ) -> anyhow::Result<Session> {
        info!(reason = %reason, "terminating session");
        self.store.end_session(session_id, reason, None).await?;

        if let Err(e) = self.git.checkout(base_branch).await {
            warn!("checkout failed ({e}); stashing uncommitted changes");
            self.git.stash().await?;
            self.git.checkout(base_branch).await?;
        }

        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {session_id} vanished"))
    }
}

enum Retry {
    Available,
    Exhausted,
}

fn artifact_kind(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("png" | "jpg" | "jpeg" | "svg") => "plot",
        Some("pt" | "ckpt" | "safetensors") => "checkpoint",
        _ => "file",
    }
}
