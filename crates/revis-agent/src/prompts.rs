// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use revis_analyzer::{format_run_history, GuardrailResult, RunSummary};

/// System prompt for both proposal and fix invocations.
pub const SYSTEM_PROMPT: &str = "\
You are Revis, an autonomous ML training optimizer. Your job is to analyze \
training results and propose ONE focused change to improve the primary metric.

You will receive run history with metrics, the current run's results, \
guardrail check outcomes, and the current training command. Use the \
available tools to inspect the repository and training logs before deciding.

How to make changes:
1. Config changes: use modify_config (only existing keys; value is coerced \
to the existing type).
2. CLI argument changes: use set_next_command with the full training command \
for the next run.
3. Code changes: use request_code_change; it is handed off to a coding \
assistant, so describe the change precisely.

RULES:
- One hypothesis at a time. Keep changes focused and minimal.
- Respect the stated constraints and denied paths.
- If you truly cannot improve further, escalate instead of guessing.

When you are done (no more tool calls), end your final message with:
RATIONALE: <1-2 sentence explanation of the change and why>
SIGNIFICANT: yes|no  (is this a key decision point?)

If you cannot propose any improvement, end with:
ESCALATE: <why you cannot proceed>
";

/// Everything the model sees about the campaign state this iteration.
pub struct IterationContext<'a> {
    pub run_summaries: &'a [RunSummary],
    pub metrics: &'a HashMap<String, f64>,
    pub primary_metric: &'a str,
    pub baseline_value: Option<f64>,
    pub target_value: Option<f64>,
    pub minimize: bool,
    pub metric_delta: Option<f64>,
    pub guardrail_results: &'a [GuardrailResult],
    pub constraints: &'a [String],
    pub train_command: &'a str,
}

/// Assemble the user message for a proposal iteration.
pub fn build_iteration_context(ctx: &IterationContext<'_>) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "<run_history>\n{}\n</run_history>",
        format_run_history(ctx.run_summaries)
    ));

    let mut current = vec!["<current_run>".to_string()];
    if let Some(value) = ctx.metrics.get(ctx.primary_metric) {
        current.push(format!("Primary metric ({}): {value:.6}", ctx.primary_metric));
        if let Some(baseline) = ctx.baseline_value {
            let delta = value - baseline;
            let pct = if baseline != 0.0 { delta / baseline.abs() * 100.0 } else { 0.0 };
            let sign = if delta > 0.0 { "+" } else { "" };
            current.push(format!("  vs baseline: {sign}{delta:.6} ({sign}{pct:.1}%)"));
        }
    }
    if let Some(target) = ctx.target_value {
        let direction = if ctx.minimize { "<=" } else { ">=" };
        current.push(format!("Target: {} {direction} {target}", ctx.primary_metric));
    }
    current.push("\nAll metrics:".to_string());
    let mut names: Vec<&String> = ctx.metrics.keys().collect();
    names.sort();
    for name in names {
        current.push(format!("  {name}: {:.6}", ctx.metrics[name]));
    }
    current.push("</current_run>".to_string());
    sections.push(current.join("\n"));

    let mut analysis = vec!["<analysis>".to_string()];
    if let Some(delta) = ctx.metric_delta {
        let direction = if (delta < 0.0) == ctx.minimize { "improved" } else { "worsened" };
        analysis.push(format!(
            "Metric change: {} {direction} by {:.6}",
            ctx.primary_metric,
            delta.abs()
        ));
    }
    analysis.push("\nGuardrail checks:".to_string());
    for result in ctx.guardrail_results {
        let status = if result.triggered { "TRIGGERED" } else { "OK" };
        analysis.push(format!("  [{status}] {}: {}", result.guardrail, result.message));
    }
    analysis.push("</analysis>".to_string());
    sections.push(analysis.join("\n"));

    if !ctx.constraints.is_empty() {
        let mut bounds = vec!["<constraints>".to_string()];
        for constraint in ctx.constraints {
            bounds.push(format!("  - {constraint}"));
        }
        bounds.push("</constraints>".to_string());
        sections.push(bounds.join("\n"));
    }

    sections.push(format!(
        "<training_command>\n{}\n</training_command>",
        ctx.train_command
    ));

    sections.join("\n\n")
}

/// Assemble the task for a run-failure fix invocation.
pub fn build_fix_task(error_context: &str) -> String {
    format!(
        "The training run failed. Here's the error:\n\n{error_context}\n\n\
         Please use the available tools to:\n\
         1. Read relevant files to understand the issue\n\
         2. If the issue is a configuration problem, use modify_config to fix it\n\
         3. If the issue is a CLI argument problem, use set_next_command to fix it\n\
         4. If the issue requires code changes, use request_code_change\n\n\
         When done, provide:\n\
         RATIONALE: <what you fixed and why>\n"
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use revis_analyzer::{detect_nan_inf, RunSummary};

    fn metrics(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn context_includes_all_sections() {
        let summaries = vec![RunSummary {
            iteration: 1,
            metrics: metrics(&[("loss", 0.6)]),
            change_summary: "Initial run".into(),
            result_summary: "loss: 0.6000".into(),
        }];
        let m = metrics(&[("loss", 0.5), ("accuracy", 0.8)]);
        let guardrails = vec![detect_nan_inf(&m)];
        let constraints = vec!["Learning rate must stay below 1e-2".to_string()];

        let text = build_iteration_context(&IterationContext {
            run_summaries: &summaries,
            metrics: &m,
            primary_metric: "loss",
            baseline_value: Some(0.6),
            target_value: Some(0.25),
            minimize: true,
            metric_delta: Some(-0.1),
            guardrail_results: &guardrails,
            constraints: &constraints,
            train_command: "python train.py",
        });

        assert!(text.contains("<run_history>"));
        assert!(text.contains("Run #1: Initial run"));
        assert!(text.contains("Primary metric (loss): 0.500000"));
        assert!(text.contains("vs baseline"));
        assert!(text.contains("Target: loss <= 0.25"));
        assert!(text.contains("loss improved by 0.100000"));
        assert!(text.contains("[OK] nan_detection"));
        assert!(text.contains("Learning rate must stay below 1e-2"));
        assert!(text.contains("<training_command>\npython train.py"));
    }

    #[test]
    fn worsened_direction_respects_minimize_flag() {
        let m = metrics(&[("accuracy", 0.7)]);
        let text = build_iteration_context(&IterationContext {
            run_summaries: &[],
            metrics: &m,
            primary_metric: "accuracy",
            baseline_value: None,
            target_value: None,
            minimize: false,
            metric_delta: Some(-0.05),
            guardrail_results: &[],
            constraints: &[],
            train_command: "python train.py",
        });
        assert!(text.contains("accuracy worsened by 0.050000"), "{text}");
    }

    #[test]
    fn empty_constraints_section_is_omitted() {
        let m = metrics(&[("loss", 0.5)]);
        let text = build_iteration_context(&IterationContext {
            run_summaries: &[],
            metrics: &m,
            primary_metric: "loss",
            baseline_value: None,
            target_value: None,
            minimize: true,
            metric_delta: None,
            guardrail_results: &[],
            constraints: &[],
            train_command: "t",
        });
        assert!(!text.contains("<constraints>"));
    }

    #[test]
    fn fix_task_embeds_error_and_marker_instructions() {
        let task = build_fix_task("Training failed (exit 1):\nRuntimeError: shape mismatch");
        assert!(task.contains("shape mismatch"));
        assert!(task.contains("modify_config"));
        assert!(task.contains("RATIONALE:"));
    }
}
