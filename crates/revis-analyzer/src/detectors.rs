// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use revis_config::GuardrailsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// Outcome of one guardrail check.
#[derive(Debug, Clone)]
pub struct GuardrailResult {
    pub triggered: bool,
    pub guardrail: &'static str,
    pub message: String,
    pub severity: Severity,
}

impl GuardrailResult {
    fn ok(guardrail: &'static str, message: String) -> Self {
        Self { triggered: false, guardrail, message, severity: Severity::Warning }
    }

    fn triggered(guardrail: &'static str, message: String, severity: Severity) -> Self {
        Self { triggered: true, guardrail, message, severity }
    }
}

/// Any metric that is NaN or infinite is an error: the numbers downstream
/// comparisons would produce are meaningless.
pub fn detect_nan_inf(metrics: &HashMap<String, f64>) -> GuardrailResult {
    for (name, value) in metrics {
        if value.is_nan() {
            return GuardrailResult::triggered(
                "nan_detection",
                format!("NaN detected in metric '{name}'"),
                Severity::Error,
            );
        }
        if value.is_infinite() {
            return GuardrailResult::triggered(
                "nan_detection",
                format!("Inf detected in metric '{name}'"),
                Severity::Error,
            );
        }
    }
    GuardrailResult::ok("nan_detection", "No NaN/Inf values detected".into())
}

/// Triggered when |current| exceeds `multiplier × |initial|`.  A zero
/// initial value never triggers.
pub fn detect_divergence(
    current_value: f64,
    initial_value: f64,
    multiplier: f64,
) -> GuardrailResult {
    if initial_value == 0.0 {
        return GuardrailResult::ok(
            "divergence_detection",
            "Initial value is zero, cannot detect divergence".into(),
        );
    }

    let threshold = initial_value.abs() * multiplier;
    if current_value.abs() > threshold {
        return GuardrailResult::triggered(
            "divergence_detection",
            format!(
                "Divergence detected: {current_value:.4} > {threshold:.4} ({multiplier}x initial)"
            ),
            Severity::Error,
        );
    }
    GuardrailResult::ok(
        "divergence_detection",
        format!("No divergence: {current_value:.4} within {multiplier}x initial"),
    )
}

/// Triggered when the best value over the most recent `n_runs` entries shows
/// less than `threshold` fractional improvement over the best value in the
/// prior prefix.  Needs more than `n_runs` points of history.
pub fn detect_plateau(
    metric_history: &[f64],
    threshold: f64,
    n_runs: usize,
    minimize: bool,
) -> GuardrailResult {
    if metric_history.len() <= n_runs {
        return GuardrailResult::ok(
            "plateau_detection",
            format!("Not enough history ({} <= {} runs)", metric_history.len(), n_runs),
        );
    }

    let split = metric_history.len() - n_runs;
    let (before, recent) = metric_history.split_at(split);

    let best = |values: &[f64]| -> f64 {
        values
            .iter()
            .copied()
            .fold(if minimize { f64::INFINITY } else { f64::NEG_INFINITY }, |acc, v| {
                if minimize {
                    acc.min(v)
                } else {
                    acc.max(v)
                }
            })
    };

    let best_before = best(before);
    let best_recent = best(recent);

    let improvement = if best_before == 0.0 {
        0.0
    } else if minimize {
        (best_before - best_recent) / best_before.abs()
    } else {
        (best_recent - best_before) / best_before.abs()
    };

    if improvement < threshold {
        return GuardrailResult::triggered(
            "plateau_detection",
            format!(
                "Plateau detected: {:.2}% improvement over last {} runs (threshold: {:.2}%)",
                improvement * 100.0,
                n_runs,
                threshold * 100.0
            ),
            Severity::Warning,
        );
    }
    GuardrailResult::ok(
        "plateau_detection",
        format!("No plateau: {:.2}% improvement", improvement * 100.0),
    )
}

/// Triggered when the run has been going longer than `max_duration`.
pub fn detect_timeout(started_at: DateTime<Utc>, max_duration: Duration) -> GuardrailResult {
    let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
    if elapsed > max_duration {
        return GuardrailResult::triggered(
            "timeout_detection",
            format!("Timeout: {}s > {}s", elapsed.as_secs(), max_duration.as_secs()),
            Severity::Error,
        );
    }
    GuardrailResult::ok(
        "timeout_detection",
        format!("Within time limit: {}s / {}s", elapsed.as_secs(), max_duration.as_secs()),
    )
}

/// Runs every enabled detector over an eval result plus history.
pub struct GuardrailChecker {
    config: GuardrailsConfig,
}

impl GuardrailChecker {
    pub fn new(config: GuardrailsConfig) -> Self {
        Self { config }
    }

    /// All checks for a completed run.  `metric_history` excludes the
    /// current value; the plateau detector sees history plus current.
    pub fn check_eval_result(
        &self,
        metrics: &HashMap<String, f64>,
        primary_metric: &str,
        initial_value: Option<f64>,
        metric_history: &[f64],
        minimize: bool,
    ) -> Vec<GuardrailResult> {
        let mut results = Vec::new();

        if self.config.nan_detection_enabled {
            results.push(detect_nan_inf(metrics));
        }

        let current = metrics.get(primary_metric).copied();

        if self.config.divergence_detection_enabled {
            if let (Some(current), Some(initial)) = (current, initial_value) {
                results.push(detect_divergence(
                    current,
                    initial,
                    self.config.divergence_multiplier,
                ));
            }
        }

        if self.config.plateau_detection_enabled {
            if let Some(current) = current {
                let mut full_history = metric_history.to_vec();
                full_history.push(current);
                results.push(detect_plateau(
                    &full_history,
                    self.config.plateau_threshold,
                    self.config.plateau_runs,
                    minimize,
                ));
            }
        }

        results
    }

    pub fn check_run_duration(
        &self,
        started_at: DateTime<Utc>,
        max_duration: Duration,
    ) -> GuardrailResult {
        if !self.config.timeout_enabled {
            return GuardrailResult::ok("timeout_detection", "Timeout detection disabled".into());
        }
        detect_timeout(started_at, max_duration)
    }

    /// A critical violation is any triggered detector of error severity.
    pub fn has_critical_violation(&self, results: &[GuardrailResult]) -> bool {
        results.iter().any(|r| r.triggered && r.severity == Severity::Error)
    }

    pub fn violations<'a>(&self, results: &'a [GuardrailResult]) -> Vec<&'a GuardrailResult> {
        results.iter().filter(|r| r.triggered).collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
