// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use revis_store::Store;

/// Comparison of the current run against the previous run and the baseline.
#[derive(Debug, Clone, Default)]
pub struct RunComparison {
    pub current_value: f64,
    pub previous_value: Option<f64>,
    pub baseline_value: Option<f64>,
    pub delta_from_previous: Option<f64>,
    pub delta_from_baseline: Option<f64>,
    /// Positive fraction means improvement in the configured direction.
    pub improvement_from_previous: Option<f64>,
    pub improvement_from_baseline: Option<f64>,
}

/// Summary of one run for model context.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub iteration: i64,
    pub metrics: HashMap<String, f64>,
    /// First attached decision's rationale, or "Initial run".
    pub change_summary: String,
    /// Human-readable deltas against the previous run.
    pub result_summary: String,
}

/// Compares runs and produces summaries from stored history.
pub struct RunAnalyzer {
    store: Store,
    primary_metric: String,
    minimize: bool,
}

impl RunAnalyzer {
    pub fn new(store: Store, primary_metric: impl Into<String>, minimize: bool) -> Self {
        Self { store, primary_metric: primary_metric.into(), minimize }
    }

    /// Primary-metric history for a session, oldest first.
    pub async fn metric_history(&self, session_id: &str) -> anyhow::Result<Vec<f64>> {
        let runs = self.store.query_runs(session_id, 100).await?;
        let mut history = Vec::new();
        for run in runs.iter().rev() {
            let metrics = self.store.get_run_metrics(&run.id).await?;
            if let Some(m) = metrics.iter().find(|m| m.name == self.primary_metric) {
                history.push(m.value);
            }
        }
        Ok(history)
    }

    pub async fn initial_value(&self, session_id: &str) -> anyhow::Result<Option<f64>> {
        Ok(self.metric_history(session_id).await?.first().copied())
    }

    /// Compare current metrics to the previous run's and the baseline's.
    pub fn compare(
        &self,
        current: &HashMap<String, f64>,
        previous: Option<&HashMap<String, f64>>,
        baseline: Option<&HashMap<String, f64>>,
    ) -> RunComparison {
        let current_value = current.get(&self.primary_metric).copied().unwrap_or(0.0);

        let direction = if self.minimize { -1.0 } else { 1.0 };
        let relate = |reference: Option<f64>| -> (Option<f64>, Option<f64>) {
            match reference {
                Some(prev) => {
                    let delta = current_value - prev;
                    let improvement =
                        (prev != 0.0).then(|| direction * delta / prev.abs());
                    (Some(delta), improvement)
                }
                None => (None, None),
            }
        };

        let previous_value = previous.and_then(|m| m.get(&self.primary_metric).copied());
        let baseline_value = baseline.and_then(|m| m.get(&self.primary_metric).copied());
        let (delta_from_previous, improvement_from_previous) = relate(previous_value);
        let (delta_from_baseline, improvement_from_baseline) = relate(baseline_value);

        RunComparison {
            current_value,
            previous_value,
            baseline_value,
            delta_from_previous,
            delta_from_baseline,
            improvement_from_previous,
            improvement_from_baseline,
        }
    }

    /// Per-run summaries for model context, oldest first.
    pub async fn summarize_runs(
        &self,
        session_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<RunSummary>> {
        let runs = self.store.query_runs(session_id, limit).await?;
        let mut summaries = Vec::new();
        let mut prev_metrics: HashMap<String, f64> = HashMap::new();

        for run in runs.iter().rev() {
            let metrics: HashMap<String, f64> = self
                .store
                .get_run_metrics(&run.id)
                .await?
                .into_iter()
                .map(|m| (m.name, m.value))
                .collect();

            let decisions = self.store.get_decisions(&run.id).await?;
            let change_summary = decisions
                .first()
                .map(|d| d.rationale.clone())
                .unwrap_or_else(|| "Initial run".to_string());

            let mut parts: Vec<String> = Vec::new();
            let mut names: Vec<&String> = metrics.keys().collect();
            names.sort();
            for name in names {
                let value = metrics[name];
                match prev_metrics.get(name) {
                    Some(prev) => {
                        let delta = value - prev;
                        let pct = if *prev != 0.0 { delta / prev.abs() * 100.0 } else { 0.0 };
                        let sign = if delta > 0.0 { "+" } else { "" };
                        parts.push(format!("{name}: {prev:.4} -> {value:.4} ({sign}{pct:.1}%)"));
                    }
                    None => parts.push(format!("{name}: {value:.4}")),
                }
            }

            summaries.push(RunSummary {
                iteration: run.iteration_number,
                metrics: metrics.clone(),
                change_summary,
                result_summary: if parts.is_empty() {
                    "No metrics".to_string()
                } else {
                    parts.join(", ")
                },
            });

            prev_metrics = metrics;
        }

        Ok(summaries)
    }
}

/// Render run summaries as the history block of the iteration context.
pub fn format_run_history(summaries: &[RunSummary]) -> String {
    if summaries.is_empty() {
        return "No previous runs.".to_string();
    }
    let mut lines = Vec::new();
    for s in summaries {
        lines.push(format!("Run #{}: {}", s.iteration, s.change_summary));
        lines.push(format!("  Result: {}", s.result_summary));
    }
    lines.join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
