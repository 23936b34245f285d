// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Metric collection for finished runs.
//!
//! Two implementations share one contract: given a completed run, return a
//! `name → number` mapping or indicate absence.  The result-file collector
//! reads `eval.json` from the per-run output directory; the tracker
//! collector locates the run on an external experiment-tracking service via
//! its training-log URL and fetches the final summary.

mod eval_json;
mod wandb;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

pub use eval_json::ResultFileCollector;
pub use wandb::{extract_tracker_run, WandbCollector};

/// Metadata keys that are never optimization targets.  Keys beginning with
/// an underscore are likewise skipped.
pub const METRIC_KEY_DENYLIST: &[&str] = &[
    "step",
    "epoch",
    "lr",
    "learning_rate",
    "timestamp",
    "runtime",
    "grad_norm",
    "samples_per_second",
    "steps_per_second",
];

/// True when a summary key is a legitimate metric name.
pub fn is_optimizable_key(key: &str) -> bool {
    !key.starts_with('_') && !METRIC_KEY_DENYLIST.contains(&key)
}

/// Keep numeric, optimizable entries; warn about dropped values.
pub fn filter_numeric_metrics(raw: &serde_json::Map<String, serde_json::Value>) -> HashMap<String, f64> {
    let mut metrics = HashMap::new();
    for (key, value) in raw {
        if !is_optimizable_key(key) {
            continue;
        }
        match value.as_f64() {
            Some(number) => {
                metrics.insert(key.clone(), number);
            }
            None => warn!(key = %key, "dropping non-numeric metric value"),
        }
    }
    metrics
}

/// The result file the training script writes into its output directory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvalReport {
    /// Required; numeric values only.
    pub metrics: serde_json::Map<String, serde_json::Value>,
    /// Optional per-slice metric groups.
    #[serde(default)]
    pub slices: HashMap<String, HashMap<String, HashMap<String, f64>>>,
    /// Optional relative paths of produced plots.
    #[serde(default)]
    pub plots: Vec<String>,
}

/// Collector contract shared by both sources.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Metrics for the finished run, or `None` when the source has nothing
    /// usable (missing file, malformed payload, tracker still running).
    async fn collect(
        &self,
        run_output_dir: &str,
        log_tail: &str,
    ) -> anyhow::Result<Option<HashMap<String, f64>>>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
