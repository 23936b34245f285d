// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use revis_executor::Executor;

use crate::{filter_numeric_metrics, EvalReport, MetricsCollector};

/// Reads the `eval.json` the training script writes into its per-run output
/// directory (revealed to training via `REVIS_OUTPUT_DIR`).
pub struct ResultFileCollector {
    executor: Arc<dyn Executor>,
}

impl ResultFileCollector {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl MetricsCollector for ResultFileCollector {
    async fn collect(
        &self,
        run_output_dir: &str,
        _log_tail: &str,
    ) -> anyhow::Result<Option<HashMap<String, f64>>> {
        let path = format!("{run_output_dir}/eval.json");
        if !self.executor.file_exists(&path).await? {
            warn!(path = %path, "result file missing");
            return Ok(None);
        }
        let content = self.executor.read_file(&path).await?;
        let report: EvalReport = match serde_json::from_str(&content) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path, "malformed result file: {e}");
                return Ok(None);
            }
        };
        Ok(Some(filter_numeric_metrics(&report.metrics)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use revis_executor::{LocalConfig, LocalExecutor};

    fn collector_in(dir: &std::path::Path) -> ResultFileCollector {
        ResultFileCollector::new(Arc::new(LocalExecutor::new(LocalConfig {
            work_dir: dir.to_string_lossy().into_owned(),
        })))
    }

    #[tokio::test]
    async fn reads_metrics_from_result_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("run1")).unwrap();
        std::fs::write(
            dir.path().join("run1/eval.json"),
            r#"{"metrics": {"loss": 0.25, "f1": 0.8, "note": "text", "_step": 3}}"#,
        )
        .unwrap();
        let metrics = collector_in(dir.path())
            .collect("run1", "")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics["loss"], 0.25);
        assert_eq!(metrics["f1"], 0.8);
    }

    #[tokio::test]
    async fn missing_file_is_absent_not_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collector_in(dir.path()).collect("run1", "").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_json_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("run1")).unwrap();
        std::fs::write(dir.path().join("run1/eval.json"), "{not json").unwrap();
        assert!(collector_in(dir.path()).collect("run1", "").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_metrics_key_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("run1")).unwrap();
        std::fs::write(dir.path().join("run1/eval.json"), r#"{"plots": []}"#).unwrap();
        assert!(collector_in(dir.path()).collect("run1", "").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finite_value_round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("r")).unwrap();
        for x in [0.0, 1e-12, 0.6, 123456.789] {
            std::fs::write(
                dir.path().join("r/eval.json"),
                format!(r#"{{"metrics": {{"loss": {x}}}}}"#),
            )
            .unwrap();
            let metrics = collector_in(dir.path()).collect("r", "").await.unwrap().unwrap();
            assert_eq!(metrics["loss"], x);
        }
    }
}
