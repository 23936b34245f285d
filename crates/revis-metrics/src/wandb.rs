// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{filter_numeric_metrics, MetricsCollector};

const DEFAULT_API_BASE: &str = "https://api.wandb.ai";

/// `(entity, project, run_id)` parsed from a tracker run URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerRun {
    pub entity: String,
    pub project: String,
    pub run_id: String,
}

/// Find the `View run at https://<host>/<entity>/<project>/runs/<id>` line
/// the tracker SDK prints during init, anywhere in the log tail.
pub fn extract_tracker_run(log_tail: &str) -> Option<TrackerRun> {
    // Unwrap is safe: the pattern is a compile-time constant.
    let re = Regex::new(r"https?://[^\s/]+/([^\s/]+)/([^\s/]+)/runs/([A-Za-z0-9_-]+)").unwrap();
    let caps = re.captures(log_tail)?;
    Some(TrackerRun {
        entity: caps[1].to_string(),
        project: caps[2].to_string(),
        run_id: caps[3].to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct TrackerRunInfo {
    state: String,
    #[serde(default)]
    summary: serde_json::Map<String, serde_json::Value>,
}

/// Collects final run summaries from an external experiment tracker.
///
/// The run is located by pattern-matching the run URL out of the training
/// log tail; configured entity/project override the URL's when set.
pub struct WandbCollector {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    entity: Option<String>,
    project: Option<String>,
}

impl WandbCollector {
    pub fn new(
        api_base: Option<String>,
        api_key: Option<String>,
        entity: Option<String>,
        project: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key,
            entity,
            project,
        }
    }

    async fn fetch_run(&self, run: &TrackerRun) -> anyhow::Result<Option<TrackerRunInfo>> {
        let entity = self.entity.as_deref().unwrap_or(&run.entity);
        let project = self.project.as_deref().unwrap_or(&run.project);
        let url = format!(
            "{}/runs/{}/{}/{}",
            self.api_base.trim_end_matches('/'),
            entity,
            project,
            run.run_id
        );
        debug!(url = %url, "fetching tracker run summary");

        let mut req = self.client.get(&url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "tracker run fetch failed");
            return Ok(None);
        }
        Ok(Some(resp.json().await?))
    }
}

#[async_trait]
impl MetricsCollector for WandbCollector {
    async fn collect(
        &self,
        _run_output_dir: &str,
        log_tail: &str,
    ) -> anyhow::Result<Option<HashMap<String, f64>>> {
        let run = match extract_tracker_run(log_tail) {
            Some(r) => r,
            None => {
                warn!("no tracker run URL found in training log");
                return Ok(None);
            }
        };

        let info = match self.fetch_run(&run).await? {
            Some(i) => i,
            None => return Ok(None),
        };

        // Only terminal runs have a trustworthy summary.
        if info.state != "finished" && info.state != "crashed" {
            debug!(state = %info.state, "tracker run not terminal yet");
            return Ok(None);
        }

        Ok(Some(filter_numeric_metrics(&info.summary)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
