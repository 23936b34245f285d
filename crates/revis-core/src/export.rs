// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Branch export: push the session branch to the hosting remote and
//! optionally open a pull request through its REST API.

use anyhow::Context;
use serde_json::json;
use tracing::info;

use revis_store::{Session, Store};

use crate::git::GitManager;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExportOptions {
    /// Push only; skip pull-request creation.
    pub no_pr: bool,
    /// Allow re-exporting an already exported session.
    pub force: bool,
}

/// Extract `(owner, repo)` from a GitHub remote URL, ssh or https.
pub fn parse_github_remote(url: &str) -> Option<(String, String)> {
    let trimmed = url.trim().trim_end_matches(".git");
    let rest = trimmed
        .strip_prefix("git@github.com:")
        .or_else(|| trimmed.strip_prefix("ssh://git@github.com/"))
        .or_else(|| trimmed.strip_prefix("https://github.com/"))
        .or_else(|| trimmed.strip_prefix("http://github.com/"))?;
    let (owner, repo) = rest.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

fn pr_body(session: &Session) -> String {
    let mut lines = vec![
        format!("Automated training-optimization session `{}`.", session.name),
        String::new(),
        format!("- Iterations: {}", session.iteration_count),
        format!(
            "- Status: {}{}",
            session.status,
            session
                .termination_reason
                .map(|r| format!(" ({r})"))
                .unwrap_or_default()
        ),
        format!("- Model cost: ${:.2}", session.llm_cost_usd),
    ];
    if let Some(baseline) = &session.baseline_run_id {
        lines.push(format!("- Baseline run: {baseline}"));
    }
    lines.join("\n")
}

/// Push the session branch and (unless `no_pr`) open a pull request.
/// Returns the PR URL when one was created.
pub async fn export_session(
    store: &Store,
    git: &GitManager,
    session: &Session,
    options: ExportOptions,
) -> anyhow::Result<Option<String>> {
    if session.exported_at.is_some() && !options.force {
        anyhow::bail!(
            "session '{}' was already exported (use --force to re-export)",
            session.name
        );
    }

    info!(branch = %session.branch, "pushing session branch");
    git.push("origin", &session.branch).await?;

    if options.no_pr {
        store.mark_session_exported(&session.id, None).await?;
        return Ok(None);
    }

    let remote_url = git.remote_url("origin").await?;
    let (owner, repo) = parse_github_remote(&remote_url)
        .ok_or_else(|| anyhow::anyhow!("origin '{remote_url}' is not a GitHub remote"))?;
    let token = std::env::var("GITHUB_TOKEN")
        .context("GITHUB_TOKEN is required to open a pull request")?;

    let api_base =
        std::env::var("GITHUB_API_URL").unwrap_or_else(|_| "https://api.github.com".to_string());
    let url = format!("{api_base}/repos/{owner}/{repo}/pulls");
    let body = json!({
        "title": format!("Revis: {}", session.name),
        "head": session.branch,
        "base": "main",
        "body": pr_body(session),
    });

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .bearer_auth(&token)
        .header("Accept", "application/vnd.github+json")
        .header("User-Agent", "revis")
        .json(&body)
        .send()
        .await
        .context("creating pull request")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("pull request creation failed ({status}): {text}");
    }

    let payload: serde_json::Value = resp.json().await.context("decoding pull request")?;
    let pr_url = payload["html_url"].as_str().map(str::to_string);
    store.mark_session_exported(&session.id, pr_url.as_deref()).await?;
    info!(url = ?pr_url, "pull request created");
    Ok(pr_url)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
