// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Code-change handoff to a third-party coding assistant.
//!
//! The assistant is an opaque callable: it receives a prompt describing the
//! requested change and either succeeds (files on disk are modified) or
//! fails.  Revis commits whatever the assistant wrote as part of the
//! iteration commit.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{info, warn};

use revis_analyzer::{format_run_history, RunSummary};
use revis_config::CodingAgentConfig;

/// Everything the assistant gets to see.
pub struct HandoffContext<'a> {
    pub iteration_history: &'a [RunSummary],
    pub latest_metrics: &'a HashMap<String, f64>,
    pub suggestion: &'a str,
    pub relevant_files: &'a [String],
    pub constraints: &'a [String],
}

#[derive(Debug, Clone)]
pub struct HandoffResult {
    pub success: bool,
    pub error_message: Option<String>,
}

/// An out-of-process coding assistant.
#[async_trait]
pub trait CodingAgent: Send + Sync {
    fn name(&self) -> &str;
    async fn handoff(&self, ctx: HandoffContext<'_>) -> HandoffResult;
}

/// Assistant invoked through a shell command.
///
/// The prompt is written to a temp file; a `{prompt}` placeholder in the
/// command is replaced with its path, otherwise the prompt is piped to
/// stdin.  Exit 0 means the assistant applied its change.
pub struct CommandCodingAgent {
    name: String,
    command: String,
}

impl CommandCodingAgent {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self { name: name.into(), command: command.into() }
    }
}

/// Pick the configured assistant, if any.
pub fn detect_coding_agent(config: &CodingAgentConfig) -> Option<Box<dyn CodingAgent>> {
    let kind = config.kind.as_deref()?;
    let command = match (config.command.as_deref(), kind) {
        (Some(custom), _) => custom.to_string(),
        (None, "claude-code") => "claude --print --permission-mode acceptEdits".to_string(),
        (None, "aider") => "aider --yes --message-file {prompt}".to_string(),
        (None, other) => {
            warn!(kind = other, "unknown coding agent, handoff disabled");
            return None;
        }
    };
    Some(Box::new(CommandCodingAgent::new(kind, command)))
}

fn build_prompt(ctx: &HandoffContext<'_>) -> String {
    let mut sections = vec![
        "Apply the following code change to this repository.".to_string(),
        format!("Change request:\n{}", ctx.suggestion),
    ];
    if !ctx.relevant_files.is_empty() {
        sections.push(format!("Files likely involved:\n{}", ctx.relevant_files.join("\n")));
    }
    if !ctx.latest_metrics.is_empty() {
        let mut names: Vec<&String> = ctx.latest_metrics.keys().collect();
        names.sort();
        let metrics = names
            .iter()
            .map(|n| format!("{n}={}", ctx.latest_metrics[*n]))
            .collect::<Vec<_>>()
            .join(", ");
        sections.push(format!("Latest metrics: {metrics}"));
    }
    if !ctx.iteration_history.is_empty() {
        sections.push(format!("Iteration history:\n{}", format_run_history(ctx.iteration_history)));
    }
    if !ctx.constraints.is_empty() {
        sections.push(format!("Constraints:\n- {}", ctx.constraints.join("\n- ")));
    }
    sections.join("\n\n")
}

#[async_trait]
impl CodingAgent for CommandCodingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handoff(&self, ctx: HandoffContext<'_>) -> HandoffResult {
        let prompt = build_prompt(&ctx);

        let prompt_file = match tempfile::NamedTempFile::new() {
            Ok(f) => f,
            Err(e) => {
                return HandoffResult {
                    success: false,
                    error_message: Some(format!("creating prompt file: {e}")),
                }
            }
        };
        if let Err(e) = std::fs::write(prompt_file.path(), &prompt) {
            return HandoffResult {
                success: false,
                error_message: Some(format!("writing prompt file: {e}")),
            };
        }

        let uses_placeholder = self.command.contains("{prompt}");
        let command = if uses_placeholder {
            self.command
                .replace("{prompt}", &prompt_file.path().to_string_lossy())
        } else {
            format!("{} < {}", self.command, prompt_file.path().display())
        };

        info!(agent = %self.name, "handing off code change");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(std::process::Stdio::null())
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                HandoffResult { success: true, error_message: None }
            }
            Ok(out) => HandoffResult {
                success: false,
                error_message: Some(
                    String::from_utf8_lossy(&out.stderr).trim().to_string(),
                ),
            },
            Err(e) => HandoffResult {
                success: false,
                error_message: Some(format!("spawning coding agent: {e}")),
            },
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
