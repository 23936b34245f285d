// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The bounded tool-call loop.
//!
//! The model is driven until it answers without tool calls, for at most N
//! round trips.  Each requested call executes in order through the
//! [`ToolExecutor`]; its text result goes back as a tool-role message
//! bearing the call id.

use serde_json::json;
use tracing::{debug, info, warn};

use revis_model::{LlmClient, Message};

use crate::tools::{tool_schemas, ToolExecutor};
use crate::tracer::TraceSink;

/// What the agent decided, extracted from its final message.
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub rationale: String,
    pub significant: bool,
    pub escalate: bool,
    pub escalate_reason: Option<String>,
    pub files_modified: Vec<String>,
    pub tool_calls_count: usize,
}

/// Run the agent loop for one task.
///
/// An agent that made zero tool calls produced no change; the orchestrator
/// treats that as a plateau.
pub async fn run_agent(
    task: &str,
    system_prompt: &str,
    executor: &mut ToolExecutor,
    client: &mut LlmClient,
    max_rounds: usize,
    tracer: Option<&dyn TraceSink>,
) -> anyhow::Result<AgentOutcome> {
    let schemas = tool_schemas();
    let mut messages = vec![Message::system(system_prompt), Message::user(task)];
    let mut tool_calls_count = 0usize;

    for round in 0..max_rounds {
        debug!(round = round + 1, max = max_rounds, "agent round");

        let response = client.complete_with_tools(&messages, &schemas).await?;

        if response.tool_calls.is_empty() {
            messages.push(Message::assistant(&response.content));
            break;
        }

        messages.push(Message::assistant_tool_calls(
            &response.content,
            response.tool_calls.clone(),
        ));

        for call in &response.tool_calls {
            tool_calls_count += 1;
            let args_preview = preview(&call.arguments.to_string(), 100);
            info!(tool = %call.name, args = %args_preview, "tool call");
            if let Some(sink) = tracer {
                sink.log_trace(
                    "tool_call",
                    json!({"tool": call.name, "args": call.arguments}),
                )
                .await;
            }

            let result = executor.execute(&call.name, &call.arguments).await;
            debug!(result = %preview(&result, 150), "tool result");
            if let Some(sink) = tracer {
                sink.log_trace(
                    "tool_result",
                    json!({"tool": call.name, "result": preview(&result, 1000)}),
                )
                .await;
            }

            messages.push(Message::tool_result(&call.id, result));
        }
    }

    let final_content = messages
        .last()
        .filter(|m| m.role == revis_model::Role::Assistant)
        .map(|m| m.content.clone())
        .unwrap_or_default();
    info!(response = %preview(&final_content, 500), "agent final response");

    let mut outcome = parse_agent_response(&final_content);
    outcome.files_modified = executor.files_modified.clone();
    outcome.tool_calls_count = tool_calls_count;

    if tool_calls_count == 0 {
        warn!("agent made no tool calls");
    }

    Ok(outcome)
}

/// Parse the agent's final summary message.
///
/// Scans for:
/// ```text
/// RATIONALE: <1-2 sentence explanation>
/// SIGNIFICANT: yes/no
/// ESCALATE: <reason>
/// ```
pub fn parse_agent_response(text: &str) -> AgentOutcome {
    let mut rationale: Option<String> = None;
    let mut significant = false;
    let mut escalate = false;
    let mut escalate_reason = None;

    for line in text.trim().lines() {
        let upper = line.to_uppercase();
        if upper.starts_with("RATIONALE:") {
            rationale = line.splitn(2, ':').nth(1).map(|s| s.trim().to_string());
        } else if upper.starts_with("SIGNIFICANT:") {
            significant = line.to_lowercase().contains("yes");
        } else if upper.starts_with("ESCALATE:") {
            escalate = true;
            escalate_reason = line.splitn(2, ':').nth(1).map(|s| s.trim().to_string());
        }
    }

    AgentOutcome {
        rationale: rationale.unwrap_or_else(|| "No rationale provided".to_string()),
        significant,
        escalate,
        escalate_reason,
        files_modified: Vec::new(),
        tool_calls_count: 0,
    }
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max).collect();
    format!("{truncated}...")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
