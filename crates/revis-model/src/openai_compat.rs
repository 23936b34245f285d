// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Non-streaming driver for OpenAI-compatible `/chat/completions` APIs.
//!
//! Revis only needs one complete turn at a time (the agent loop is
//! synchronous over tool rounds), so the driver posts the conversation and
//! parses the finished response rather than consuming SSE deltas.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::provider::{Completion, ModelProvider, ProviderError};
use crate::types::{Message, Role, ToolCallRequest, ToolSchema, Usage};

pub struct OpenAiCompatProvider {
    model: String,
    api_key: Option<String>,
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// `base_url` ends before `/chat/completions`,
    /// e.g. `https://api.openai.com/v1`.
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens,
            temperature,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<Completion, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "messages": build_wire_messages(messages),
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            let wire_tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(wire_tools);
        }

        debug!(
            model = %self.model,
            message_count = messages.len(),
            tool_count = tools.len(),
            "sending completion request"
        );

        let mut req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let detail = format!("{} {}: {}", self.model, status.as_u16(), truncate(&text, 400));
            return Err(match status.as_u16() {
                401 | 403 => ProviderError::Auth(detail),
                429 => ProviderError::RateLimited(detail),
                400 | 404 | 422 => ProviderError::BadRequest(detail),
                500..=599 => ProviderError::ServiceUnavailable(detail),
                _ => ProviderError::Other(detail),
            });
        }

        let value: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Other(format!("decoding response: {e}")))?;
        parse_completion(&value)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let mut v = json!({ "role": role, "content": m.content });
            if let Some(calls) = &m.tool_calls {
                let wire: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {
                                "name": c.name,
                                "arguments": c.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                v["tool_calls"] = json!(wire);
            }
            if let Some(id) = &m.tool_call_id {
                v["tool_call_id"] = json!(id);
            }
            v
        })
        .collect()
}

fn parse_completion(value: &Value) -> Result<Completion, ProviderError> {
    let message = &value["choices"][0]["message"];
    if message.is_null() {
        return Err(ProviderError::Other(format!(
            "response has no choices: {}",
            truncate(&value.to_string(), 200)
        )));
    }

    let content = message["content"].as_str().unwrap_or_default().to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let id = call["id"].as_str().unwrap_or_default().to_string();
            let name = call["function"]["name"].as_str().unwrap_or_default().to_string();
            let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
            // Some models emit malformed argument JSON; surface it to the
            // tool layer as an empty object rather than failing the turn.
            let arguments =
                serde_json::from_str(raw_args).unwrap_or_else(|_| json!({}));
            tool_calls.push(ToolCallRequest { id, name, arguments });
        }
    }

    let usage = Usage {
        prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    };

    Ok(Completion { content, tool_calls, usage })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
