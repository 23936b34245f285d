// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic mock providers for tests.  No network access.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::provider::{Completion, ModelProvider, ProviderError};
use crate::types::{Message, ToolCallRequest, ToolSchema, Usage};

/// Pre-scripted provider: each `complete` call pops the next completion from
/// the front of the queue.  Lets tests specify exact turn sequences —
/// including tool calls — without network access.
pub struct ScriptedProvider {
    name: String,
    scripts: Mutex<Vec<Completion>>,
    /// Messages seen by the most recent `complete` call, for assertions.
    pub last_messages: Mutex<Vec<Message>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, scripts: Vec<Completion>) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(scripts),
            last_messages: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: provider that answers every call with the same text.
    pub fn always_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(
            name,
            vec![Completion {
                content: text,
                tool_calls: vec![],
                usage: Usage { prompt_tokens: 5, completion_tokens: 5 },
            }],
        )
    }

    /// Convenience: one tool call turn followed by a final text turn.
    pub fn tool_then_text(
        name: impl Into<String>,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            vec![
                Completion {
                    content: String::new(),
                    tool_calls: vec![ToolCallRequest {
                        id: call_id.into(),
                        name: tool_name.into(),
                        arguments,
                    }],
                    usage: Usage { prompt_tokens: 5, completion_tokens: 5 },
                },
                Completion {
                    content: final_text.into(),
                    tool_calls: vec![],
                    usage: Usage { prompt_tokens: 5, completion_tokens: 5 },
                },
            ],
        )
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolSchema],
    ) -> Result<Completion, ProviderError> {
        *self.last_messages.lock().unwrap() = messages.to_vec();
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            // Repeat the quiet "done" shape once scripts run out so loops
            // terminate instead of erroring.
            return Ok(Completion {
                content: "RATIONALE: nothing further".into(),
                tool_calls: vec![],
                usage: Usage { prompt_tokens: 1, completion_tokens: 1 },
            });
        }
        Ok(scripts.remove(0))
    }
}

/// Provider that always fails with a fixed error kind.
pub struct FailingProvider {
    name: String,
    kind: FailKind,
}

enum FailKind {
    RateLimited,
    Unavailable,
    Connection,
    Auth,
    BadRequest,
}

impl FailingProvider {
    pub fn rate_limited(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: FailKind::RateLimited }
    }
    pub fn unavailable(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: FailKind::Unavailable }
    }
    pub fn connection(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: FailKind::Connection }
    }
    pub fn auth(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: FailKind::Auth }
    }
    pub fn bad_request(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: FailKind::BadRequest }
    }
}

#[async_trait]
impl ModelProvider for FailingProvider {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        _messages: &[Message],
        _tools: &[ToolSchema],
    ) -> Result<Completion, ProviderError> {
        let detail = format!("{} (mock)", self.name);
        Err(match self.kind {
            FailKind::RateLimited => ProviderError::RateLimited(detail),
            FailKind::Unavailable => ProviderError::ServiceUnavailable(detail),
            FailKind::Connection => ProviderError::Connection(detail),
            FailKind::Auth => ProviderError::Auth(detail),
            FailKind::BadRequest => ProviderError::BadRequest(detail),
        })
    }
}
