// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::types::{Message, ToolCallRequest, ToolSchema, Usage};

/// Provider failure taxonomy.
///
/// The fallback chain advances past transient failures and stops on fatal
/// ones: a bad key or malformed request will fail identically on every
/// candidate model.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// True when trying the next fallback model could help.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Auth(_) | Self::BadRequest(_))
    }
}

/// One completed model turn.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
}

/// A single model endpoint.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Model identifier as reported to users and the cost table.
    fn model_name(&self) -> &str;

    /// Send the conversation (and optional tool schemas) and return the
    /// model's turn.
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<Completion, ProviderError>;
}

/// Static metadata for a known provider prefix.
#[derive(Debug, Clone)]
pub struct DriverMeta {
    /// Prefix used in model ids (`anthropic/...`).
    pub id: &'static str,
    /// Environment variable holding the API key.
    pub api_key_env: &'static str,
    /// Default chat-completions base URL.
    pub default_base_url: &'static str,
}

/// Known provider prefixes.  Anything else needs an explicit `api_base`.
pub static DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        id: "anthropic",
        api_key_env: "ANTHROPIC_API_KEY",
        default_base_url: "https://api.anthropic.com/v1",
    },
    DriverMeta {
        id: "openai",
        api_key_env: "OPENAI_API_KEY",
        default_base_url: "https://api.openai.com/v1",
    },
    DriverMeta {
        id: "openrouter",
        api_key_env: "OPENROUTER_API_KEY",
        default_base_url: "https://openrouter.ai/api/v1",
    },
];

/// Split a model id into (driver, bare model name).
///
/// `anthropic/claude-x` resolves the anthropic driver; an unprefixed id
/// defaults to the first driver whose key is set, falling back to anthropic.
pub fn resolve_driver(model: &str) -> (&'static DriverMeta, String) {
    if let Some((prefix, rest)) = model.split_once('/') {
        if let Some(meta) = DRIVERS.iter().find(|d| d.id == prefix) {
            return (meta, rest.to_string());
        }
    }
    let meta = DRIVERS
        .iter()
        .find(|d| std::env::var(d.api_key_env).is_ok())
        .unwrap_or(&DRIVERS[0]);
    (meta, model.to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
