// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use tracing::{info, warn};

use revis_config::LlmConfig;

use crate::openai_compat::OpenAiCompatProvider;
use crate::provider::{resolve_driver, ModelProvider, ProviderError};
use crate::types::{Message, ToolCallRequest, ToolSchema, Usage};

/// Price table: ($ per 1M input tokens, $ per 1M output tokens), matched by
/// substring so dated model ids hit their family row.
const COST_PER_1M: &[(&str, f64, f64)] = &[
    ("claude-opus", 15.0, 75.0),
    ("claude-sonnet", 3.0, 15.0),
    ("claude-haiku", 0.8, 4.0),
    ("claude-3-5-sonnet", 3.0, 15.0),
    ("gpt-4o-mini", 0.15, 0.6),
    ("gpt-4o", 2.5, 10.0),
];

/// Estimate the dollar cost of one completion.  Unknown models use
/// Sonnet-class pricing.
pub fn estimate_cost(model: &str, usage: Usage) -> f64 {
    let (input, output) = COST_PER_1M
        .iter()
        .find(|(prefix, _, _)| model.contains(prefix))
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or((3.0, 15.0));
    (f64::from(usage.prompt_tokens) * input + f64::from(usage.completion_tokens) * output)
        / 1_000_000.0
}

/// One answered request, with provenance and cost.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub model_used: String,
    pub usage: Usage,
    pub cost_usd: f64,
    pub used_fallback: bool,
}

/// Client that walks a primary-then-fallbacks model list and accumulates
/// cost over its lifetime.
pub struct LlmClient {
    providers: Vec<Box<dyn ModelProvider>>,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub fallback_used: bool,
}

impl LlmClient {
    /// Build providers for the configured primary model and each fallback.
    pub fn from_config(config: &LlmConfig) -> Self {
        let mut providers: Vec<Box<dyn ModelProvider>> = Vec::new();
        for model_id in std::iter::once(&config.model).chain(config.fallback.iter()) {
            let (driver, model) = resolve_driver(model_id);
            let base_url = config
                .api_base
                .clone()
                .unwrap_or_else(|| driver.default_base_url.to_string());
            let api_key = std::env::var(driver.api_key_env).ok();
            providers.push(Box::new(OpenAiCompatProvider::new(
                model,
                api_key,
                &base_url,
                config.max_tokens,
                config.temperature,
            )));
        }
        Self::with_providers(providers)
    }

    /// Inject providers directly (tests use scripted mocks).
    pub fn with_providers(providers: Vec<Box<dyn ModelProvider>>) -> Self {
        Self { providers, total_cost: 0.0, total_tokens: 0, fallback_used: false }
    }

    /// Send the conversation, trying models in order.
    ///
    /// Transient failures advance to the next candidate; authentication and
    /// bad-request errors propagate immediately.  When every candidate fails
    /// the last error is returned.
    pub async fn complete_with_tools(
        &mut self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> Result<LlmResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for (index, provider) in self.providers.iter().enumerate() {
            let is_fallback = index > 0;
            match provider.complete(messages, tools).await {
                Ok(completion) => {
                    let model = provider.model_name().to_string();
                    let cost = estimate_cost(&model, completion.usage);
                    self.total_cost += cost;
                    self.total_tokens += u64::from(completion.usage.total());
                    if is_fallback {
                        self.fallback_used = true;
                        info!(model = %model, "fallback model served the request");
                    }
                    return Ok(LlmResponse {
                        content: completion.content,
                        tool_calls: completion.tool_calls,
                        model_used: model,
                        usage: completion.usage,
                        cost_usd: cost,
                        used_fallback: is_fallback,
                    });
                }
                Err(e) if e.is_transient() => {
                    warn!(model = provider.model_name(), error = %e, "model failed, trying next candidate");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::Other("no models configured".into())))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FailingProvider, ScriptedProvider};
    use crate::provider::Completion;

    fn text_completion(text: &str) -> Completion {
        Completion {
            content: text.into(),
            tool_calls: vec![],
            usage: Usage { prompt_tokens: 1000, completion_tokens: 100 },
        }
    }

    #[tokio::test]
    async fn primary_success_uses_no_fallback() {
        let mut client = LlmClient::with_providers(vec![Box::new(ScriptedProvider::new(
            "primary",
            vec![text_completion("hi")],
        ))]);
        let resp = client
            .complete_with_tools(&[Message::user("q")], &[])
            .await
            .unwrap();
        assert_eq!(resp.content, "hi");
        assert!(!resp.used_fallback);
        assert_eq!(resp.model_used, "primary");
    }

    #[tokio::test]
    async fn transient_failure_advances_to_fallback() {
        let mut client = LlmClient::with_providers(vec![
            Box::new(FailingProvider::rate_limited("primary")),
            Box::new(ScriptedProvider::new("backup", vec![text_completion("saved")])),
        ]);
        let resp = client
            .complete_with_tools(&[Message::user("q")], &[])
            .await
            .unwrap();
        assert_eq!(resp.content, "saved");
        assert!(resp.used_fallback);
        assert!(client.fallback_used);
    }

    #[tokio::test]
    async fn auth_failure_propagates_immediately() {
        let mut client = LlmClient::with_providers(vec![
            Box::new(FailingProvider::auth("primary")),
            Box::new(ScriptedProvider::new("backup", vec![text_completion("unreached")])),
        ]);
        let err = client
            .complete_with_tools(&[Message::user("q")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[tokio::test]
    async fn all_models_failing_returns_last_error() {
        let mut client = LlmClient::with_providers(vec![
            Box::new(FailingProvider::rate_limited("a")),
            Box::new(FailingProvider::unavailable("b")),
        ]);
        let err = client
            .complete_with_tools(&[Message::user("q")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn cost_accumulates_across_calls() {
        let mut client = LlmClient::with_providers(vec![Box::new(ScriptedProvider::new(
            "claude-sonnet-4",
            vec![text_completion("a"), text_completion("b")],
        ))]);
        client.complete_with_tools(&[Message::user("1")], &[]).await.unwrap();
        client.complete_with_tools(&[Message::user("2")], &[]).await.unwrap();
        // 2 × (1000 × $3 + 100 × $15) / 1M
        let expected = 2.0 * (1000.0 * 3.0 + 100.0 * 15.0) / 1_000_000.0;
        assert!((client.total_cost - expected).abs() < 1e-12, "{}", client.total_cost);
        assert_eq!(client.total_tokens, 2200);
    }

    #[test]
    fn estimate_cost_matches_model_family() {
        let usage = Usage { prompt_tokens: 1_000_000, completion_tokens: 0 };
        assert!((estimate_cost("claude-opus-4-20250514", usage) - 15.0).abs() < 1e-9);
        assert!((estimate_cost("gpt-4o-mini", usage) - 0.15).abs() < 1e-9);
        // Unknown models fall back to Sonnet pricing.
        assert!((estimate_cost("mystery-model", usage) - 3.0).abs() < 1e-9);
    }
}
