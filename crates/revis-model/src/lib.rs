// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Thin adapter between the agent loop and language-model providers.
//!
//! A conversation (ordered role/content messages plus optional tool calls)
//! goes in; text or tool calls come out, together with token usage and the
//! dollar cost.  The [`LlmClient`] tries the configured primary model first
//! and walks the fallback list on transient API failures.

mod client;
pub mod mock;
mod openai_compat;
mod provider;
mod types;

pub use client::{estimate_cost, LlmClient, LlmResponse};
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{
    resolve_driver, Completion, DriverMeta, ModelProvider, ProviderError, DRIVERS,
};
pub use types::{Message, Role, ToolCallRequest, ToolSchema, Usage};
