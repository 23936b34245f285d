// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod loader;
mod schema;

pub use loader::{config_path, load, write_default_config, CONFIG_FILE};
pub use schema::{
    default_config_template, parse_duration, CodingAgentConfig, Config, ContextConfig,
    EntryConfig, ExecutorConfig, ExecutorKind, GuardrailsConfig, LlmConfig, MetricsConfig,
    MetricsSource,
};
