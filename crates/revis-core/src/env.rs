// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

use revis_config::Config;

/// ML API credentials auto-passed to training when present in the ambient
/// environment.
pub const COMMON_ML_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "WANDB_API_KEY",
    "HF_TOKEN",
    "HUGGINGFACE_TOKEN",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "GOOGLE_APPLICATION_CREDENTIALS",
];

/// Collect environment variables for a training run.
///
/// Later layers win:
/// 1. auto-passed ML keys from the current environment
/// 2. `.env` in the project root, if present
/// 3. explicit `entry.env` from config
/// 4. `entry.env_passthrough` names from the current environment
pub fn collect_training_env(config: &Config, project_root: &Path) -> HashMap<String, String> {
    let mut env = HashMap::new();

    for key in COMMON_ML_ENV_VARS {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }

    let dotenv = project_root.join(".env");
    if dotenv.exists() {
        match std::fs::read_to_string(&dotenv) {
            Ok(content) => {
                for (key, value) in parse_dotenv(&content) {
                    env.insert(key, value);
                }
            }
            Err(e) => warn!("failed to load .env: {e}"),
        }
    }

    for (key, value) in &config.entry.env {
        env.insert(key.clone(), value.clone());
    }

    for name in &config.entry.env_passthrough {
        if let Ok(value) = std::env::var(name) {
            env.insert(name.clone(), value);
        }
    }

    env
}

/// KEY=VALUE lines; comments and blanks skipped; single/double quotes
/// stripped from values.
fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
            pairs.push((key.to_string(), value.to_string()));
        }
    }
    pairs
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        serde_yaml::from_str::<Config>(
            "executor: {}\nentry:\n  train: t\nmetrics:\n  primary: loss\n",
        )
        .unwrap()
    }

    #[test]
    fn dotenv_parsing_skips_comments_and_strips_quotes() {
        let pairs = parse_dotenv(
            "# comment\n\nFOO=bar\nQUOTED=\"with spaces\"\nSINGLE='x'\n=novalue\nBROKEN\n",
        );
        assert_eq!(
            pairs,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("QUOTED".to_string(), "with spaces".to_string()),
                ("SINGLE".to_string(), "x".to_string()),
            ]
        );
    }

    #[test]
    fn dotenv_and_config_env_layer_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "FROM_DOTENV=1\nSHARED=dotenv\n").unwrap();

        let mut config = minimal_config();
        config.entry.env.insert("SHARED".into(), "config".into());
        config.entry.env.insert("FROM_CONFIG".into(), "2".into());

        let env = collect_training_env(&config, dir.path());
        assert_eq!(env.get("FROM_DOTENV").map(String::as_str), Some("1"));
        assert_eq!(env.get("FROM_CONFIG").map(String::as_str), Some("2"));
        // Explicit config wins over .env.
        assert_eq!(env.get("SHARED").map(String::as_str), Some("config"));
    }

    #[test]
    fn passthrough_reads_ambient_environment() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = minimal_config();
        config.entry.env_passthrough = vec!["REVIS_TEST_PASSTHROUGH_VAR".into()];
        std::env::set_var("REVIS_TEST_PASSTHROUGH_VAR", "present");
        let env = collect_training_env(&config, dir.path());
        std::env::remove_var("REVIS_TEST_PASSTHROUGH_VAR");
        assert_eq!(env.get("REVIS_TEST_PASSTHROUGH_VAR").map(String::as_str), Some("present"));
    }
}
