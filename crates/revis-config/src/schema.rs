// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so guardrails that should be enabled unless the user
/// explicitly turns them off need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub executor: ExecutorConfig,
    pub entry: EntryConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub guardrails: GuardrailsConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub coding_agent: CodingAgentConfig,
}

impl Config {
    /// Cross-field validation that serde cannot express.
    ///
    /// Called by the loader after deserialization; configuration errors are
    /// raised synchronously at command entry and are never recoverable
    /// in-loop.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.executor.kind == ExecutorKind::Ssh {
            if self.executor.host.is_none() {
                anyhow::bail!("executor.host is required when executor.type is 'ssh'");
            }
            if self.executor.user.is_none() {
                anyhow::bail!("executor.user is required when executor.type is 'ssh'");
            }
        }
        if self.entry.train.trim().is_empty() {
            anyhow::bail!("entry.train must not be empty");
        }
        if self.metrics.primary.trim().is_empty() {
            anyhow::bail!("metrics.primary must not be empty");
        }
        if self.metrics.source == MetricsSource::Wandb && self.metrics.project.is_none() {
            anyhow::bail!("metrics.project is required when metrics.source is 'wandb'");
        }
        parse_duration(&self.guardrails.max_run_duration)
            .map_err(|e| anyhow::anyhow!("guardrails.max_run_duration: {e}"))?;
        Ok(())
    }
}

/// Where training commands run: on this host or over SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Local,
    Ssh,
}

fn default_ssh_port() -> u16 {
    22
}
fn default_work_dir() -> String {
    ".".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(rename = "type", default)]
    pub kind: ExecutorKind,
    /// Remote host name.  Required when `type = ssh`.
    pub host: Option<String>,
    /// Remote user name.  Required when `type = ssh`.
    pub user: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Private key path; falls back to the SSH agent when unset.
    pub key_path: Option<String>,
    /// Working directory for training (remote path for the SSH backend).
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::Local,
            host: None,
            user: None,
            port: default_ssh_port(),
            key_path: None,
            work_dir: default_work_dir(),
        }
    }
}

/// Entry point configuration.
///
/// Revis injects `REVIS_OUTPUT_DIR` when running training; the training
/// script should write `eval.json` and artifacts there.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryConfig {
    /// The training command, e.g. `python train.py`.
    pub train: String,
    /// Optional separate eval command.
    pub eval: Option<String>,
    /// Additional env vars to set for training.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Env var names to pass through from the current environment.
    #[serde(default)]
    pub env_passthrough: Vec<String>,
}

/// Where final metrics come from after a run completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsSource {
    /// `eval.json` written into the per-run output directory.
    #[default]
    EvalJson,
    /// External experiment tracker, located via the training log.
    Wandb,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Name of the primary metric being optimized.
    pub primary: String,
    #[serde(default = "default_true")]
    pub minimize: bool,
    /// Optional early-stopping target for the primary metric.
    pub target: Option<f64>,
    #[serde(default)]
    pub source: MetricsSource,
    /// Tracker project (required for `source = wandb`).
    pub project: Option<String>,
    /// Tracker entity; defaults to the API key's default entity.
    pub entity: Option<String>,
    /// Tracker API base URL override (used by tests and self-hosted trackers).
    pub api_base: Option<String>,
}

fn default_plateau_threshold() -> f64 {
    0.01
}
fn default_plateau_runs() -> usize {
    3
}
fn default_max_run_duration() -> String {
    "24h".into()
}
fn default_retry_budget() -> i64 {
    3
}
fn default_divergence_multiplier() -> f64 {
    10.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    /// Minimum fractional improvement over the recent window before the
    /// plateau detector triggers.
    #[serde(default = "default_plateau_threshold")]
    pub plateau_threshold: f64,
    /// Size of the recent window the plateau detector inspects.
    #[serde(default = "default_plateau_runs")]
    pub plateau_runs: usize,
    /// Hard cap on a single training run, e.g. `24h`, `90m`, `30s`.
    #[serde(default = "default_max_run_duration")]
    pub max_run_duration: String,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: i64,
    #[serde(default = "default_divergence_multiplier")]
    pub divergence_multiplier: f64,
    #[serde(default = "default_true")]
    pub nan_detection_enabled: bool,
    #[serde(default = "default_true")]
    pub divergence_detection_enabled: bool,
    #[serde(default = "default_true")]
    pub plateau_detection_enabled: bool,
    #[serde(default = "default_true")]
    pub timeout_enabled: bool,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            plateau_threshold: default_plateau_threshold(),
            plateau_runs: default_plateau_runs(),
            max_run_duration: default_max_run_duration(),
            retry_budget: default_retry_budget(),
            divergence_multiplier: default_divergence_multiplier(),
            nan_detection_enabled: true,
            divergence_detection_enabled: true,
            plateau_detection_enabled: true,
            timeout_enabled: true,
        }
    }
}

fn default_history() -> usize {
    10
}
fn default_log_tail_lines() -> usize {
    200
}
fn default_max_agent_rounds() -> usize {
    20
}

/// What the model gets to see, touch, and how long it may loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Files always included in the iteration context.
    #[serde(default)]
    pub include: Vec<String>,
    /// How many prior run summaries to show the model.
    #[serde(default = "default_history")]
    pub history: usize,
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
    /// Maximum model round trips per agent invocation.
    #[serde(default = "default_max_agent_rounds")]
    pub max_agent_rounds: usize,
    /// Path patterns the model may neither read nor modify.
    #[serde(default)]
    pub deny: Vec<String>,
    /// Free-form constraints surfaced verbatim in the iteration context.
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            history: default_history(),
            log_tail_lines: default_log_tail_lines(),
            max_agent_rounds: default_max_agent_rounds(),
            deny: Vec::new(),
            constraints: Vec::new(),
        }
    }
}

fn default_model() -> String {
    "anthropic/claude-sonnet-4-20250514".into()
}
fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Primary model, optionally prefixed with a provider id
    /// (`anthropic/...`, `openai/...`).
    #[serde(default = "default_model")]
    pub model: String,
    /// API base URL override; the provider default is used when unset.
    pub api_base: Option<String>,
    /// Models tried in order when the primary fails transiently.
    #[serde(default)]
    pub fallback: Vec<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            api_base: None,
            fallback: Vec::new(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
        }
    }
}

fn default_artifacts_path() -> String {
    ".revis/artifacts".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    #[serde(default = "default_artifacts_path")]
    pub path: String,
    /// Glob patterns collected from the run output after each run.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self { path: default_artifacts_path(), patterns: Vec::new() }
    }
}

/// Out-of-band code-change handoff target.  The assistant itself is a black
/// box invoked through a shell command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodingAgentConfig {
    /// Assistant name, e.g. `claude-code` or `aider`.  Unset disables handoff.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Command template override for the chosen assistant.
    pub command: Option<String>,
}

/// Parse a human duration string (`30s`, `5m`, `2h`, `1d`) into a [`Duration`].
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        anyhow::bail!("empty duration string");
    }
    humantime::parse_duration(trimmed)
        .map_err(|e| anyhow::anyhow!("invalid duration '{trimmed}': {e}"))
}

/// The commented `revis.yaml` written by `revis init`.
pub fn default_config_template() -> &'static str {
    r#"# Revis configuration

executor:
  type: local  # 'local' (run here) or 'ssh' (sync to remote)
  work_dir: .  # Working directory for training

  # SSH settings (only needed if type: ssh)
  # host: your-gpu-server.example.com
  # user: your-username
  # port: 22
  # key_path: ~/.ssh/id_rsa

entry:
  train: "python train.py"
  # eval: "python eval.py"  # Optional separate eval command
  #
  # Environment: common ML keys (ANTHROPIC_API_KEY, OPENAI_API_KEY,
  # WANDB_API_KEY, HF_TOKEN, ...) are auto-passed from your shell.  A .env
  # file in the project root is also loaded if present.  For custom vars,
  # use env_passthrough.
  #
  # Revis sets REVIS_OUTPUT_DIR when running your script.  Write eval.json
  # and any artifacts there:
  #   output_dir = os.environ.get("REVIS_OUTPUT_DIR", "outputs/")
  #   json.dump({"metrics": {...}}, open(f"{output_dir}/eval.json", "w"))

metrics:
  primary: loss  # Name of the primary metric in eval.json
  minimize: true
  # target: 0.1  # Optional early-stopping target
  source: eval_json  # or 'wandb'
  # project: my-project  # Tracker project (wandb source only)

guardrails:
  plateau_threshold: 0.01
  plateau_runs: 3
  max_run_duration: 24h
  retry_budget: 3
  divergence_multiplier: 10.0
  nan_detection_enabled: true
  divergence_detection_enabled: true
  plateau_detection_enabled: true
  timeout_enabled: true

context:
  include:
    - configs/train.yaml
  history: 10
  log_tail_lines: 200
  max_agent_rounds: 20
  deny:
    - "*.lock"
    - "secrets/**"
  constraints:
    - "Learning rate must be between 1e-6 and 1e-2"

llm:
  model: anthropic/claude-sonnet-4-20250514
  # api_base: null  # Optional custom API endpoint
  fallback: []  # Models tried in order on transient API errors

artifacts:
  path: .revis/artifacts
  patterns: []

coding_agent:
  # type: claude-code  # Assistant used for request_code_change handoff
"#
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "executor:\n  type: local\nentry:\n  train: python train.py\nmetrics:\n  primary: loss\n"
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: Config = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.executor.kind, ExecutorKind::Local);
        assert_eq!(cfg.guardrails.plateau_runs, 3);
        assert_eq!(cfg.context.history, 10);
        assert!(cfg.metrics.minimize);
        assert_eq!(cfg.metrics.source, MetricsSource::EvalJson);
    }

    #[test]
    fn ssh_without_host_is_rejected() {
        let yaml = "executor:\n  type: ssh\n  user: alice\nentry:\n  train: t\nmetrics:\n  primary: loss\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("executor.host"), "{err}");
    }

    #[test]
    fn ssh_without_user_is_rejected() {
        let yaml = "executor:\n  type: ssh\n  host: gpu.example.com\nentry:\n  train: t\nmetrics:\n  primary: loss\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("executor.user"), "{err}");
    }

    #[test]
    fn ssh_with_host_and_user_is_accepted() {
        let yaml = "executor:\n  type: ssh\n  host: gpu\n  user: alice\nentry:\n  train: t\nmetrics:\n  primary: loss\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.executor.port, 22);
    }

    #[test]
    fn wandb_source_requires_project() {
        let yaml = "executor: {}\nentry:\n  train: t\nmetrics:\n  primary: loss\n  source: wandb\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_primary_metric_is_rejected() {
        let yaml = "executor: {}\nentry:\n  train: t\nmetrics:\n  primary: \"\"\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap().as_secs(), 30);
        assert_eq!(parse_duration("5m").unwrap().as_secs(), 300);
        assert_eq!(parse_duration("2h").unwrap().as_secs(), 7200);
        assert_eq!(parse_duration("1d").unwrap().as_secs(), 86400);
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn invalid_max_run_duration_fails_validation() {
        let yaml = "executor: {}\nentry:\n  train: t\nmetrics:\n  primary: loss\nguardrails:\n  max_run_duration: soon\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_template_is_valid_yaml_and_validates() {
        let cfg: Config = serde_yaml::from_str(default_config_template()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.metrics.primary, "loss");
        assert_eq!(cfg.entry.train, "python train.py");
        assert_eq!(cfg.context.deny, vec!["*.lock", "secrets/**"]);
    }

    #[test]
    fn env_maps_deserialize() {
        let yaml = "executor: {}\nentry:\n  train: t\n  env:\n    FOO: bar\n  env_passthrough: [CUDA_VISIBLE_DEVICES]\nmetrics:\n  primary: loss\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.entry.env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(cfg.entry.env_passthrough, vec!["CUDA_VISIBLE_DEVICES"]);
    }
}
