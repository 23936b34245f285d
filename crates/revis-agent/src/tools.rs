// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The fixed tool vocabulary the model may call.
//!
//! Every tool returns a single text string; errors are reported in-band as
//! tool output so the model can react.  `modify_config` applies its write
//! immediately — changes are greedy and are not rolled back when a later
//! tool call errors.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use revis_executor::Executor;
use revis_model::ToolSchema;

/// One recorded `modify_config` mutation.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub path: String,
    pub key: String,
    pub old_value: String,
    pub new_value: String,
}

/// A structured request for an out-of-band code change.  The tool itself
/// mutates nothing.
#[derive(Debug, Clone)]
pub struct CodeChangeRequest {
    pub suggestion: String,
    pub hypothesis: String,
    pub relevant_files: Vec<String>,
}

/// Schemas for the full tool vocabulary, in stable order.
pub fn tool_schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: "read_file".into(),
            description: "Read the contents of a file. For large files, use start_line/end_line to read specific sections.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to repo root"},
                    "start_line": {"type": "integer", "description": "First line to read (1-indexed, optional)"},
                    "end_line": {"type": "integer", "description": "Last line to read (inclusive, optional)"}
                },
                "required": ["path"]
            }),
        },
        ToolSchema {
            name: "list_directory".into(),
            description: "List files and directories at a path. Directory names carry a '/' suffix.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory path relative to repo root. Use '.' for root."},
                    "recursive": {"type": "boolean", "description": "If true, list all files recursively (default false)"}
                },
                "required": ["path"]
            }),
        },
        ToolSchema {
            name: "search_codebase".into(),
            description: "Search for a regex pattern across all files in the repo. Returns matching lines with file paths and line numbers.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Search pattern (regex)"},
                    "file_pattern": {"type": "string", "description": "Only search files matching this glob, e.g. '*.py'"}
                },
                "required": ["pattern"]
            }),
        },
        ToolSchema {
            name: "find_definition".into(),
            description: "Find where a function, class, or variable is defined in the codebase.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Name of the function, class, or variable to find"}
                },
                "required": ["name"]
            }),
        },
        ToolSchema {
            name: "get_training_logs".into(),
            description: "Get training logs from the current run. Use to understand training dynamics, debug errors, or see loss progression.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "filter": {
                        "type": "string",
                        "enum": ["all", "errors", "metrics"],
                        "description": "Filter: 'all' = raw tail, 'errors' = error/warning lines, 'metrics' = loss/accuracy lines."
                    }
                },
                "required": []
            }),
        },
        ToolSchema {
            name: "modify_config".into(),
            description: "Modify a value in a config file (YAML, JSON, or TOML). Only modifies existing keys.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Config file path relative to repo root"},
                    "key": {"type": "string", "description": "Dot-separated key path, e.g. 'training.learning_rate'"},
                    "value": {"type": "string", "description": "New value (coerced to the existing value's type)"}
                },
                "required": ["path", "key", "value"]
            }),
        },
        ToolSchema {
            name: "set_next_command".into(),
            description: "Set the CLI command for the next training run. Use to change hyperparameters passed via CLI args.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Full training command, e.g. 'python train.py --lr 1e-5'"}
                },
                "required": ["command"]
            }),
        },
        ToolSchema {
            name: "request_code_change".into(),
            description: "Request a code change that cannot be done via config modification. Hands off to a coding assistant or pauses for manual intervention.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "suggestion": {"type": "string", "description": "Detailed description of the code change needed"},
                    "hypothesis": {"type": "string", "description": "Why this change should improve metrics"},
                    "relevant_files": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Files that likely need modification"
                    }
                },
                "required": ["suggestion", "hypothesis", "relevant_files"]
            }),
        },
    ]
}

/// Process-scoped tool executor.
///
/// Holds the repo root and deny set for the whole session plus per-iteration
/// mutable state (recorded config changes, command override, code-change
/// request).  The orchestrator calls [`reset`](Self::reset) before each
/// agent invocation and [`bind_run`](Self::bind_run) once a run's log
/// location is known.
pub struct ToolExecutor {
    repo_root: PathBuf,
    deny_patterns: Vec<String>,
    executor: Option<Arc<dyn Executor>>,
    run_output_dir: Option<String>,
    pub config_changes: Vec<ConfigChange>,
    pub next_command: Option<String>,
    pub code_change_request: Option<CodeChangeRequest>,
    pub files_modified: Vec<String>,
}

impl ToolExecutor {
    pub fn new(repo_root: impl Into<PathBuf>, deny_patterns: Vec<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            deny_patterns,
            executor: None,
            run_output_dir: None,
            config_changes: Vec::new(),
            next_command: None,
            code_change_request: None,
            files_modified: Vec::new(),
        }
    }

    /// Point log access at the current run.
    pub fn bind_run(&mut self, executor: Arc<dyn Executor>, run_output_dir: impl Into<String>) {
        self.executor = Some(executor);
        self.run_output_dir = Some(run_output_dir.into());
    }

    /// Clear per-iteration change-recording state.
    pub fn reset(&mut self) {
        self.config_changes.clear();
        self.next_command = None;
        self.code_change_request = None;
        self.files_modified.clear();
    }

    /// A path is denied when any pattern matches it: as a plain glob, as a
    /// basename glob, or (for patterns containing `**`) as a permissive
    /// regex anchored at the start.
    pub fn is_denied(&self, path: &str) -> bool {
        let basename = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        for pattern in &self.deny_patterns {
            if let Ok(glob) = glob::Pattern::new(pattern) {
                if glob.matches(path) || glob.matches(&basename) {
                    return true;
                }
            }
            if pattern.contains("**") {
                let translated = pattern
                    .replace("**", "\u{1}")
                    .replace('*', "[^/]*")
                    .replace('\u{1}', ".*");
                if let Ok(re) = Regex::new(&format!("^{translated}")) {
                    if re.is_match(path) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Dispatch a tool call by name.  Unknown names do not abort the agent
    /// loop; they come back as plain text.
    pub async fn execute(&mut self, name: &str, args: &Value) -> String {
        debug!(tool = name, "executing tool");
        match name {
            "read_file" => self.read_file(args),
            "list_directory" => self.list_directory(args),
            "search_codebase" => self.search_codebase(args),
            "find_definition" => self.find_definition(args),
            "get_training_logs" => self.get_training_logs(args).await,
            "modify_config" => self.modify_config(args),
            "set_next_command" => self.set_next_command(args),
            "request_code_change" => self.request_code_change(args),
            _ => format!("Unknown tool: {name}"),
        }
    }

    fn read_file(&self, args: &Value) -> String {
        let path = match args.get("path").and_then(Value::as_str) {
            Some(p) => p,
            None => return "Error: missing required parameter 'path'".into(),
        };
        if self.is_denied(path) {
            return format!("Access denied: {path}");
        }
        let full_path = self.repo_root.join(path);
        if !full_path.exists() {
            return format!("File not found: {path}");
        }
        if !full_path.is_file() {
            return format!("Not a file: {path}");
        }
        let content = match std::fs::read_to_string(&full_path) {
            Ok(c) => c,
            Err(_) => return format!("Cannot read binary file: {path}"),
        };

        let start_line = args.get("start_line").and_then(Value::as_u64);
        let end_line = args.get("end_line").and_then(Value::as_u64);
        if start_line.is_none() && end_line.is_none() {
            return content;
        }

        let lines: Vec<&str> = content.lines().collect();
        let start = start_line.unwrap_or(1).max(1) as usize - 1;
        let end = (end_line.unwrap_or(lines.len() as u64) as usize).min(lines.len());
        if start >= end {
            return String::new();
        }
        lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{}: {line}", start + i + 1))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn list_directory(&self, args: &Value) -> String {
        let path = match args.get("path").and_then(Value::as_str) {
            Some(p) => p,
            None => return "Error: missing required parameter 'path'".into(),
        };
        let recursive = args.get("recursive").and_then(Value::as_bool).unwrap_or(false);

        let full_path = self.repo_root.join(path);
        if !full_path.exists() {
            return format!("Directory not found: {path}");
        }
        if !full_path.is_dir() {
            return format!("Not a directory: {path}");
        }

        let mut results: Vec<String> = Vec::new();
        if recursive {
            let mut entries: Vec<_> = walkdir::WalkDir::new(&full_path)
                .min_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .collect();
            entries.sort_by(|a, b| a.path().cmp(b.path()));
            for entry in entries {
                let rel = match entry.path().strip_prefix(&self.repo_root) {
                    Ok(r) => r.to_string_lossy().into_owned(),
                    Err(_) => continue,
                };
                if self.is_denied(&rel) {
                    continue;
                }
                let suffix = if entry.file_type().is_dir() { "/" } else { "" };
                results.push(format!("{rel}{suffix}"));
            }
        } else {
            let mut entries: Vec<_> = match std::fs::read_dir(&full_path) {
                Ok(rd) => rd.filter_map(|e| e.ok()).collect(),
                Err(e) => return format!("Error: {e}"),
            };
            entries.sort_by_key(|e| e.path());
            for entry in entries {
                let rel = match entry.path().strip_prefix(&self.repo_root) {
                    Ok(r) => r.to_string_lossy().into_owned(),
                    Err(_) => continue,
                };
                if self.is_denied(&rel) {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let suffix = if entry.path().is_dir() { "/" } else { "" };
                results.push(format!("{name}{suffix}"));
            }
        }

        if results.is_empty() {
            return "(empty)".into();
        }
        results.truncate(500);
        results.join("\n")
    }

    fn search_codebase(&self, args: &Value) -> String {
        let pattern = match args.get("pattern").and_then(Value::as_str) {
            Some(p) => p,
            None => return "Error: missing required parameter 'pattern'".into(),
        };
        let file_pattern = args
            .get("file_pattern")
            .and_then(Value::as_str)
            .and_then(|p| glob::Pattern::new(p).ok());

        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return format!("Invalid regex pattern: {e}"),
        };

        let mut results = Vec::new();
        'files: for entry in walkdir::WalkDir::new(&self.repo_root)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.repo_root) {
                Ok(r) => r.to_string_lossy().into_owned(),
                Err(_) => continue,
            };
            if self.is_denied(&rel) {
                continue;
            }
            if let Some(glob) = &file_pattern {
                let name = entry.file_name().to_string_lossy();
                if !glob.matches(&name) {
                    continue;
                }
            }
            let content = match std::fs::read_to_string(entry.path()) {
                Ok(c) => c,
                Err(_) => continue, // binary or unreadable
            };
            for (i, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    results.push(format!("{rel}:{}: {}", i + 1, line.trim()));
                    if results.len() >= 50 {
                        break 'files;
                    }
                }
            }
        }

        if results.is_empty() {
            "No matches found".into()
        } else {
            results.join("\n")
        }
    }

    fn find_definition(&self, args: &Value) -> String {
        let name = match args.get("name").and_then(Value::as_str) {
            Some(n) => n,
            None => return "Error: missing required parameter 'name'".into(),
        };
        let escaped = regex::escape(name);
        let anchors = [
            format!(r"^class\s+{escaped}\b"),
            format!(r"^def\s+{escaped}\b"),
            format!(r"^{escaped}\s*="),
            format!(r"^\s+def\s+{escaped}\b"),
        ];
        let combined = anchors
            .iter()
            .map(|p| format!("({p})"))
            .collect::<Vec<_>>()
            .join("|");
        self.search_codebase(&json!({"pattern": combined, "file_pattern": "*.py"}))
    }

    async fn get_training_logs(&self, args: &Value) -> String {
        let filter = args.get("filter").and_then(Value::as_str).unwrap_or("all");

        let (executor, run_output_dir) = match (&self.executor, &self.run_output_dir) {
            (Some(e), Some(d)) => (e, d),
            _ => return "Training logs not available (no active run)".into(),
        };

        let log_path = format!("{run_output_dir}/train.log");
        let raw = match executor.get_log_tail(&log_path, 500).await {
            Ok(content) => content,
            Err(e) => return format!("Error reading training logs: {e}"),
        };
        if raw.trim().is_empty() {
            return "(no training logs found)".into();
        }

        let cleaned = strip_ansi(&raw);
        let mut lines: Vec<&str> = cleaned.trim().lines().collect();

        match filter {
            "errors" => {
                const PATTERNS: &[&str] = &[
                    "error", "warning", "exception", "traceback", "failed", "oom", "nan", "cuda",
                ];
                lines.retain(|line| {
                    let lower = line.to_lowercase();
                    PATTERNS.iter().any(|p| lower.contains(p))
                });
            }
            "metrics" => {
                const PATTERNS: &[&str] = &[
                    "loss", "accuracy", "acc", "epoch", "step", "lr=", "learning_rate", "val_",
                    "train_",
                ];
                lines.retain(|line| {
                    let lower = line.to_lowercase();
                    PATTERNS.iter().any(|p| lower.contains(p))
                });
                // Even downsample so long runs still fit the window.
                if lines.len() > 50 {
                    let step = lines.len() / 50;
                    lines = lines.iter().copied().step_by(step.max(1)).collect();
                }
            }
            _ => {}
        }

        if lines.len() > 200 {
            lines = lines.split_off(lines.len() - 200);
        }

        let mut result = lines.join("\n");
        if result.len() > 30_000 {
            let mut cut = result.len() - 30_000;
            while !result.is_char_boundary(cut) {
                cut += 1;
            }
            result = result[cut..].to_string();
        }

        if result.trim().is_empty() {
            "(no matching log lines)".into()
        } else {
            result
        }
    }

    fn modify_config(&mut self, args: &Value) -> String {
        let (path, key, value) = match (
            args.get("path").and_then(Value::as_str),
            args.get("key").and_then(Value::as_str),
            args.get("value").and_then(Value::as_str),
        ) {
            (Some(p), Some(k), Some(v)) => (p, k, v),
            _ => return "Error: modify_config requires 'path', 'key', and 'value'".into(),
        };

        if self.is_denied(path) {
            return format!("Access denied: {path}");
        }
        let full_path = self.repo_root.join(path);
        if !full_path.exists() {
            return format!("Config file not found: {path}");
        }

        let suffix = full_path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let content = match std::fs::read_to_string(&full_path) {
            Ok(c) => c,
            Err(e) => return format!("Error reading config: {e}"),
        };
        let keys: Vec<&str> = key.split('.').collect();

        let outcome = match suffix.as_str() {
            "yaml" | "yml" => modify_yaml(&content, &keys, value),
            "json" => modify_json(&content, &keys, value),
            "toml" => {
                let doc: toml::Value = match content.parse() {
                    Ok(d) => d,
                    Err(e) => return format!("Error modifying config: {e}"),
                };
                let mut current = &doc;
                for k in &keys {
                    match current.get(*k) {
                        Some(next) => current = next,
                        None => return format!("Key not found: {key}"),
                    }
                }
                return "Writing TOML is not supported (read-only format)".into();
            }
            other => return format!("Unsupported config format: .{other}"),
        };

        match outcome {
            Ok((new_content, old_display, new_display)) => {
                if let Err(e) = std::fs::write(&full_path, new_content) {
                    return format!("Error writing config: {e}");
                }
                self.config_changes.push(ConfigChange {
                    path: path.to_string(),
                    key: key.to_string(),
                    old_value: old_display.clone(),
                    new_value: new_display.clone(),
                });
                self.files_modified.push(path.to_string());
                format!("Modified {path}: {key} = {old_display} -> {new_display}")
            }
            Err(message) => message,
        }
    }

    fn set_next_command(&mut self, args: &Value) -> String {
        let command = match args.get("command").and_then(Value::as_str) {
            Some(c) => c,
            None => return "Error: missing required parameter 'command'".into(),
        };
        self.next_command = Some(command.to_string());
        format!("Next training command set to: {command}")
    }

    fn request_code_change(&mut self, args: &Value) -> String {
        let suggestion = match args.get("suggestion").and_then(Value::as_str) {
            Some(s) => s.to_string(),
            None => return "Error: missing required parameter 'suggestion'".into(),
        };
        let hypothesis = args
            .get("hypothesis")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let relevant_files: Vec<String> = args
            .get("relevant_files")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let files_display = relevant_files.join(", ");
        let result = format!(
            "Code change requested. This will be handed off to a coding assistant.\n\n\
             Suggestion: {suggestion}\nHypothesis: {hypothesis}\nFiles: {files_display}"
        );
        self.code_change_request =
            Some(CodeChangeRequest { suggestion, hypothesis, relevant_files });
        result
    }
}

/// Remove terminal control sequences from captured training output.
fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b(?:[@-Z\\_^\[\]-]|\[[0-?]*[ -/]*[@-~])").unwrap()
    });
    re.replace_all(text, "").into_owned()
}

/// Coerce `input` to the scalar type of `old`.
///
/// Integers accept scientific-notation/decimal strings by truncation; bools
/// accept true/1/yes/on; lists and maps are parsed as JSON.
fn coerce_json(old: &Value, input: &str) -> Result<Value, String> {
    match old {
        Value::Bool(_) => Ok(Value::Bool(parse_bool(input))),
        Value::Number(n) if n.is_i64() || n.is_u64() => {
            parse_int(input).map(|i| json!(i))
        }
        Value::Number(_) => input
            .parse::<f64>()
            .map(|f| json!(f))
            .map_err(|_| format!("Cannot parse '{input}' as a number")),
        Value::Array(_) | Value::Object(_) => serde_json::from_str(input)
            .map_err(|e| format!("Cannot parse '{input}' as JSON: {e}")),
        _ => Ok(Value::String(input.to_string())),
    }
}

fn parse_bool(input: &str) -> bool {
    matches!(input.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn parse_int(input: &str) -> Result<i64, String> {
    if input.contains('.') || input.to_lowercase().contains('e') {
        input
            .parse::<f64>()
            .map(|f| f as i64)
            .map_err(|_| format!("Cannot parse '{input}' as an integer"))
    } else {
        input
            .parse::<i64>()
            .map_err(|_| format!("Cannot parse '{input}' as an integer"))
    }
}

fn display_json(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Apply the dotted-key mutation to YAML content.  Returns
/// `(new_content, old_display, new_display)`.
fn modify_yaml(
    content: &str,
    keys: &[&str],
    input: &str,
) -> Result<(String, String, String), String> {
    let mut doc: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| format!("Error modifying config: {e}"))?;

    let mut current = &mut doc;
    for k in keys {
        current = match current.get_mut(*k) {
            Some(next) => next,
            None => return Err(format!("Key not found: {}", keys.join("."))),
        };
    }

    // Coerce in JSON value space; both formats share scalar semantics.
    let old_json: Value =
        serde_json::to_value(&*current).map_err(|e| format!("Error modifying config: {e}"))?;
    let new_json = coerce_json(&old_json, input)?;
    let old_display = display_json(&old_json);
    let new_display = display_json(&new_json);
    *current =
        serde_yaml::to_value(&new_json).map_err(|e| format!("Error modifying config: {e}"))?;

    let new_content =
        serde_yaml::to_string(&doc).map_err(|e| format!("Error modifying config: {e}"))?;
    Ok((new_content, old_display, new_display))
}

/// Apply the dotted-key mutation to JSON content.
fn modify_json(
    content: &str,
    keys: &[&str],
    input: &str,
) -> Result<(String, String, String), String> {
    let mut doc: Value =
        serde_json::from_str(content).map_err(|e| format!("Error modifying config: {e}"))?;

    let mut current = &mut doc;
    for k in keys {
        current = match current.get_mut(*k) {
            Some(next) => next,
            None => return Err(format!("Key not found: {}", keys.join("."))),
        };
    }

    let old_json = current.clone();
    let new_json = coerce_json(&old_json, input)?;
    let old_display = display_json(&old_json);
    let new_display = display_json(&new_json);
    *current = new_json;

    let mut new_content =
        serde_json::to_string_pretty(&doc).map_err(|e| format!("Error modifying config: {e}"))?;
    new_content.push('\n');
    Ok((new_content, old_display, new_display))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn executor_in(dir: &Path, deny: &[&str]) -> ToolExecutor {
        ToolExecutor::new(dir, deny.iter().map(|s| s.to_string()).collect())
    }

    mod deny {
        use super::*;

        #[test]
        fn plain_glob_matches_whole_path() {
            let dir = tempfile::tempdir().unwrap();
            let ex = executor_in(dir.path(), &["*.lock"]);
            assert!(ex.is_denied("poetry.lock"));
            assert!(ex.is_denied("deps/cargo.lock"), "basename glob");
            assert!(!ex.is_denied("train.py"));
        }

        #[test]
        fn double_star_matches_nested_paths() {
            let dir = tempfile::tempdir().unwrap();
            let ex = executor_in(dir.path(), &["secrets/**"]);
            assert!(ex.is_denied("secrets/api.txt"));
            assert!(ex.is_denied("secrets/deep/nested/key.pem"));
            assert!(!ex.is_denied("src/secrets.py"));
        }

        #[test]
        fn denied_path_is_invisible_to_read() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("hidden.lock"), "data").unwrap();
            let mut ex = executor_in(dir.path(), &["*.lock"]);
            let out = futures_block(ex.execute("read_file", &json!({"path": "hidden.lock"})));
            assert_eq!(out, "Access denied: hidden.lock");
        }

        #[test]
        fn denied_path_refuses_writes() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("locked.yaml"), "a: 1\n").unwrap();
            let mut ex = executor_in(dir.path(), &["locked.yaml"]);
            let out = futures_block(ex.execute(
                "modify_config",
                &json!({"path": "locked.yaml", "key": "a", "value": "2"}),
            ));
            assert_eq!(out, "Access denied: locked.yaml");
            // File unchanged.
            assert_eq!(std::fs::read_to_string(dir.path().join("locked.yaml")).unwrap(), "a: 1\n");
        }
    }

    /// Tests run on the current thread; tools are async only for log access.
    fn futures_block<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    mod read_file {
        use super::*;

        #[test]
        fn full_read_and_line_slice() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("f.txt"), "alpha\nbeta\ngamma\ndelta\n").unwrap();
            let mut ex = executor_in(dir.path(), &[]);

            let full = futures_block(ex.execute("read_file", &json!({"path": "f.txt"})));
            assert_eq!(full, "alpha\nbeta\ngamma\ndelta\n");

            let sliced = futures_block(ex.execute(
                "read_file",
                &json!({"path": "f.txt", "start_line": 2, "end_line": 3}),
            ));
            assert_eq!(sliced, "2: beta\n3: gamma");
        }

        #[test]
        fn missing_file_reports_not_found() {
            let dir = tempfile::tempdir().unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute("read_file", &json!({"path": "nope.txt"})));
            assert_eq!(out, "File not found: nope.txt");
        }
    }

    mod list_directory {
        use super::*;

        #[test]
        fn directories_get_slash_suffix() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir(dir.path().join("src")).unwrap();
            std::fs::write(dir.path().join("train.py"), "").unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute("list_directory", &json!({"path": "."})));
            let entries: Vec<&str> = out.lines().collect();
            assert!(entries.contains(&"src/"));
            assert!(entries.contains(&"train.py"));
        }

        #[test]
        fn recursive_lists_nested_paths_and_respects_deny() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("src/models")).unwrap();
            std::fs::write(dir.path().join("src/models/net.py"), "").unwrap();
            std::fs::create_dir(dir.path().join("secrets")).unwrap();
            std::fs::write(dir.path().join("secrets/key.pem"), "").unwrap();
            let mut ex = executor_in(dir.path(), &["secrets/**"]);
            let out = futures_block(
                ex.execute("list_directory", &json!({"path": ".", "recursive": true})),
            );
            assert!(out.contains("src/models/net.py"));
            assert!(!out.contains("key.pem"));
        }

        #[test]
        fn missing_directory_reports_not_found() {
            let dir = tempfile::tempdir().unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute("list_directory", &json!({"path": "void"})));
            assert_eq!(out, "Directory not found: void");
        }
    }

    mod search {
        use super::*;

        #[test]
        fn matches_include_path_line_and_text() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("train.py"), "lr = 0.001\nepochs = 10\n").unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute("search_codebase", &json!({"pattern": "lr ="})));
            assert_eq!(out, "train.py:1: lr = 0.001");
        }

        #[test]
        fn file_pattern_filters_by_name() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("a.py"), "target\n").unwrap();
            std::fs::write(dir.path().join("b.txt"), "target\n").unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute(
                "search_codebase",
                &json!({"pattern": "target", "file_pattern": "*.py"}),
            ));
            assert!(out.contains("a.py"));
            assert!(!out.contains("b.txt"));
        }

        #[test]
        fn invalid_regex_is_reported() {
            let dir = tempfile::tempdir().unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute("search_codebase", &json!({"pattern": "("})));
            assert!(out.starts_with("Invalid regex pattern"));
        }

        #[test]
        fn no_matches_message() {
            let dir = tempfile::tempdir().unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out =
                futures_block(ex.execute("search_codebase", &json!({"pattern": "xyzzy123"})));
            assert_eq!(out, "No matches found");
        }

        #[test]
        fn find_definition_locates_python_symbols() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(
                dir.path().join("model.py"),
                "class Encoder:\n    def forward(self):\n        pass\n\nlearning_rate = 0.01\n",
            )
            .unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute("find_definition", &json!({"name": "Encoder"})));
            assert!(out.contains("model.py:1"), "{out}");
            let out =
                futures_block(ex.execute("find_definition", &json!({"name": "learning_rate"})));
            assert!(out.contains("model.py:5"), "{out}");
        }
    }

    mod modify_config {
        use super::*;

        #[test]
        fn yaml_round_trip_preserves_other_keys() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(
                dir.path().join("train.yaml"),
                "training:\n  learning_rate: 0.001\n  batch_size: 32\nmodel:\n  depth: 4\n",
            )
            .unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute(
                "modify_config",
                &json!({"path": "train.yaml", "key": "training.learning_rate", "value": "0.0001"}),
            ));
            assert!(out.contains("training.learning_rate"), "{out}");
            assert!(out.contains("0.0001"));

            let doc: serde_yaml::Value =
                serde_yaml::from_str(&std::fs::read_to_string(dir.path().join("train.yaml")).unwrap())
                    .unwrap();
            assert_eq!(doc["training"]["learning_rate"].as_f64(), Some(0.0001));
            assert_eq!(doc["training"]["batch_size"].as_i64(), Some(32));
            assert_eq!(doc["model"]["depth"].as_i64(), Some(4));
            assert_eq!(ex.config_changes.len(), 1);
            assert_eq!(ex.files_modified, vec!["train.yaml"]);
        }

        #[test]
        fn integer_accepts_scientific_notation_truncated() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("c.yaml"), "steps: 1000\n").unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            futures_block(ex.execute(
                "modify_config",
                &json!({"path": "c.yaml", "key": "steps", "value": "2e3"}),
            ));
            let doc: serde_yaml::Value =
                serde_yaml::from_str(&std::fs::read_to_string(dir.path().join("c.yaml")).unwrap())
                    .unwrap();
            assert_eq!(doc["steps"].as_i64(), Some(2000));
        }

        #[test]
        fn bool_coercion_accepts_yes_and_on() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("c.yaml"), "amp: false\n").unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            futures_block(ex.execute(
                "modify_config",
                &json!({"path": "c.yaml", "key": "amp", "value": "yes"}),
            ));
            let doc: serde_yaml::Value =
                serde_yaml::from_str(&std::fs::read_to_string(dir.path().join("c.yaml")).unwrap())
                    .unwrap();
            assert_eq!(doc["amp"].as_bool(), Some(true));
        }

        #[test]
        fn list_value_is_parsed_as_json() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("c.yaml"), "milestones: [10, 20]\n").unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            futures_block(ex.execute(
                "modify_config",
                &json!({"path": "c.yaml", "key": "milestones", "value": "[5, 15, 30]"}),
            ));
            let doc: serde_yaml::Value =
                serde_yaml::from_str(&std::fs::read_to_string(dir.path().join("c.yaml")).unwrap())
                    .unwrap();
            assert_eq!(doc["milestones"].as_sequence().unwrap().len(), 3);
        }

        #[test]
        fn json_config_round_trips() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(
                dir.path().join("c.json"),
                "{\n  \"optimizer\": {\n    \"lr\": 0.01\n  }\n}\n",
            )
            .unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute(
                "modify_config",
                &json!({"path": "c.json", "key": "optimizer.lr", "value": "0.005"}),
            ));
            assert!(out.starts_with("Modified c.json"), "{out}");
            let doc: Value =
                serde_json::from_str(&std::fs::read_to_string(dir.path().join("c.json")).unwrap())
                    .unwrap();
            assert_eq!(doc["optimizer"]["lr"].as_f64(), Some(0.005));
        }

        #[test]
        fn missing_key_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("c.yaml"), "a: 1\n").unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute(
                "modify_config",
                &json!({"path": "c.yaml", "key": "a.b.c", "value": "2"}),
            ));
            assert_eq!(out, "Key not found: a.b.c");
            assert!(ex.config_changes.is_empty());
        }

        #[test]
        fn toml_is_read_only() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("c.toml"), "[train]\nlr = 0.1\n").unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute(
                "modify_config",
                &json!({"path": "c.toml", "key": "train.lr", "value": "0.2"}),
            ));
            assert!(out.contains("not supported"), "{out}");
            assert!(ex.config_changes.is_empty());
        }

        #[test]
        fn unsupported_format_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("c.ini"), "[a]\nb = 1\n").unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute(
                "modify_config",
                &json!({"path": "c.ini", "key": "a.b", "value": "2"}),
            ));
            assert!(out.starts_with("Unsupported config format"));
        }
    }

    mod state_tools {
        use super::*;

        #[test]
        fn next_command_is_recorded() {
            let dir = tempfile::tempdir().unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute(
                "set_next_command",
                &json!({"command": "python train.py --lr 1e-5"}),
            ));
            assert!(out.contains("python train.py --lr 1e-5"));
            assert_eq!(ex.next_command.as_deref(), Some("python train.py --lr 1e-5"));
        }

        #[test]
        fn code_change_request_mutates_no_files() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("model.py"), "original").unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute(
                "request_code_change",
                &json!({
                    "suggestion": "add dropout",
                    "hypothesis": "reduces overfitting",
                    "relevant_files": ["model.py"]
                }),
            ));
            assert!(out.contains("add dropout"));
            let req = ex.code_change_request.as_ref().unwrap();
            assert_eq!(req.relevant_files, vec!["model.py"]);
            assert_eq!(std::fs::read_to_string(dir.path().join("model.py")).unwrap(), "original");
            assert!(ex.files_modified.is_empty());
        }

        #[test]
        fn unknown_tool_does_not_abort() {
            let dir = tempfile::tempdir().unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute("teleport", &json!({})));
            assert_eq!(out, "Unknown tool: teleport");
        }

        #[test]
        fn reset_clears_iteration_state() {
            let dir = tempfile::tempdir().unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            ex.next_command = Some("x".into());
            ex.files_modified.push("f".into());
            ex.config_changes.push(ConfigChange {
                path: "p".into(),
                key: "k".into(),
                old_value: "1".into(),
                new_value: "2".into(),
            });
            ex.code_change_request = Some(CodeChangeRequest {
                suggestion: "s".into(),
                hypothesis: "h".into(),
                relevant_files: vec![],
            });
            ex.reset();
            assert!(ex.next_command.is_none());
            assert!(ex.config_changes.is_empty());
            assert!(ex.code_change_request.is_none());
            assert!(ex.files_modified.is_empty());
        }
    }

    mod logs {
        use super::*;
        use revis_executor::{LocalConfig, LocalExecutor};

        fn bound_executor(dir: &Path) -> ToolExecutor {
            let mut ex = executor_in(dir, &[]);
            let local = LocalExecutor::new(LocalConfig {
                work_dir: dir.to_string_lossy().into_owned(),
            });
            ex.bind_run(Arc::new(local), "run1");
            ex
        }

        #[test]
        fn unbound_executor_reports_no_active_run() {
            let dir = tempfile::tempdir().unwrap();
            let mut ex = executor_in(dir.path(), &[]);
            let out = futures_block(ex.execute("get_training_logs", &json!({})));
            assert_eq!(out, "Training logs not available (no active run)");
        }

        #[test]
        fn error_filter_keeps_error_lines_and_strips_ansi() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("run1")).unwrap();
            std::fs::write(
                dir.path().join("run1/train.log"),
                "\x1b[32mepoch 1 loss=0.5\x1b[0m\nRuntimeError: CUDA out of memory\nall good\n",
            )
            .unwrap();
            let mut ex = bound_executor(dir.path());
            let out =
                futures_block(ex.execute("get_training_logs", &json!({"filter": "errors"})));
            assert!(out.contains("CUDA out of memory"));
            assert!(!out.contains("all good"));
            assert!(!out.contains("\x1b"), "ANSI escapes must be stripped");
        }

        #[test]
        fn metrics_filter_keeps_loss_lines() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("run1")).unwrap();
            std::fs::write(
                dir.path().join("run1/train.log"),
                "initializing data loader\nepoch 1 loss=0.5\nsaving checkpoint\n",
            )
            .unwrap();
            let mut ex = bound_executor(dir.path());
            let out =
                futures_block(ex.execute("get_training_logs", &json!({"filter": "metrics"})));
            assert!(out.contains("loss=0.5"));
            assert!(!out.contains("data loader"));
        }

        #[test]
        fn missing_log_reports_nothing_found() {
            let dir = tempfile::tempdir().unwrap();
            let mut ex = bound_executor(dir.path());
            let out = futures_block(ex.execute("get_training_logs", &json!({})));
            assert_eq!(out, "(no training logs found)");
        }
    }

    #[test]
    fn strip_ansi_removes_color_codes() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m plain"), "red plain");
        assert_eq!(strip_ansi("no escapes"), "no escapes");
    }

    #[test]
    fn schemas_cover_the_full_vocabulary() {
        let names: Vec<String> = tool_schemas().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "read_file",
                "list_directory",
                "search_codebase",
                "find_definition",
                "get_training_logs",
                "modify_config",
                "set_next_command",
                "request_code_change"
            ]
        );
    }
}
