// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Uniform abstraction over local and SSH training execution.
//!
//! Both backends persist long-running commands in a named, detachable tmux
//! session so training survives orchestrator restarts and can be observed
//! with `revis watch`.  The command's exit code is written to a sentinel
//! file (`.revis_exit`) so it can be recovered even after the tmux session
//! is gone.

mod local;
mod ssh;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

pub use local::{LocalConfig, LocalExecutor};
pub use ssh::{SshConfig, SshExecutor};

/// Name of the exit-code sentinel written next to the training process.
pub const EXIT_SENTINEL: &str = ".revis_exit";

/// Poll cadence for wait/log loops.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of waiting for a launched process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub exit_code: i64,
    pub failed: bool,
    pub error_message: Option<String>,
}

impl ExitStatus {
    pub fn from_code(code: i64) -> Self {
        Self {
            exit_code: code,
            failed: code != 0,
            error_message: (code != 0).then(|| format!("Process exited with code {code}")),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            exit_code: -1,
            failed: true,
            error_message: Some("Process ended but exit code unavailable".into()),
        }
    }

    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            exit_code: -1,
            failed: true,
            error_message: Some(format!("Process timed out after {}s", timeout.as_secs())),
        }
    }
}

/// Execution backend: launch, observe, and kill training processes, move
/// files, and synchronize code.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Start `command` inside a fresh tmux session named `session_name`.
    /// An existing session of the same name is killed and recreated.
    /// Returns the session name as the process id.
    async fn launch(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        session_name: &str,
    ) -> anyhow::Result<String>;

    /// Block until the process finishes or `timeout` elapses (which kills
    /// it).  Polls at [`POLL_INTERVAL`].
    async fn wait(&self, process_id: &str, timeout: Option<Duration>) -> anyhow::Result<ExitStatus>;

    /// Idempotent session termination.
    async fn kill(&self, process_id: &str) -> anyhow::Result<()>;

    async fn is_running(&self, process_id: &str) -> anyhow::Result<bool>;

    /// Last `lines` lines of a file under the working directory; falls back
    /// to capturing the tmux pane when the file does not exist.
    async fn get_log_tail(&self, log_path: &str, lines: usize) -> anyhow::Result<String>;

    /// Push local code to the working directory.  No-op locally; filtered
    /// incremental rsync remotely (deletions are never propagated).
    async fn sync_code(&self, local_path: &Path, remote_path: &str) -> anyhow::Result<()>;

    /// Files matching `patterns` modified at or after `since`, copied into
    /// `local_dest`; returns the local paths.
    async fn collect_artifacts(
        &self,
        patterns: &[String],
        since: SystemTime,
        local_dest: &Path,
    ) -> anyhow::Result<Vec<PathBuf>>;

    async fn file_exists(&self, path: &str) -> anyhow::Result<bool>;

    async fn read_file(&self, path: &str) -> anyhow::Result<String>;

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> anyhow::Result<()>;

    /// Attempt to re-establish the transport after a fault.  Local backend
    /// always succeeds.
    async fn reconnect(&self) -> bool;

    async fn close(&self);
}

/// Build the shell line that launches `command` inside a detached tmux
/// session, exporting `env` first and recording the exit code in the
/// sentinel file.
pub(crate) fn tmux_launch_command(
    session_name: &str,
    work_dir: &str,
    env: &HashMap<String, String>,
    command: &str,
) -> String {
    let mut exports: Vec<String> = env
        .iter()
        .map(|(k, v)| format!("export {k}=\"{v}\""))
        .collect();
    exports.sort(); // deterministic ordering for tests and logs
    let mut prefix = exports.join(" && ");
    if !prefix.is_empty() {
        prefix.push_str(" && ");
    }
    format!(
        "tmux new-session -d -s {session_name} \
         'cd {work_dir} && {prefix}{command}; echo \"EXIT_CODE=$?\" >> {EXIT_SENTINEL}'"
    )
}

/// Extract the exit code from sentinel file content.
pub(crate) fn parse_exit_sentinel(content: &str) -> Option<i64> {
    let (_, rest) = content.split_once("EXIT_CODE=")?;
    rest.split_whitespace().next()?.trim().parse().ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_command_wraps_in_tmux_with_sentinel() {
        let mut env = HashMap::new();
        env.insert("REVIS_RUN_ID".to_string(), "abc".to_string());
        let cmd = tmux_launch_command("revis-s1", "/work", &env, "python train.py");
        assert!(cmd.starts_with("tmux new-session -d -s revis-s1"));
        assert!(cmd.contains("cd /work"));
        assert!(cmd.contains("export REVIS_RUN_ID=\"abc\" && python train.py"));
        assert!(cmd.contains("echo \"EXIT_CODE=$?\" >> .revis_exit"));
    }

    #[test]
    fn launch_command_without_env_has_no_exports() {
        let cmd = tmux_launch_command("s", ".", &HashMap::new(), "true");
        assert!(cmd.contains("'cd . && true;"));
        assert!(!cmd.contains("export"));
    }

    #[test]
    fn launch_command_orders_exports_deterministically() {
        let mut env = HashMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        let cmd = tmux_launch_command("s", ".", &env, "true");
        let a = cmd.find("export A=").unwrap();
        let b = cmd.find("export B=").unwrap();
        assert!(a < b);
    }

    #[test]
    fn sentinel_parse_extracts_code() {
        assert_eq!(parse_exit_sentinel("EXIT_CODE=0\n"), Some(0));
        assert_eq!(parse_exit_sentinel("EXIT_CODE=137\n"), Some(137));
        assert_eq!(parse_exit_sentinel("noise\nEXIT_CODE=2\n"), Some(2));
        assert_eq!(parse_exit_sentinel(""), None);
        assert_eq!(parse_exit_sentinel("EXIT_CODE="), None);
    }

    #[test]
    fn exit_status_constructors() {
        let ok = ExitStatus::from_code(0);
        assert!(!ok.failed);
        assert!(ok.error_message.is_none());
        let bad = ExitStatus::from_code(1);
        assert!(bad.failed);
        assert!(bad.error_message.unwrap().contains("code 1"));
        assert!(ExitStatus::unavailable().failed);
        assert!(ExitStatus::timed_out(Duration::from_secs(60))
            .error_message
            .unwrap()
            .contains("60s"));
    }
}
