// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    parse_exit_sentinel, tmux_launch_command, ExitStatus, Executor, EXIT_SENTINEL, POLL_INTERVAL,
};

#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub work_dir: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self { work_dir: ".".into() }
    }
}

/// Runs training on this host, persisted in a local tmux session.
pub struct LocalExecutor {
    work_dir: PathBuf,
}

impl LocalExecutor {
    pub fn new(config: LocalConfig) -> Self {
        let expanded = shellexpand::tilde(&config.work_dir).into_owned();
        let work_dir = Path::new(&expanded)
            .canonicalize()
            .unwrap_or_else(|_| PathBuf::from(expanded));
        Self { work_dir }
    }

    async fn run(&self, command: &str) -> anyhow::Result<(i64, String, String)> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.work_dir)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawning shell for: {command}"))?;
        Ok((
            output.status.code().unwrap_or(-1) as i64,
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    fn sentinel_path(&self) -> PathBuf {
        self.work_dir.join(EXIT_SENTINEL)
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn launch(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        session_name: &str,
    ) -> anyhow::Result<String> {
        let _ = std::fs::remove_file(self.sentinel_path());

        let work_dir = self.work_dir.to_string_lossy();
        let tmux_cmd = tmux_launch_command(session_name, &work_dir, env, command);
        debug!(session = session_name, "launching tmux session");

        let (code, _, stderr) = self.run(&tmux_cmd).await?;
        if code != 0 {
            // Session may already exist: kill and recreate once.
            self.run(&format!("tmux kill-session -t {session_name} 2>/dev/null"))
                .await?;
            let (code, _, stderr) = self.run(&tmux_cmd).await?;
            if code != 0 {
                anyhow::bail!("failed to create tmux session: {stderr}");
            }
        } else if !stderr.trim().is_empty() {
            debug!(stderr = %stderr.trim(), "tmux stderr");
        }

        Ok(session_name.to_string())
    }

    async fn wait(
        &self,
        process_id: &str,
        timeout: Option<Duration>,
    ) -> anyhow::Result<ExitStatus> {
        let started = Instant::now();
        loop {
            if !self.is_running(process_id).await? {
                let sentinel = self.sentinel_path();
                if sentinel.exists() {
                    let content = std::fs::read_to_string(&sentinel).unwrap_or_default();
                    let _ = std::fs::remove_file(&sentinel);
                    if let Some(code) = parse_exit_sentinel(&content) {
                        return Ok(ExitStatus::from_code(code));
                    }
                }
                return Ok(ExitStatus::unavailable());
            }

            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    self.kill(process_id).await?;
                    return Ok(ExitStatus::timed_out(limit));
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn kill(&self, process_id: &str) -> anyhow::Result<()> {
        self.run(&format!("tmux kill-session -t {process_id} 2>/dev/null"))
            .await?;
        Ok(())
    }

    async fn is_running(&self, process_id: &str) -> anyhow::Result<bool> {
        let (code, _, _) = self
            .run(&format!("tmux has-session -t {process_id} 2>/dev/null"))
            .await?;
        Ok(code == 0)
    }

    async fn get_log_tail(&self, log_path: &str, lines: usize) -> anyhow::Result<String> {
        let full_path = self.work_dir.join(log_path);
        if full_path.exists() {
            let (_, out, _) = self
                .run(&format!("tail -n {lines} {}", full_path.display()))
                .await?;
            return Ok(out);
        }
        Ok(String::new())
    }

    /// Code is already here.
    async fn sync_code(&self, _local_path: &Path, _remote_path: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn collect_artifacts(
        &self,
        patterns: &[String],
        since: SystemTime,
        local_dest: &Path,
    ) -> anyhow::Result<Vec<PathBuf>> {
        let mut collected = Vec::new();
        for pattern in patterns {
            let full_pattern = self.work_dir.join(pattern);
            let matches = glob::glob(&full_pattern.to_string_lossy())
                .with_context(|| format!("invalid artifact pattern '{pattern}'"))?;
            for entry in matches.flatten() {
                if !entry.is_file() {
                    continue;
                }
                let meta = match entry.metadata() {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                if mtime < since {
                    continue;
                }
                let rel = entry.strip_prefix(&self.work_dir).unwrap_or(&entry);
                let dest = local_dest.join(rel);
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if entry != dest {
                    if let Err(e) = std::fs::copy(&entry, &dest) {
                        warn!(src = %entry.display(), "failed to collect artifact: {e}");
                        continue;
                    }
                }
                collected.push(dest);
            }
        }
        Ok(collected)
    }

    async fn file_exists(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.work_dir.join(path).exists())
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        let full_path = self.work_dir.join(path);
        std::fs::read_to_string(&full_path).with_context(|| format!("file not found: {path}"))
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> anyhow::Result<()> {
        let src = self.work_dir.join(remote_path);
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if src != local_path {
            std::fs::copy(&src, local_path)
                .with_context(|| format!("copying {remote_path}"))?;
        }
        Ok(())
    }

    async fn reconnect(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn executor_in(dir: &Path) -> LocalExecutor {
        LocalExecutor::new(LocalConfig { work_dir: dir.to_string_lossy().into_owned() })
    }

    #[tokio::test]
    async fn read_file_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("eval.json"), "{\"metrics\":{}}").unwrap();
        let ex = executor_in(dir.path());
        assert!(ex.file_exists("eval.json").await.unwrap());
        assert!(!ex.file_exists("missing.json").await.unwrap());
        let content = ex.read_file("eval.json").await.unwrap();
        assert!(content.contains("metrics"));
        assert!(ex.read_file("missing.json").await.is_err());
    }

    #[tokio::test]
    async fn log_tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (1..=50).map(|i| format!("line {i}\n")).collect();
        std::fs::write(dir.path().join("train.log"), body).unwrap();
        let ex = executor_in(dir.path());
        let tail = ex.get_log_tail("train.log", 3).await.unwrap();
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines, vec!["line 48", "line 49", "line 50"]);
    }

    #[tokio::test]
    async fn log_tail_of_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ex = executor_in(dir.path());
        assert_eq!(ex.get_log_tail("nope.log", 10).await.unwrap(), "");
    }

    #[tokio::test]
    async fn sync_code_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let ex = executor_in(dir.path());
        ex.sync_code(Path::new("/src"), "/dst").await.unwrap();
    }

    #[tokio::test]
    async fn collect_artifacts_filters_by_mtime_and_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("plots")).unwrap();
        std::fs::write(dir.path().join("plots/a.png"), b"img").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"text").unwrap();

        let ex = executor_in(dir.path());
        let collected = ex
            .collect_artifacts(
                &["plots/*.png".to_string()],
                SystemTime::UNIX_EPOCH,
                dest.path(),
            )
            .await
            .unwrap();
        assert_eq!(collected.len(), 1);
        assert!(collected[0].ends_with("plots/a.png"));
        assert!(collected[0].exists());

        // A since-timestamp in the future filters everything out.
        let future = SystemTime::now() + Duration::from_secs(3600);
        let none = ex
            .collect_artifacts(&["plots/*.png".to_string()], future, dest.path())
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn download_file_copies_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.bin"), b"weights").unwrap();
        let ex = executor_in(dir.path());
        let target = dest.path().join("nested/model.bin");
        ex.download_file("model.bin", &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"weights");
    }

    #[tokio::test]
    async fn reconnect_and_close_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let ex = executor_in(dir.path());
        assert!(ex.reconnect().await);
        ex.close().await;
    }
}
