// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{parse_exit_sentinel, tmux_launch_command, ExitStatus, Executor, EXIT_SENTINEL, POLL_INTERVAL};

/// ssh reports transport-level failures (connection refused, host
/// unreachable, auth) with this exit status; remote command failures use the
/// command's own status.
const SSH_TRANSPORT_ERROR: i64 = 255;

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_path: Option<String>,
    pub work_dir: String,
}

/// Remote executor tunneling over `ssh`/`rsync`/`scp`, with tmux persistence
/// on the remote host.
pub struct SshExecutor {
    config: SshConfig,
    /// Remote `$HOME`, resolved once for `~` expansion.
    home: Mutex<Option<String>>,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self { config, home: Mutex::new(None) }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.user, self.config.host)
    }

    fn key_args(&self) -> Vec<String> {
        match &self.config.key_path {
            Some(key) => vec!["-i".into(), shellexpand::tilde(key).into_owned()],
            None => Vec::new(),
        }
    }

    /// Run a remote command once; returns (exit_code, stdout, stderr).
    async fn exec_once(&self, command: &str) -> anyhow::Result<(i64, String, String)> {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-p")
            .arg(self.config.port.to_string());
        for arg in self.key_args() {
            cmd.arg(arg);
        }
        cmd.arg(self.destination()).arg(command);
        cmd.stdin(std::process::Stdio::null());

        let output = cmd.output().await.context("spawning ssh")?;
        Ok((
            output.status.code().unwrap_or(-1) as i64,
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    /// Run a remote command, retrying once through [`reconnect`] on a
    /// transport fault.  Remote command failures are returned as-is.
    async fn exec(&self, command: &str) -> anyhow::Result<(i64, String, String)> {
        let result = self.exec_once(command).await?;
        if result.0 != SSH_TRANSPORT_ERROR {
            return Ok(result);
        }
        warn!(host = %self.config.host, "ssh transport fault, attempting reconnect");
        if !self.reconnect().await {
            anyhow::bail!("ssh connection to {} lost: {}", self.config.host, result.2.trim());
        }
        self.exec_once(command).await
    }

    /// Expand a leading `~` against the remote `$HOME`.
    async fn expand_path(&self, path: &str) -> anyhow::Result<String> {
        if !path.starts_with('~') {
            return Ok(path.to_string());
        }
        let mut cached = self.home.lock().await;
        if cached.is_none() {
            let (code, out, _) = self.exec("echo $HOME").await?;
            if code == 0 {
                *cached = Some(out.trim().to_string());
            }
        }
        match cached.as_deref() {
            Some(home) => Ok(path.replacen('~', home, 1)),
            None => Ok(path.to_string()),
        }
    }

    async fn work_dir(&self) -> anyhow::Result<String> {
        self.expand_path(&self.config.work_dir).await
    }
}

#[async_trait]
impl Executor for SshExecutor {
    async fn launch(
        &self,
        command: &str,
        env: &HashMap<String, String>,
        session_name: &str,
    ) -> anyhow::Result<String> {
        let work_dir = self.work_dir().await?;
        self.exec(&format!("rm -f {work_dir}/{EXIT_SENTINEL}")).await?;

        let tmux_cmd = tmux_launch_command(session_name, &work_dir, env, command);
        debug!(session = session_name, host = %self.config.host, "launching remote tmux session");

        let (code, _, stderr) = self.exec(&tmux_cmd).await?;
        if code != 0 {
            self.exec(&format!("tmux kill-session -t {session_name} 2>/dev/null"))
                .await?;
            let (code, _, stderr) = self.exec(&tmux_cmd).await?;
            if code != 0 {
                anyhow::bail!("failed to create remote tmux session: {stderr}");
            }
        } else if !stderr.trim().is_empty() {
            debug!(stderr = %stderr.trim(), "remote tmux stderr");
        }

        Ok(session_name.to_string())
    }

    async fn wait(
        &self,
        process_id: &str,
        timeout: Option<Duration>,
    ) -> anyhow::Result<ExitStatus> {
        let work_dir = self.work_dir().await?;
        let sentinel = format!("{work_dir}/{EXIT_SENTINEL}");
        let started = Instant::now();

        loop {
            if !self.is_running(process_id).await? {
                let (code, content, _) = self
                    .exec(&format!("cat {sentinel} 2>/dev/null && rm -f {sentinel}"))
                    .await?;
                if code == 0 {
                    if let Some(exit_code) = parse_exit_sentinel(&content) {
                        return Ok(ExitStatus::from_code(exit_code));
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
        self.exec(&format!("tmux kill-session -t {process_id} 2>/dev/null"))
            .await?;
        Ok(())
    }

    async fn is_running(&self, process_id: &str) -> anyhow::Result<bool> {
        let (code, _, _) = self
            .exec(&format!("tmux has-session -t {process_id} 2>/dev/null"))
            .await?;
        Ok(code == 0)
    }

    async fn get_log_tail(&self, log_path: &str, lines: usize) -> anyhow::Result<String> {
        let work_dir = self.work_dir().await?;
        let (code, out, _) = self
            .exec(&format!("tail -n {lines} {work_dir}/{log_path} 2>/dev/null"))
            .await?;
        if code == 0 {
            return Ok(out);
        }
        // File not there yet: show whatever the pane has.
        let (code, out, _) = self
            .exec(&format!("tmux capture-pane -t revis -p -S -{lines} 2>/dev/null"))
            .await?;
        Ok(if code == 0 { out } else { String::new() })
    }

    /// Filtered incremental sync.  Gitignored files stay local; `.git`,
    /// `.revis`, and Python runtime caches are always excluded.  No
    /// `--delete`: data that exists only remotely must survive.
    async fn sync_code(&self, local_path: &Path, remote_path: &str) -> anyhow::Result<()> {
        let remote_path = self.expand_path(remote_path).await?;
        self.exec(&format!("mkdir -p {remote_path}")).await?;

        let mut ssh_transport = format!("ssh -o BatchMode=yes -p {}", self.config.port);
        if let Some(key) = &self.config.key_path {
            ssh_transport.push_str(&format!(" -i {}", shellexpand::tilde(key)));
        }

        let output = tokio::process::Command::new("rsync")
            .arg("-az")
            .arg("--filter=:- .gitignore")
            .arg("--exclude=.git")
            .arg("--exclude=.revis")
            .arg("--exclude=__pycache__")
            .arg("--exclude=*.pyc")
            .arg("--exclude=.venv")
            .arg("--exclude=venv")
            .arg("-e")
            .arg(&ssh_transport)
            .arg(format!("{}/", local_path.display()))
            .arg(format!("{}:{}/", self.destination(), remote_path))
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .context("spawning rsync")?;

        if !output.status.success() {
            anyhow::bail!("rsync failed: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }

    async fn collect_artifacts(
        &self,
        patterns: &[String],
        since: SystemTime,
        local_dest: &Path,
    ) -> anyhow::Result<Vec<PathBuf>> {
        let work_dir = self.work_dir().await?;
        let since_secs = since
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut collected = Vec::new();

        for pattern in patterns {
            let (code, listing, _) = self
                .exec(&format!("find {work_dir}/{pattern} -type f 2>/dev/null"))
                .await?;
            if code != 0 || listing.trim().is_empty() {
                continue;
            }

            for remote_file in listing.lines().filter(|l| !l.is_empty()) {
                let (code, mtime_raw, _) = self
                    .exec(&format!("stat -c %Y {remote_file} 2>/dev/null || stat -f %m {remote_file}"))
                    .await?;
                if code == 0 {
                    if let Ok(mtime) = mtime_raw.trim().parse::<u64>() {
                        if mtime < since_secs {
                            continue;
                        }
                    }
                }

                let rel = remote_file
                    .strip_prefix(&format!("{work_dir}/"))
                    .unwrap_or(remote_file);
                let local_file = local_dest.join(rel);
                if let Some(parent) = local_file.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if let Err(e) = self.download_raw(remote_file, &local_file).await {
                    warn!(file = remote_file, "failed to collect artifact: {e}");
                    continue;
                }
                collected.push(local_file);
            }
        }
        Ok(collected)
    }

    async fn file_exists(&self, path: &str) -> anyhow::Result<bool> {
        let work_dir = self.work_dir().await?;
        let (code, _, _) = self.exec(&format!("test -f {work_dir}/{path}")).await?;
        Ok(code == 0)
    }

    async fn read_file(&self, path: &str) -> anyhow::Result<String> {
        let work_dir = self.work_dir().await?;
        let (code, content, _) = self.exec(&format!("cat {work_dir}/{path}")).await?;
        if code != 0 {
            anyhow::bail!("remote file not found: {path}");
        }
        Ok(content)
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> anyhow::Result<()> {
        let work_dir = self.work_dir().await?;
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.download_raw(&format!("{work_dir}/{remote_path}"), local_path).await
    }

    async fn reconnect(&self) -> bool {
        matches!(self.exec_once("true").await, Ok((0, _, _)))
    }

    async fn close(&self) {
        // Nothing persistent to tear down: each operation is its own ssh
        // process.
    }
}

impl SshExecutor {
    async fn download_raw(&self, remote_abs: &str, local_path: &Path) -> anyhow::Result<()> {
        let mut cmd = tokio::process::Command::new("scp");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-P")
            .arg(self.config.port.to_string());
        for arg in self.key_args() {
            cmd.arg(arg);
        }
        cmd.arg(format!("{}:{}", self.destination(), remote_abs))
            .arg(local_path)
            .stdin(std::process::Stdio::null());
        let output = cmd.output().await.context("spawning scp")?;
        if !output.status.success() {
            anyhow::bail!("scp failed: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
