// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use anyhow::Context;
use tracing::debug;

/// Thin wrapper over the `git` CLI, scoped to one repository.
pub struct GitManager {
    repo_path: PathBuf,
}

impl GitManager {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self { repo_path: repo_path.into() }
    }

    async fn run(&self, args: &[&str]) -> anyhow::Result<(i64, String, String)> {
        debug!(args = ?args, "git");
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .context("spawning git")?;
        Ok((
            output.status.code().unwrap_or(-1) as i64,
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    /// Run git, failing on nonzero exit; returns trimmed stdout.
    async fn git(&self, args: &[&str]) -> anyhow::Result<String> {
        let (code, stdout, stderr) = self.run(args).await?;
        if code != 0 {
            anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(stdout.trim().to_string())
    }

    pub async fn head_sha(&self) -> anyhow::Result<String> {
        self.git(&["rev-parse", "HEAD"]).await
    }

    pub async fn current_branch(&self) -> anyhow::Result<String> {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    pub async fn branch_exists(&self, name: &str) -> bool {
        self.run(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{name}")])
            .await
            .map(|(code, _, _)| code == 0)
            .unwrap_or(false)
    }

    pub async fn create_branch(&self, name: &str) -> anyhow::Result<()> {
        self.git(&["checkout", "-b", name]).await?;
        Ok(())
    }

    pub async fn checkout(&self, name: &str) -> anyhow::Result<()> {
        self.git(&["checkout", name]).await?;
        Ok(())
    }

    /// Stage everything and commit; returns the new commit sha.
    pub async fn commit(&self, message: &str) -> anyhow::Result<String> {
        self.git(&["add", "-A"]).await?;
        self.git(&["commit", "-m", message]).await?;
        self.head_sha().await
    }

    /// Uncommitted changes against HEAD (staged and unstaged).
    pub async fn diff(&self) -> anyhow::Result<String> {
        self.git(&["diff", "HEAD"]).await
    }

    pub async fn has_uncommitted_changes(&self) -> anyhow::Result<bool> {
        Ok(!self.git(&["status", "--porcelain"]).await?.is_empty())
    }

    pub async fn stash(&self) -> anyhow::Result<()> {
        self.git(&["stash", "--include-untracked"]).await?;
        Ok(())
    }

    pub async fn push(&self, remote: &str, branch: &str) -> anyhow::Result<()> {
        self.git(&["push", "-u", remote, branch]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, name: &str) -> anyhow::Result<()> {
        self.git(&["branch", "-D", name]).await?;
        Ok(())
    }

    pub async fn remote_url(&self, remote: &str) -> anyhow::Result<String> {
        self.git(&["remote", "get-url", remote]).await
    }

    /// Whether `ancestor` is an ancestor of `descendant`.
    pub async fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        self.run(&["merge-base", "--is-ancestor", ancestor, descendant])
            .await
            .map(|(code, _, _)| code == 0)
            .unwrap_or(false)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Initialize a scratch repository with one commit.
    async fn scratch_repo() -> (tempfile::TempDir, GitManager) {
        let dir = tempfile::tempdir().unwrap();
        let git = GitManager::new(dir.path());
        git.git(&["init", "-b", "main"]).await.unwrap();
        git.git(&["config", "user.email", "revis@test"]).await.unwrap();
        git.git(&["config", "user.name", "revis"]).await.unwrap();
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        git.commit("initial").await.unwrap();
        (dir, git)
    }

    #[tokio::test]
    async fn branch_lifecycle() {
        let (_dir, git) = scratch_repo().await;
        assert_eq!(git.current_branch().await.unwrap(), "main");
        assert!(!git.branch_exists("revis/exp").await);

        git.create_branch("revis/exp").await.unwrap();
        assert!(git.branch_exists("revis/exp").await);
        assert_eq!(git.current_branch().await.unwrap(), "revis/exp");

        git.checkout("main").await.unwrap();
        git.delete_branch("revis/exp").await.unwrap();
        assert!(!git.branch_exists("revis/exp").await);
    }

    #[tokio::test]
    async fn commit_advances_head_and_diff_sees_changes() {
        let (dir, git) = scratch_repo().await;
        let before = git.head_sha().await.unwrap();

        std::fs::write(dir.path().join("config.yaml"), "lr: 0.1\n").unwrap();
        assert!(git.has_uncommitted_changes().await.unwrap());
        let after = git.commit("Revis iteration 1: lower lr").await.unwrap();
        assert_ne!(before, after);
        assert!(!git.has_uncommitted_changes().await.unwrap());
        assert!(git.is_ancestor(&before, &after).await);
    }

    #[tokio::test]
    async fn stash_clears_working_tree() {
        let (dir, git) = scratch_repo().await;
        std::fs::write(dir.path().join("junk.txt"), "partial\n").unwrap();
        assert!(git.has_uncommitted_changes().await.unwrap());
        git.stash().await.unwrap();
        assert!(!git.has_uncommitted_changes().await.unwrap());
    }
}
