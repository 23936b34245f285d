// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Layout of the hidden `.revis/` directory.

use std::path::{Path, PathBuf};

pub const REVIS_DIR: &str = ".revis";
pub const DB_FILE: &str = "revis.db";
pub const STOP_SIGNAL_FILE: &str = "stop_signal";

pub fn revis_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(REVIS_DIR)
}

pub fn db_path(repo_root: &Path) -> PathBuf {
    revis_dir(repo_root).join(DB_FILE)
}

/// Sentinel whose presence requests a cooperative stop at the next
/// iteration boundary.
pub fn stop_signal_path(repo_root: &Path) -> PathBuf {
    revis_dir(repo_root).join(STOP_SIGNAL_FILE)
}

pub fn logs_dir(repo_root: &Path) -> PathBuf {
    revis_dir(repo_root).join("logs")
}

/// Orchestrator log for one session.
pub fn session_log_path(repo_root: &Path, session_name: &str) -> PathBuf {
    logs_dir(repo_root).join(format!("{session_name}.log"))
}

pub fn artifacts_dir(repo_root: &Path) -> PathBuf {
    revis_dir(repo_root).join("artifacts")
}

/// Per-run output directory, relative to the working directory so the same
/// string is valid locally and remotely.
pub fn run_output_dir(run_id: &str) -> String {
    format!("{REVIS_DIR}/runs/{run_id}")
}

/// tmux session carrying a session's training process.
pub fn training_session_name(session_id: &str) -> String {
    format!("revis-{session_id}")
}

/// tmux session carrying a backgrounded orchestrator.
pub fn background_session_name(session_name: &str) -> String {
    format!("revis-bg-{session_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stable() {
        let repo = Path::new("/repo");
        assert_eq!(db_path(repo), PathBuf::from("/repo/.revis/revis.db"));
        assert_eq!(stop_signal_path(repo), PathBuf::from("/repo/.revis/stop_signal"));
        assert_eq!(
            session_log_path(repo, "exp-1"),
            PathBuf::from("/repo/.revis/logs/exp-1.log")
        );
        assert_eq!(run_output_dir("abc123"), ".revis/runs/abc123");
        assert_eq!(training_session_name("deadbeef"), "revis-deadbeef");
        assert_eq!(background_session_name("exp-1"), "revis-bg-exp-1");
    }
}
