// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::schema::{default_config_template, Config};

/// The configuration file sits in the repository root, not inside `.revis/`.
pub const CONFIG_FILE: &str = "revis.yaml";

/// Resolve the effective config path: an explicit `--config` argument wins,
/// otherwise `revis.yaml` in the given repository root.
pub fn config_path(repo_root: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(p) => p.to_path_buf(),
        None => repo_root.join(CONFIG_FILE),
    }
}

/// Load and validate the configuration.
///
/// Configuration errors are terminal: the CLI reports them and exits
/// non-zero before any session state is touched.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    debug!(path = %path.display(), "loading config");
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {} (run `revis init` first?)", path.display()))?;
    let config: Config =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Write the commented default template.  Refuses to overwrite an existing
/// file so `revis init` is safe to re-run.
pub fn write_default_config(path: &Path) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    std::fs::write(path, default_config_template())
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(true)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_errors() {
        let err = load(Path::new("/tmp/revis_nonexistent_config_xyz.yaml")).unwrap_err();
        assert!(err.to_string().contains("revis init"));
    }

    #[test]
    fn load_template_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        assert!(write_default_config(&path).unwrap());
        let cfg = load(&path).unwrap();
        assert_eq!(cfg.metrics.primary, "loss");
    }

    #[test]
    fn write_default_config_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "entry:\n  train: custom\n").unwrap();
        assert!(!write_default_config(&path).unwrap());
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("custom"));
    }

    #[test]
    fn load_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "executor:\n  type: ssh\nentry:\n  train: t\nmetrics:\n  primary: loss\n").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn config_path_prefers_explicit() {
        let explicit = PathBuf::from("/etc/revis/custom.yaml");
        let p = config_path(Path::new("/repo"), Some(&explicit));
        assert_eq!(p, explicit);
        let p = config_path(Path::new("/repo"), None);
        assert_eq!(p, PathBuf::from("/repo/revis.yaml"));
    }
}
