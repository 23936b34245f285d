// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};

/// Content-addressed artifact cache under `.revis/artifacts/`.
///
/// Files are stored as `<first-two-hex>/<remaining-hex>` of their SHA-256 so
/// identical artifacts from different runs share one copy.
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store one file; returns `(relative_cache_path, size_bytes)`.
    pub fn store(&self, source: &Path) -> anyhow::Result<(String, u64)> {
        let content = std::fs::read(source)
            .with_context(|| format!("reading artifact {}", source.display()))?;
        let digest = Sha256::digest(&content);
        let hex = format!("{digest:x}");
        let rel_path = format!("{}/{}", &hex[..2], &hex[2..]);

        let target = self.root.join(&rel_path);
        if !target.exists() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &content)
                .with_context(|| format!("writing artifact {}", target.display()))?;
        }
        Ok((rel_path, content.len() as u64))
    }

    pub fn absolute_path(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_produces_sharded_hex_path() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plot.png");
        std::fs::write(&src, b"image bytes").unwrap();

        let cache = ArtifactCache::new(dir.path().join("artifacts"));
        let (rel, size) = cache.store(&src).unwrap();
        assert_eq!(size, 11);
        let (shard, rest) = rel.split_once('/').unwrap();
        assert_eq!(shard.len(), 2);
        assert_eq!(rest.len(), 62);
        assert!(cache.absolute_path(&rel).exists());
    }

    #[test]
    fn identical_content_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"same").unwrap();
        std::fs::write(&b, b"same").unwrap();

        let cache = ArtifactCache::new(dir.path().join("artifacts"));
        let (rel_a, _) = cache.store(&a).unwrap();
        let (rel_b, _) = cache.store(&b).unwrap();
        assert_eq!(rel_a, rel_b);
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path());
        assert!(cache.store(Path::new("/nope/missing.bin")).is_err());
    }
}
