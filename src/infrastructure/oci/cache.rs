//! Layer cache
//!
//! A flat directory of layer blobs keyed by digest, shared across deploys.
//! Only true image layers land here; a cached file is valid only while its
//! size matches the digest-declared size, and the prune pass deletes every
//! violation before a retry.

use anyhow::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct LayerCache {
    dir: PathBuf,
}

impl LayerCache {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self, sha256_hex: &str) -> PathBuf {
        self.dir.join(sha256_hex)
    }

    /// A hit requires the exact declared size.
    pub fn has(&self, sha256_hex: &str, size: i64) -> bool {
        self.path(sha256_hex)
            .metadata()
            .map(|m| m.len() as i64 == size)
            .unwrap_or(false)
    }

    /// Copy a cached layer to `dest`. Returns false on miss.
    pub fn fetch_into(&self, sha256_hex: &str, size: i64, dest: &Path) -> Result<bool> {
        if !self.has(sha256_hex, size) {
            return Ok(false);
        }
        std::fs::copy(self.path(sha256_hex), dest)?;
        debug!(layer = sha256_hex, "layer cache hit");
        Ok(true)
    }

    /// Store a verified layer file under its digest.
    pub fn store(&self, sha256_hex: &str, src: &Path) -> Result<()> {
        let target = self.path(sha256_hex);
        if target.exists() {
            return Ok(());
        }
        let tmp = self.dir.join(format!(".{sha256_hex}.tmp"));
        std::fs::copy(src, &tmp)?;
        std::fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Delete every cached layer whose file size differs from its declared
    /// size. Layers outside `declared` are left untouched.
    pub fn prune_mismatched(&self, declared: &HashMap<String, i64>) -> Result<Vec<String>> {
        let mut pruned = Vec::new();
        for (sha256_hex, size) in declared {
            let path = self.path(sha256_hex);
            let Ok(meta) = path.metadata() else {
                continue;
            };
            if meta.len() as i64 != *size {
                warn!(
                    layer = %sha256_hex,
                    declared = size,
                    actual = meta.len(),
                    "pruning partially-written cache entry"
                );
                std::fs::remove_file(&path)?;
                pruned.push(sha256_hex.clone());
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_requires_exact_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path()).unwrap();
        std::fs::write(cache.path("aa"), b"12345").unwrap();
        assert!(cache.has("aa", 5));
        assert!(!cache.has("aa", 6));
        assert!(!cache.has("bb", 5));
    }

    #[test]
    fn test_fetch_into_copies_on_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path()).unwrap();
        std::fs::write(cache.path("aa"), b"layer").unwrap();
        let dest = dir.path().join("out");
        assert!(cache.fetch_into("aa", 5, &dest).unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"layer");
        assert!(!cache.fetch_into("cc", 5, &dest).unwrap());
    }

    #[test]
    fn test_prune_removes_only_mismatched() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LayerCache::new(dir.path()).unwrap();
        std::fs::write(cache.path("good"), b"12345").unwrap();
        std::fs::write(cache.path("bad"), b"123").unwrap();
        std::fs::write(cache.path("unrelated"), b"x").unwrap();

        let declared =
            HashMap::from([("good".to_string(), 5i64), ("bad".to_string(), 5i64)]);
        let pruned = cache.prune_mismatched(&declared).unwrap();
        assert_eq!(pruned, vec!["bad".to_string()]);
        assert!(cache.path("good").exists());
        assert!(!cache.path("bad").exists());
        assert!(cache.path("unrelated").exists());
    }
}
