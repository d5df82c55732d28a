//! Workspace/Index Registry (C1) — maps workspace roots to on-disk index
//! directories, with subsumption so a descendant workspace never gets its
//! own index under an already-indexed ancestor.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("io error persisting registry: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse registry file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("path has no canonical form: {0}")]
    InvalidPath(String),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Io(_) => ErrorKind::Recoverable,
            RegistryError::Parse(_) => ErrorKind::Critical,
            RegistryError::InvalidPath(_) => ErrorKind::Expected,
        }
    }
}

/// One mapping from an original workspace path to its index directory hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDirectory {
    pub original_path: String,
    pub hash_dir: String,
    pub created_at: i64,
    pub last_accessed: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    indexes: HashMap<String, IndexDirectory>,
}

/// Persisted workspace→index-dir registry, with an in-process TTL cache to
/// avoid re-reading the backing file on every resolve.
pub struct Registry {
    registry_path: PathBuf,
    index_root: PathBuf,
    cached: RwLock<Option<(RegistryFile, Instant)>>,
    write_lock: AsyncMutex<()>,
    cache_duration: Duration,
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn normalize(path: &Path) -> Result<String, RegistryError> {
    let canonical = path
        .canonicalize()
        .map_err(|_| RegistryError::InvalidPath(path.display().to_string()))?;
    let mut s = canonical.to_string_lossy().replace('\\', "/");
    if s.len() > 1 && s.ends_with('/') {
        s.pop();
    }
    #[cfg(windows)]
    {
        s = s.to_lowercase();
    }
    Ok(s)
}

fn short_hash(normalized_path: &str) -> String {
    let digest = Sha256::digest(normalized_path.as_bytes());
    hex::encode(&digest[..4])
}

fn is_strict_descendant(candidate: &str, ancestor: &str) -> bool {
    candidate != ancestor
        && candidate.starts_with(ancestor)
        && candidate.as_bytes().get(ancestor.len()) == Some(&b'/')
}

impl Registry {
    pub fn new(registry_path: PathBuf, index_root: PathBuf) -> Self {
        Self {
            registry_path,
            index_root,
            cached: RwLock::new(None),
            write_lock: AsyncMutex::new(()),
            cache_duration: Duration::from_secs(5),
        }
    }

    async fn read_file(&self) -> Result<RegistryFile, RegistryError> {
        {
            let guard = self.cached.read().await;
            if let Some((ref file, at)) = *guard {
                if at.elapsed() < self.cache_duration {
                    return Ok(file.clone());
                }
            }
        }
        let _permit = self.write_lock.lock().await;
        {
            let guard = self.cached.read().await;
            if let Some((ref file, at)) = *guard {
                if at.elapsed() < self.cache_duration {
                    return Ok(file.clone());
                }
            }
        }
        let file = self.load_from_disk().await?;
        *self.cached.write().await = Some((file.clone(), Instant::now()));
        Ok(file)
    }

    /// Parse failures bubble up rather than silently substituting the
    /// `.backup` copy — a corrupt registry file must be loud, not masked.
    async fn load_from_disk(&self) -> Result<RegistryFile, RegistryError> {
        if !self.registry_path.exists() {
            return Ok(RegistryFile::default());
        }
        let text = tokio::fs::read_to_string(&self.registry_path).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Write-temp → fsync → rename-over, with exponential backoff on
    /// sharing-violation style IO errors.
    async fn persist(&self, file: &RegistryFile) -> Result<(), RegistryError> {
        let _permit = self.write_lock.lock().await;
        if let Some(parent) = self.registry_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.registry_path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(file)?;

        let mut attempt = 0;
        loop {
            match Self::write_and_rename(&tmp_path, &self.registry_path, &body).await {
                Ok(()) => break,
                Err(e) if attempt < 3 => {
                    attempt += 1;
                    let backoff_ms = 100u64 * (1u64 << (attempt - 1));
                    warn!(attempt, "registry persist failed, retrying: {e}");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let backup = self.registry_path.with_extension("json.backup");
        let _ = tokio::fs::copy(&self.registry_path, &backup).await;

        *self.cached.write().await = Some((file.clone(), Instant::now()));
        Ok(())
    }

    async fn write_and_rename(
        tmp_path: &Path,
        final_path: &Path,
        body: &str,
    ) -> std::io::Result<()> {
        {
            let mut f = tokio::fs::File::create(tmp_path).await?;
            use tokio::io::AsyncWriteExt;
            f.write_all(body.as_bytes()).await?;
            f.sync_all().await?;
        }
        tokio::fs::rename(tmp_path, final_path).await
    }

    /// Canonicalizes `workspace`, consults the registry, and returns the
    /// hash directory to use, applying subsumption: a strict descendant of
    /// a registered workspace reuses the ancestor's directory; a strict
    /// ancestor of a registered workspace gets its own new, broader entry
    /// (the narrower entry is kept, never merged or deleted).
    pub async fn resolve_index_dir(&self, workspace: &Path) -> Result<String, RegistryError> {
        let normalized = normalize(workspace)?;
        let mut file = self.read_file().await?;

        if let Some(entry) = file.indexes.values().find(|e| e.original_path == normalized) {
            let hash_dir = entry.hash_dir.clone();
            self.touch(&hash_dir).await?;
            return Ok(hash_dir);
        }

        if let Some(entry) = file
            .indexes
            .values()
            .find(|e| is_strict_descendant(&normalized, &e.original_path))
        {
            debug!(path = %normalized, ancestor = %entry.original_path, "subsumed under ancestor index");
            let hash_dir = entry.hash_dir.clone();
            self.touch(&hash_dir).await?;
            return Ok(hash_dir);
        }

        let now = now_unix();
        let hash_dir = short_hash(&normalized);
        file.indexes.insert(
            hash_dir.clone(),
            IndexDirectory {
                original_path: normalized,
                hash_dir: hash_dir.clone(),
                created_at: now,
                last_accessed: now,
            },
        );
        self.persist(&file).await?;
        Ok(hash_dir)
    }

    async fn touch(&self, hash_dir: &str) -> Result<(), RegistryError> {
        let mut file = self.read_file().await?;
        if let Some(entry) = file.indexes.get_mut(hash_dir) {
            entry.last_accessed = now_unix();
        } else {
            return Ok(());
        }
        self.persist(&file).await
    }

    pub async fn original_path_of(&self, hash_dir: &str) -> Result<Option<String>, RegistryError> {
        let file = self.read_file().await?;
        Ok(file.indexes.get(hash_dir).map(|e| e.original_path.clone()))
    }

    pub async fn all_mappings(&self) -> Result<HashMap<String, IndexDirectory>, RegistryError> {
        Ok(self.read_file().await?.indexes)
    }

    /// Groups entries by `original_path` (case-insensitive), keeps the
    /// most-recently-accessed in each group, and deletes the rest from the
    /// registry and from disk. Protected (memory) entries are skipped.
    pub async fn cleanup_duplicates(&self) -> Result<usize, RegistryError> {
        let mut file = self.read_file().await?;
        let mut by_path: HashMap<String, Vec<IndexDirectory>> = HashMap::new();
        for entry in file.indexes.values() {
            if entry.hash_dir.contains("memory") {
                continue;
            }
            by_path
                .entry(entry.original_path.to_lowercase())
                .or_default()
                .push(entry.clone());
        }

        let mut removed = 0usize;
        for group in by_path.values() {
            if group.len() < 2 {
                continue;
            }
            let mut sorted = group.clone();
            sorted.sort_by_key(|e| std::cmp::Reverse(e.last_accessed));
            for stale in &sorted[1..] {
                let stale_dir = self.index_root.join(&stale.hash_dir);
                if let Err(e) = tokio::fs::remove_dir_all(&stale_dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(dir = %stale_dir.display(), "failed to remove stale index directory: {e}");
                        continue;
                    }
                }
                file.indexes.remove(&stale.hash_dir);
                removed += 1;
            }
        }

        if removed > 0 {
            self.persist(&file).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry_in(dir: &TempDir) -> Registry {
        Registry::new(dir.path().join("workspaces.json"), dir.path().join("index"))
    }

    #[tokio::test]
    async fn resolve_is_stable_for_same_path() {
        let tmp = TempDir::new().unwrap();
        let registry = registry_in(&tmp);
        let ws = tmp.path().join("repo");
        std::fs::create_dir_all(&ws).unwrap();

        let first = registry.resolve_index_dir(&ws).await.unwrap();
        let second = registry.resolve_index_dir(&ws).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn descendant_is_subsumed_by_ancestor() {
        let tmp = TempDir::new().unwrap();
        let registry = registry_in(&tmp);
        let root = tmp.path().join("repo");
        let src = root.join("src");
        std::fs::create_dir_all(&src).unwrap();

        let root_hash = registry.resolve_index_dir(&root).await.unwrap();
        let src_hash = registry.resolve_index_dir(&src).await.unwrap();
        assert_eq!(root_hash, src_hash);
    }

    #[tokio::test]
    async fn ancestor_added_after_descendant_gets_its_own_entry() {
        let tmp = TempDir::new().unwrap();
        let registry = registry_in(&tmp);
        let root = tmp.path().join("repo");
        let src = root.join("src");
        std::fs::create_dir_all(&src).unwrap();

        let src_hash = registry.resolve_index_dir(&src).await.unwrap();
        let root_hash = registry.resolve_index_dir(&root).await.unwrap();
        assert_ne!(src_hash, root_hash);

        let mappings = registry.all_mappings().await.unwrap();
        assert_eq!(mappings.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_duplicates_keeps_most_recent() {
        let tmp = TempDir::new().unwrap();
        let registry = registry_in(&tmp);
        let ws = tmp.path().join("repo");
        std::fs::create_dir_all(&ws).unwrap();

        let index_root = tmp.path().join("index");
        let stale_dir = index_root.join("aaaaaaaa");
        let kept_dir = index_root.join("bbbbbbbb");
        std::fs::create_dir_all(&stale_dir).unwrap();
        std::fs::create_dir_all(&kept_dir).unwrap();
        std::fs::write(stale_dir.join("marker"), "x").unwrap();

        let normalized = normalize(&ws).unwrap();
        let mut file = registry.read_file().await.unwrap();
        file.indexes.insert(
            "aaaaaaaa".into(),
            IndexDirectory {
                original_path: normalized.clone(),
                hash_dir: "aaaaaaaa".into(),
                created_at: 1,
                last_accessed: 1,
            },
        );
        file.indexes.insert(
            "bbbbbbbb".into(),
            IndexDirectory {
                original_path: normalized,
                hash_dir: "bbbbbbbb".into(),
                created_at: 2,
                last_accessed: 2,
            },
        );
        registry.persist(&file).await.unwrap();

        let removed = registry.cleanup_duplicates().await.unwrap();
        assert_eq!(removed, 1);
        let mappings = registry.all_mappings().await.unwrap();
        assert!(mappings.contains_key("bbbbbbbb"));
        assert!(!mappings.contains_key("aaaaaaaa"));
        assert!(!stale_dir.exists());
        assert!(kept_dir.exists());
    }

    #[tokio::test]
    async fn corrupt_registry_file_fails_loud() {
        let tmp = TempDir::new().unwrap();
        let registry = registry_in(&tmp);
        std::fs::write(tmp.path().join("workspaces.json"), "{ not json").unwrap();

        let err = registry.load_from_disk().await.unwrap_err();
        assert!(matches!(err, RegistryError::Parse(_)));
    }
}
