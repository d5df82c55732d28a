//! Runtime configuration for the indexing core.
//!
//! Mirrors the enumerated config surface in the external-interfaces design:
//! every field below has a documented default and can be overridden by a
//! `config.toml` at the base data directory, or by CLI flags in the binary
//! entry points.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The active file-filtering policy: either an allow-list or a deny-list of
/// extensions, never both at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionPolicy {
    Whitelist(Vec<String>),
    Blacklist(Vec<String>),
}

impl Default for ExtensionPolicy {
    fn default() -> Self {
        ExtensionPolicy::Whitelist(
            [
                "rs", "ts", "tsx", "js", "jsx", "py", "java", "cs", "cpp", "cxx", "cc", "c", "h",
                "hpp", "go", "php", "rb", "swift", "kt", "lua", "sql", "html", "htm", "css", "md",
                "json", "yaml", "yml", "toml", "sh", "bash",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }
}

impl ExtensionPolicy {
    pub fn allows(&self, extension: &str) -> bool {
        let ext = extension.to_lowercase();
        match self {
            ExtensionPolicy::Whitelist(exts) => exts.iter().any(|e| e == &ext),
            ExtensionPolicy::Blacklist(exts) => !exts.iter().any(|e| e == &ext),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Active extension filtering policy, shared by the pipeline walk and the watcher.
    pub extension_policy: ExtensionPolicy,

    /// Directory name segments that cause a subtree to be skipped, matched
    /// case-insensitively.
    pub excluded_directories: Vec<String>,

    /// C4 per-path suppression window.
    pub debounce_ms: u64,

    /// C4 max events drained per batch.
    pub batch_size: usize,

    /// C4 delete-confirmation quiet period, in seconds.
    pub delete_quiet_period_sec: u64,

    /// C4 atomic-write coalescing window.
    pub atomic_write_window_ms: u64,

    /// C2 stuck write.lock threshold, in minutes.
    pub lock_timeout_min: u64,

    /// C2 max open index contexts before LRU eviction.
    pub max_contexts: usize,

    /// C2 idle-context eviction threshold, in minutes.
    pub idle_timeout_min: u64,

    /// C2 defragmentation thresholds, as integer percentages.
    pub min_fragmentation_threshold: u32,
    pub full_defragmentation_threshold: u32,
    pub target_segment_count: usize,

    /// C5 minimum confidence for a memory hit to survive filtering.
    pub min_confidence: f64,

    /// C5 domain synonym table consulted by the memory analyzer.
    pub memory_analyzer_synonyms: HashMap<String, Vec<String>>,

    /// C3 large-file reject threshold.
    pub max_file_size_bytes: u64,

    /// C3 buffered-read vs. mmap-read boundary.
    pub mmap_threshold_bytes: u64,

    /// Base data directory, typically `<workspace>/.codesearch/`.
    pub base_data_dir: PathBuf,

    /// Optional rolling log file; when unset, only stderr is used.
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            extension_policy: ExtensionPolicy::default(),
            excluded_directories: [
                "node_modules",
                ".git",
                "bin",
                "obj",
                "dist",
                "build",
                ".vs",
                ".vscode",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            debounce_ms: 500,
            batch_size: 50,
            delete_quiet_period_sec: 5,
            atomic_write_window_ms: 100,
            lock_timeout_min: 15,
            max_contexts: 100,
            idle_timeout_min: 15,
            min_fragmentation_threshold: 20,
            full_defragmentation_threshold: 60,
            target_segment_count: 5,
            min_confidence: 0.0,
            memory_analyzer_synonyms: HashMap::new(),
            max_file_size_bytes: 10 * 1024 * 1024,
            mmap_threshold_bytes: 1024 * 1024,
            base_data_dir: PathBuf::from(".codesearch"),
            log_file: None,
        }
    }
}

impl Config {
    /// Load from `<dir>/config.toml`, falling back to defaults for any
    /// missing file or field.
    pub fn load_or_default(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&text)?;
        Ok(config)
    }

    pub fn is_excluded_dir(&self, name: &str) -> bool {
        self.excluded_directories
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(name))
    }

    pub fn project_memory_path(&self) -> PathBuf {
        self.base_data_dir.join("index").join("project-memory")
    }

    pub fn local_memory_path(&self) -> PathBuf {
        self.base_data_dir.join("index").join("local-memory")
    }

    pub fn index_root(&self) -> PathBuf {
        self.base_data_dir.join("index")
    }

    pub fn index_path(&self, hash_dir: &str) -> PathBuf {
        self.index_root().join(hash_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_whitelist_and_allows_rust() {
        let cfg = Config::default();
        assert!(cfg.extension_policy.allows("rs"));
        assert!(!cfg.extension_policy.allows("exe"));
    }

    #[test]
    fn excluded_dirs_match_case_insensitively() {
        let cfg = Config::default();
        assert!(cfg.is_excluded_dir("Node_Modules"));
        assert!(!cfg.is_excluded_dir("src"));
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.debounce_ms, 500);
    }

    #[test]
    fn partial_config_file_defaults_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "debounce_ms = 999\n").unwrap();
        let cfg = Config::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.debounce_ms, 999);
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.max_contexts, 100);
    }
}
