//! Indexing Pipeline (C3) — bounded-parallel walk, filter, read, and
//! document build over a workspace tree.

use crate::config::Config;
use crate::error::{ErrorKind, ItemError, OperationReport};
use crate::index::{Document, IndexStore};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(#[from] crate::index::IndexError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Io(_) => ErrorKind::Expected,
            PipelineError::Index(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Iterative DFS over `root`, explicit stack only (never recursive), so
/// memory stays bounded regardless of tree depth.
pub fn discover_files(root: &Path, config: &Config) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        if is_under_base_data_dir(&dir, config) {
            continue;
        }
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %dir.display(), "skipping unreadable directory: {e}");
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(ft) => ft,
                Err(_) => continue,
            };

            if file_type.is_dir() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if config.is_excluded_dir(&name) {
                    continue;
                }
                stack.push(path);
                continue;
            }

            if !file_type.is_file() {
                continue;
            }

            if is_temp_file(&path) {
                continue;
            }

            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                if config.extension_policy.allows(ext) {
                    files.push(path);
                }
            }
        }
    }

    files
}

fn is_under_base_data_dir(path: &Path, config: &Config) -> bool {
    let Ok(base) = config.base_data_dir.canonicalize() else {
        return false;
    };
    path.canonicalize()
        .map(|p| p.starts_with(&base))
        .unwrap_or(false)
}

/// Editor atomic-write temp files, e.g. `foo.rs.tmp.8821482`. Shared with the
/// watcher so the same path is never classified as a temp file by one
/// subsystem and a real file by the other.
pub fn is_temp_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    match name.find(".tmp.") {
        Some(idx) => name[idx + 5..]
            .chars()
            .next()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false),
        None => false,
    }
}

/// Path-derived fields never panic: on any path-library failure they
/// degrade to empty strings rather than aborting the file.
fn safe_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .ok()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default()
}

fn safe_string(opt: Option<&std::ffi::OsStr>) -> String {
    opt.map(|s| s.to_string_lossy().to_string()).unwrap_or_default()
}

fn detect_language(extension: &str) -> String {
    match extension.to_lowercase().as_str() {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" => "javascript",
        "py" => "python",
        "java" => "java",
        "cs" => "csharp",
        "go" => "go",
        "rb" => "ruby",
        "php" => "php",
        "c" | "h" => "c",
        "cpp" | "cxx" | "cc" | "hpp" => "cpp",
        "swift" => "swift",
        "kt" => "kotlin",
        "md" => "markdown",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        other => other,
    }
    .to_string()
}

/// Reads one file into a [`Document`]. Rejects files over the configured
/// size cap; below the mmap threshold uses a buffered sequential read,
/// above it memory-maps and decodes as a stream. Malformed UTF-8 is
/// replaced, never fatal.
fn build_document(path: &Path, root: &Path, config: &Config) -> Result<Option<Document>> {
    let metadata = std::fs::metadata(path)?;
    let size = metadata.len();
    if size > config.max_file_size_bytes {
        debug!(path = %path.display(), size, "skipping oversized file");
        return Ok(None);
    }

    let content = if size <= config.mmap_threshold_bytes {
        let bytes = std::fs::read(path)?;
        String::from_utf8_lossy(&bytes).into_owned()
    } else {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        String::from_utf8_lossy(&mmap).into_owned()
    };

    let extension = safe_string(path.extension());
    let filename = safe_string(path.file_name());
    let directory = path
        .parent()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();
    let relative_path = safe_relative(path, root);
    let relative_directory = path
        .parent()
        .map(|p| safe_relative(p, root))
        .unwrap_or_default();
    let directory_name = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let last_modified = metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    Ok(Some(Document {
        id: path.to_string_lossy().to_string(),
        path: path.to_string_lossy().to_string(),
        filename,
        extension: extension.clone(),
        directory,
        relative_path,
        relative_directory,
        directory_name,
        size: size as i64,
        last_modified,
        content,
        language: detect_language(&extension),
    }))
}

/// Builds a [`Document`] for a single file, for callers (the watcher) that
/// react to one change at a time rather than walking a whole tree.
pub fn build_document_for_path(path: &Path, root: &Path, config: &Config) -> Result<Option<Document>> {
    build_document(path, root, config)
}

/// Walks `root`, processes files with bounded data-parallelism (rayon,
/// `#CPU` workers), and submits a [`Document`] per file to the index
/// store. Per-file errors are collected and never abort the walk; one
/// commit happens after the entire walk completes.
pub async fn index_workspace(
    store: &IndexStore,
    hash_dir: &str,
    root: &Path,
    config: &Config,
) -> Result<OperationReport> {
    let started = Instant::now();
    let files = discover_files(root, config);

    let documents: Arc<Mutex<Vec<Document>>> = Arc::new(Mutex::new(Vec::new()));
    let errors: Arc<Mutex<Vec<ItemError>>> = Arc::new(Mutex::new(Vec::new()));
    let mut skipped = 0usize;

    let root = root.to_path_buf();
    let config = config.clone();
    let documents_for_pool = documents.clone();
    let errors_for_pool = errors.clone();

    let skipped_count = tokio::task::spawn_blocking(move || {
        use rayon::prelude::*;
        let local_skipped = std::sync::atomic::AtomicUsize::new(0);
        files.par_iter().for_each(|path| {
            match build_document(path, &root, &config) {
                Ok(Some(doc)) => documents_for_pool.lock().unwrap().push(doc),
                Ok(None) => {
                    local_skipped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(path = %path.display(), "failed to process file: {e}");
                    errors_for_pool.lock().unwrap().push(ItemError {
                        path: path.display().to_string(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        });
        local_skipped.load(std::sync::atomic::Ordering::Relaxed)
    })
    .await
    .unwrap_or(0);
    skipped += skipped_count;

    let documents = Arc::try_unwrap(documents)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_default();
    let processed = documents.len();

    for doc in documents {
        store.index_document(hash_dir, doc).await?;
    }
    store.commit(hash_dir).await?;

    let errors = Arc::try_unwrap(errors)
        .map(|m| m.into_inner().unwrap())
        .unwrap_or_default();

    Ok(OperationReport {
        success: errors.is_empty(),
        processed,
        skipped,
        errors,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discovers_allowed_files_and_skips_excluded_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.rs"), "fn main() {}").unwrap();
        fs::create_dir_all(tmp.path().join("node_modules")).unwrap();
        fs::write(tmp.path().join("node_modules/b.rs"), "ignored").unwrap();
        fs::write(tmp.path().join("c.exe"), "binary").unwrap();

        let config = Config::default();
        let found = discover_files(tmp.path(), &config);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("a.rs"));
    }

    #[test]
    fn temp_files_are_rejected() {
        assert!(is_temp_file(Path::new("/x/foo.rs.tmp.8821482")));
        assert!(!is_temp_file(Path::new("/x/foo.rs")));
    }

    #[tokio::test]
    async fn indexes_workspace_and_commits() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), "hello world").unwrap();
        fs::write(tmp.path().join("b.txt"), "goodbye world").unwrap();

        let index_dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(
            index_dir.path().to_path_buf(),
            10,
            std::time::Duration::from_secs(900),
        );
        let config = Config::default();

        let report = index_workspace(&store, "ws1", tmp.path(), &config).await.unwrap();
        assert_eq!(report.processed, 2);

        let hits = store.search("ws1", "world", 10, None).await.unwrap();
        assert_eq!(hits.len(), 2);
    }
}
