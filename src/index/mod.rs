//! Index Store (C2) — per-workspace Tantivy index with writer/reader
//! lifecycle, corruption detection/repair, and defragmentation.
//!
//! Lock ordering is strictly store-lock → context-lock, never the reverse.
//! The store lock only guards the context map itself (lookup,
//! insertion, eviction); all writer/reader mutation happens under the
//! per-context lock.

pub mod error;
pub mod query;
pub mod schema;
pub mod tokenizer;

pub use error::{IndexError, Result};

use schema::{build_schema, DocumentFields, CODE_TOKENIZER};
use tokenizer::CodeTokenizer;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::schema::{OwnedValue, TantivyDocument};
use tantivy::tokenizer::TextAnalyzer;
use tantivy::{
    Directory, Index, IndexReader, IndexWriter, ReloadPolicy, Segment, SegmentId, SegmentReader,
    Term,
};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const WRITER_HEAP_SIZE: usize = 50_000_000;
const READER_STALE_AFTER: Duration = Duration::from_secs(60);
const CONTEXT_DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A whole-file document ready for indexing.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub path: String,
    pub filename: String,
    pub extension: String,
    pub directory: String,
    pub relative_path: String,
    pub relative_directory: String,
    pub directory_name: String,
    pub size: i64,
    pub last_modified: i64,
    pub content: String,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub path: String,
    pub language: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub clean: bool,
    pub missing_segments: usize,
    pub bad_segments: usize,
    pub lost_docs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RepairOptions {
    pub create_backup: bool,
    pub remove_bad_segments: bool,
    pub validate_after_repair: bool,
    pub restore_on_failure: bool,
}

#[derive(Debug, Clone)]
pub struct RepairReport {
    pub success: bool,
    pub removed_segments: usize,
    pub lost_docs: u64,
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct DefragmentOptions {
    pub create_backup: bool,
}

#[derive(Debug, Clone)]
pub struct FragmentationSnapshot {
    pub segments: usize,
    pub size_bytes: u64,
    pub fragmentation_pct: u32,
}

#[derive(Debug, Clone)]
pub struct DefragmentReport {
    pub before: FragmentationSnapshot,
    pub after: FragmentationSnapshot,
    pub action: &'static str,
    pub backup_dir: Option<PathBuf>,
}

struct IndexContext {
    dir_path: PathBuf,
    protected: bool,
    index: Index,
    fields: DocumentFields,
    reader: AsyncMutex<(IndexReader, Instant)>,
    writer: AsyncMutex<Option<IndexWriter>>,
    last_access: std::sync::Mutex<Instant>,
}

impl IndexContext {
    fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().unwrap().elapsed()
    }
}

/// Owns every open index context for a running process. One `IndexStore`
/// is shared across the registry, pipeline, watcher and memory subsystem.
pub struct IndexStore {
    base_dir: PathBuf,
    contexts: AsyncMutex<HashMap<String, Arc<IndexContext>>>,
    max_contexts: usize,
    idle_timeout: Duration,
    lock_timeout: Duration,
}

impl IndexStore {
    pub fn new(base_dir: PathBuf, max_contexts: usize, idle_timeout: Duration) -> Self {
        Self {
            base_dir,
            contexts: AsyncMutex::new(HashMap::new()),
            max_contexts,
            idle_timeout,
            lock_timeout: Duration::from_secs(60),
        }
    }

    fn dir_for(&self, hash_dir: &str) -> PathBuf {
        self.base_dir.join(hash_dir)
    }

    /// Returns the open context for `hash_dir`, opening or creating it on
    /// disk if necessary, evicting idle/LRU contexts under resource
    /// pressure, and classifying + clearing stale `write.lock` files.
    /// Whether the context is protected is derived from `hash_dir` itself
    /// (the memory subsystem's index directories are named with a
    /// `memory` segment), not from caller discretion.
    async fn context(&self, hash_dir: &str) -> Result<Arc<IndexContext>> {
        let protected = is_protected_hash_dir(hash_dir);
        let acquire = self.contexts.lock();
        let mut contexts = tokio::time::timeout(self.lock_timeout, acquire)
            .await
            .map_err(|_| IndexError::LockTimeout("store-lock", self.lock_timeout))?;

        if let Some(ctx) = contexts.get(hash_dir) {
            ctx.touch();
            return Ok(ctx.clone());
        }

        if contexts.len() >= self.max_contexts {
            if let Some(victim) = contexts
                .iter()
                .min_by_key(|(_, ctx)| ctx.idle_for())
                .map(|(k, _)| k.clone())
            {
                if let Some(ctx) = contexts.remove(&victim) {
                    info!(hash_dir = %victim, "evicting index context (max_contexts)");
                    drop(contexts);
                    dispose(ctx).await;
                    contexts = tokio::time::timeout(self.lock_timeout, self.contexts.lock())
                        .await
                        .map_err(|_| IndexError::LockTimeout("store-lock", self.lock_timeout))?;
                }
            }
        }

        let dir_path = self.dir_for(hash_dir);
        std::fs::create_dir_all(&dir_path)?;
        clear_stale_lock(&dir_path, protected, Duration::from_secs(15 * 60))?;

        let ctx = Arc::new(open_context(dir_path, protected)?);
        contexts.insert(hash_dir.to_string(), ctx.clone());
        Ok(ctx)
    }

    /// Adds or replaces (by `id`) a document, without committing. Committing
    /// is batched by the caller (pipeline walk end, or watcher batch end).
    pub async fn index_document(&self, hash_dir: &str, doc: Document) -> Result<()> {
        let ctx = self.context(hash_dir).await?;
        let mut guard = ctx.writer.lock().await;
        let writer = get_or_create_writer(&ctx, &mut guard)?;

        let mut tantivy_doc = TantivyDocument::new();
        let f = &ctx.fields;
        tantivy_doc.add_text(f.id, &doc.id);
        tantivy_doc.add_text(f.path, &doc.path);
        tantivy_doc.add_text(f.filename, &doc.filename);
        tantivy_doc.add_text(f.extension, &doc.extension);
        tantivy_doc.add_text(f.directory, &doc.directory);
        tantivy_doc.add_text(f.relative_path, &doc.relative_path);
        tantivy_doc.add_text(f.relative_directory, &doc.relative_directory);
        tantivy_doc.add_text(f.directory_name, &doc.directory_name);
        tantivy_doc.add_i64(f.size, doc.size);
        tantivy_doc.add_i64(f.last_modified, doc.last_modified);
        tantivy_doc.add_text(f.content, &doc.content);
        tantivy_doc.add_text(f.filename_text, &doc.filename);
        tantivy_doc.add_text(f.directory_text, &doc.directory_name);
        tantivy_doc.add_text(f.language, &doc.language);

        let id_term = Term::from_field_text(f.id, &doc.id);
        writer.delete_term(id_term);
        writer.add_document(tantivy_doc)?;
        Ok(())
    }

    pub async fn remove_document(&self, hash_dir: &str, id: &str) -> Result<()> {
        let ctx = self.context(hash_dir).await?;
        let mut guard = ctx.writer.lock().await;
        let writer = get_or_create_writer(&ctx, &mut guard)?;
        let term = Term::from_field_text(ctx.fields.id, id);
        writer.delete_term(term);
        Ok(())
    }

    /// Flushes pending changes and invalidates the cached reader so the
    /// next search reflects them.
    pub async fn commit(&self, hash_dir: &str) -> Result<()> {
        let ctx = self.context(hash_dir).await?;
        let mut guard = ctx.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            writer.commit()?;
        }
        let mut reader_guard = ctx.reader.lock().await;
        reader_guard.0.reload()?;
        reader_guard.1 = Instant::now();
        Ok(())
    }

    pub async fn search(
        &self,
        hash_dir: &str,
        query: &str,
        max_results: usize,
        language_filter: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        let ctx = self.context(hash_dir).await?;
        let reader = self.refreshed_reader(&ctx).await?;
        let searcher = reader.searcher();
        let parsed = query::build_document_query(query, &ctx.fields, language_filter);
        let top_docs = searcher.search(&*parsed, &TopDocs::with_limit(max_results))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc: TantivyDocument = searcher.doc(addr)?;
            hits.push(SearchHit {
                path: get_text(&doc, ctx.fields.path),
                language: get_text(&doc, ctx.fields.language),
                score,
            });
        }
        Ok(hits)
    }

    async fn refreshed_reader(&self, ctx: &IndexContext) -> Result<IndexReader> {
        let mut guard = ctx.reader.lock().await;
        if guard.1.elapsed() > READER_STALE_AFTER {
            guard.0.reload()?;
            guard.1 = Instant::now();
        }
        Ok(guard.0.clone())
    }

    /// Merges the smallest segments first so the index lands on exactly
    /// `target_segments` segments, rather than always collapsing to one —
    /// a full merge and a partial merge must behave differently.
    pub async fn force_merge(&self, hash_dir: &str, target_segments: usize) -> Result<()> {
        let ctx = self.context(hash_dir).await?;
        let mut guard = ctx.writer.lock().await;
        let writer = get_or_create_writer(&ctx, &mut guard)?;
        let mut segments = ctx.index.searchable_segments()?;
        let target = target_segments.max(1);
        if segments.len() > target {
            segments.sort_by_key(|s| s.meta().num_docs());
            let merge_count = segments.len() - target + 1;
            let to_merge: Vec<SegmentId> =
                segments[..merge_count].iter().map(|s| s.id()).collect();
            writer.merge(&to_merge).await?;
        }
        writer.commit()?;
        Ok(())
    }

    /// Walks each searchable segment's file list against the underlying
    /// directory, then actually opens the segment and reads every
    /// non-deleted stored document back out — a flipped byte inside a
    /// doc-store block leaves every file present but fails decompression,
    /// which this second pass catches where an existence check alone
    /// cannot (format-too-old/too-new surfaces upstream, as an open
    /// failure on the context itself).
    pub async fn check_integrity(&self, hash_dir: &str) -> Result<IntegrityReport> {
        let ctx = self.context(hash_dir).await?;
        let scan = scan_segments(&ctx)?;
        Ok(IntegrityReport {
            clean: scan.bad_ids.is_empty(),
            missing_segments: scan.missing_segments,
            bad_segments: scan.bad_ids.len(),
            lost_docs: scan.lost_docs,
        })
    }

    /// Repairs a corrupt index by rewriting `meta.json` to drop the bad
    /// segments, then garbage-collecting their now-orphaned files. Protected
    /// indexes never self-heal — callers must treat `IndexError::Protected`
    /// as requiring operator action.
    pub async fn repair(&self, hash_dir: &str, opts: RepairOptions) -> Result<RepairReport> {
        let ctx = self.context(hash_dir).await?;
        if ctx.protected {
            return Err(IndexError::Protected(hash_dir.to_string()));
        }

        let scan = scan_segments(&ctx)?;
        if scan.bad_ids.is_empty() {
            return Ok(RepairReport {
                success: true,
                removed_segments: 0,
                lost_docs: 0,
                backup_dir: None,
            });
        }

        let backup_dir = if opts.create_backup {
            Some(backup_directory(&ctx.dir_path)?)
        } else {
            None
        };

        let removed_segments = if opts.remove_bad_segments {
            let dir_path = ctx.dir_path.clone();
            {
                let mut contexts = self.contexts.lock().await;
                if let Some(stale) = contexts.remove(hash_dir) {
                    drop(contexts);
                    dispose(stale).await;
                }
            }
            remove_segments_from_meta(&dir_path, &scan.bad_ids)?;

            let fresh = self.context(hash_dir).await?;
            let mut guard = fresh.writer.lock().await;
            let writer = get_or_create_writer(&fresh, &mut guard)?;
            writer.garbage_collect_files().await?;
            scan.bad_ids.len()
        } else {
            0
        };

        let mut success = removed_segments == scan.bad_ids.len();
        if opts.validate_after_repair {
            let revalidated = self.check_integrity(hash_dir).await?;
            success = success && revalidated.clean;
            if !success && opts.restore_on_failure {
                if let Some(ref backup) = backup_dir {
                    restore_from_backup(backup, &ctx.dir_path)?;
                    let mut contexts = self.contexts.lock().await;
                    if let Some(stale) = contexts.remove(hash_dir) {
                        drop(contexts);
                        dispose(stale).await;
                    }
                    success = true;
                }
            }
        }

        Ok(RepairReport {
            success,
            removed_segments,
            lost_docs: scan.lost_docs,
            backup_dir,
        })
    }

    /// `frag% = max(min(100, (segments-1)*10), deleted/(docs+deleted)*100)`.
    async fn fragmentation(&self, ctx: &Arc<IndexContext>) -> Result<FragmentationSnapshot> {
        let segment_metas = ctx.index.searchable_segment_metas()?;
        let segments = segment_metas.len();
        let deleted: u32 = segment_metas.iter().map(|m| m.num_deleted_docs()).sum();
        let docs: u32 = segment_metas.iter().map(|m| m.num_docs()).sum();
        let size_bytes = dir_size(&ctx.dir_path);

        let by_segments = ((segments.saturating_sub(1)) * 10).min(100) as u32;
        let by_deletes = if docs + deleted > 0 {
            (deleted as u64 * 100 / (docs + deleted) as u64) as u32
        } else {
            0
        };
        Ok(FragmentationSnapshot {
            segments,
            size_bytes,
            fragmentation_pct: by_segments.max(by_deletes),
        })
    }

    pub async fn defragment(
        &self,
        hash_dir: &str,
        opts: DefragmentOptions,
        min_threshold: u32,
        full_threshold: u32,
        target_segment_count: usize,
    ) -> Result<DefragmentReport> {
        let ctx = self.context(hash_dir).await?;
        let before = self.fragmentation(&ctx).await?;

        if before.fragmentation_pct < min_threshold {
            return Ok(DefragmentReport {
                after: before.clone(),
                before,
                action: "skipped",
                backup_dir: None,
            });
        }

        let backup_dir = if opts.create_backup {
            Some(backup_directory(&ctx.dir_path)?)
        } else {
            None
        };

        let action = if before.fragmentation_pct >= full_threshold {
            self.force_merge(hash_dir, 1).await?;
            "full_merge"
        } else {
            self.force_merge(hash_dir, target_segment_count.max(2)).await?;
            "partial_merge"
        };

        let after = self.fragmentation(&ctx).await?;
        Ok(DefragmentReport {
            before,
            after,
            action,
            backup_dir,
        })
    }

    /// Evicts contexts idle longer than the configured timeout. Intended to
    /// be called periodically by the owning process.
    pub async fn evict_idle(&self) -> usize {
        let mut contexts = self.contexts.lock().await;
        let idle: Vec<String> = contexts
            .iter()
            .filter(|(_, ctx)| ctx.idle_for() > self.idle_timeout)
            .map(|(k, _)| k.clone())
            .collect();
        let mut evicted = 0;
        for key in idle {
            if let Some(ctx) = contexts.remove(&key) {
                drop(contexts);
                dispose(ctx).await;
                evicted += 1;
                contexts = self.contexts.lock().await;
            }
        }
        evicted
    }
}

async fn dispose(ctx: Arc<IndexContext>) {
    let result = tokio::time::timeout(CONTEXT_DISPOSE_TIMEOUT, async {
        let mut guard = ctx.writer.lock().await;
        if let Some(writer) = guard.take() {
            if let Err(e) = writer.commit() {
                warn!("commit during dispose failed: {e}");
            }
        }
    })
    .await;
    if result.is_err() {
        error!("context dispose timed out; dropping without final commit");
    }
}

struct SegmentScan {
    bad_ids: Vec<SegmentId>,
    missing_segments: usize,
    lost_docs: u64,
}

fn scan_segments(ctx: &IndexContext) -> Result<SegmentScan> {
    let segments = ctx.index.searchable_segments()?;
    let directory = ctx.index.directory();

    let mut bad_ids = Vec::new();
    let mut missing_segments = 0usize;
    let mut lost_docs = 0u64;

    for segment in &segments {
        let meta = segment.meta();
        let mut files_present = true;
        for file in meta.list_files() {
            match directory.exists(&file) {
                Ok(true) => {}
                _ => files_present = false,
            }
        }
        if !files_present {
            missing_segments += 1;
            bad_ids.push(segment.id());
            lost_docs += meta.num_docs() as u64;
            continue;
        }
        if segment_content_is_corrupt(segment) {
            bad_ids.push(segment.id());
            lost_docs += meta.num_docs() as u64;
        }
    }

    Ok(SegmentScan {
        bad_ids,
        missing_segments,
        lost_docs,
    })
}

/// Opens the segment and reads every non-deleted stored document back out,
/// so a corrupt compressed block surfaces as a decode error here even
/// though every file the segment lists on disk is present.
fn segment_content_is_corrupt(segment: &Segment) -> bool {
    let reader = match SegmentReader::open(segment) {
        Ok(r) => r,
        Err(_) => return true,
    };
    let store = match reader.get_store_reader(10) {
        Ok(s) => s,
        Err(_) => return true,
    };
    for doc_id in 0..reader.max_doc() {
        if reader.is_deleted(doc_id) {
            continue;
        }
        if store.get::<TantivyDocument>(doc_id).is_err() {
            return true;
        }
    }
    false
}

/// Rewrites `meta.json` to drop the listed segments, so a subsequent
/// garbage-collection pass can reclaim their files. Tantivy's own
/// `IndexWriter` API has no public "drop this unreadable segment" call —
/// merge only operates on segments it can already read.
fn remove_segments_from_meta(dir_path: &Path, bad_ids: &[SegmentId]) -> Result<()> {
    let meta_path = dir_path.join("meta.json");
    let text = std::fs::read_to_string(&meta_path)?;
    let mut value: serde_json::Value = serde_json::from_str(&text)?;
    let bad: Vec<String> = bad_ids.iter().map(|id| id.uuid_string()).collect();

    if let Some(segments) = value.get_mut("segments").and_then(|s| s.as_array_mut()) {
        segments.retain(|seg| {
            seg.get("segment_id")
                .and_then(|id| id.as_str())
                .map(|id| !bad.iter().any(|b| b == id))
                .unwrap_or(true)
        });
    }

    let body = serde_json::to_string_pretty(&value)?;
    std::fs::write(&meta_path, body)?;
    Ok(())
}

fn get_or_create_writer<'a>(
    ctx: &IndexContext,
    guard: &'a mut Option<IndexWriter>,
) -> Result<&'a mut IndexWriter> {
    if guard.is_none() {
        *guard = Some(ctx.index.writer(WRITER_HEAP_SIZE)?);
    }
    Ok(guard.as_mut().unwrap())
}

fn open_context(dir_path: PathBuf, protected: bool) -> Result<IndexContext> {
    let directory =
        MmapDirectory::open(&dir_path).map_err(tantivy::TantivyError::from)?;
    let (schema, fields) = build_schema();
    let index = Index::open_or_create(directory, schema)?;

    let tokenizer = CodeTokenizer::with_default_patterns();
    index
        .tokenizers()
        .register(CODE_TOKENIZER, TextAnalyzer::builder(tokenizer).build());

    let reader = index
        .reader_builder()
        .reload_policy(ReloadPolicy::Manual)
        .try_into()?;

    Ok(IndexContext {
        dir_path,
        protected,
        index,
        fields,
        reader: AsyncMutex::new((reader, Instant::now())),
        writer: AsyncMutex::new(None),
        last_access: std::sync::Mutex::new(Instant::now()),
    })
}

/// Memory-subsystem index directories carry a `memory` segment in their
/// name; routing one through this store refuses any destructive operation
/// rather than relying on every call site remembering to opt in.
fn is_protected_hash_dir(hash_dir: &str) -> bool {
    hash_dir.contains("memory")
}

/// Stuck/orphaned `write.lock` handling. Any file under the index
/// directory with a `.lock` extension older than `timeout` is treated as
/// stuck; on a protected index we refuse to touch it.
fn clear_stale_lock(dir_path: &Path, protected: bool, timeout: Duration) -> Result<()> {
    let Ok(entries) = std::fs::read_dir(dir_path) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("lock") {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let Some(age) = meta.modified().ok().and_then(|m| m.elapsed().ok()) else {
            continue;
        };
        if age < Duration::from_secs(60) {
            continue;
        }
        if protected {
            return Err(IndexError::Protected(dir_path.display().to_string()));
        }
        if age > timeout {
            debug!(path = %path.display(), "clearing stuck write lock");
        } else {
            debug!(path = %path.display(), "clearing orphaned write lock");
        }
        let _ = std::fs::remove_file(&path);
    }
    Ok(())
}

fn backup_directory(dir_path: &Path) -> Result<PathBuf> {
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let backup = dir_path.with_file_name(format!(
        "{}.backup-{}",
        dir_path.file_name().and_then(|s| s.to_str()).unwrap_or("index"),
        stamp
    ));
    copy_dir(dir_path, &backup)?;
    Ok(backup)
}

fn restore_from_backup(backup: &Path, dest: &Path) -> Result<()> {
    std::fs::remove_dir_all(dest)?;
    copy_dir(backup, dest)
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            entry
                .metadata()
                .map(|m| if m.is_dir() { dir_size(&entry.path()) } else { m.len() })
                .unwrap_or(0)
        })
        .sum()
}

fn get_text(doc: &TantivyDocument, field: tantivy::schema::Field) -> String {
    doc.get_first(field)
        .and_then(|v| match v {
            OwnedValue::Str(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc(id: &str, content: &str) -> Document {
        Document {
            id: id.to_string(),
            path: id.to_string(),
            filename: id.to_string(),
            extension: "txt".to_string(),
            directory: "/".to_string(),
            relative_path: id.to_string(),
            relative_directory: String::new(),
            directory_name: String::new(),
            size: content.len() as i64,
            last_modified: 0,
            content: content.to_string(),
            language: "text".to_string(),
        }
    }

    #[tokio::test]
    async fn index_then_search_finds_document() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::new(tmp.path().to_path_buf(), 10, Duration::from_secs(900));

        store
            .index_document("ws1", sample_doc("/a.txt", "hello world"))
            .await
            .unwrap();
        store
            .index_document("ws1", sample_doc("/b.md", "goodbye world"))
            .await
            .unwrap();
        store.commit("ws1").await.unwrap();

        let hits = store.search("ws1", "world", 10, None).await.unwrap();
        assert_eq!(hits.len(), 2);

        let hits = store.search("ws1", "hello", 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "/a.txt");
    }

    #[tokio::test]
    async fn remove_document_drops_it_from_results() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::new(tmp.path().to_path_buf(), 10, Duration::from_secs(900));

        store
            .index_document("ws1", sample_doc("/a.txt", "hello world"))
            .await
            .unwrap();
        store.commit("ws1").await.unwrap();
        assert_eq!(store.search("ws1", "hello", 10, None).await.unwrap().len(), 1);

        store.remove_document("ws1", "/a.txt").await.unwrap();
        store.commit("ws1").await.unwrap();
        assert_eq!(store.search("ws1", "hello", 10, None).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn match_all_query_returns_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::new(tmp.path().to_path_buf(), 10, Duration::from_secs(900));
        store.index_document("ws1", sample_doc("/a.txt", "alpha")).await.unwrap();
        store.index_document("ws1", sample_doc("/b.txt", "beta")).await.unwrap();
        store.commit("ws1").await.unwrap();

        let hits = store.search("ws1", "*", 10, None).await.unwrap();
        assert_eq!(hits.len(), 2);
    }

    fn flip_a_byte_in_store_file(ws_dir: &Path) -> PathBuf {
        let store_file = std::fs::read_dir(ws_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().and_then(|e| e.to_str()) == Some("store"))
            .expect("segment store file");
        let mut bytes = std::fs::read(&store_file).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&store_file, bytes).unwrap();
        store_file
    }

    #[tokio::test]
    async fn corrupt_segment_is_detected_by_integrity_check() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::new(tmp.path().to_path_buf(), 10, Duration::from_secs(900));
        store.index_document("ws1", sample_doc("/a.txt", "hello world")).await.unwrap();
        store.commit("ws1").await.unwrap();

        flip_a_byte_in_store_file(&tmp.path().join("ws1"));

        let report = store.check_integrity("ws1").await.unwrap();
        assert!(!report.clean);
        assert_eq!(report.lost_docs, 1);
    }

    #[tokio::test]
    async fn repair_removes_corrupt_segment_and_reports_lost_docs() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::new(tmp.path().to_path_buf(), 10, Duration::from_secs(900));
        store.index_document("ws1", sample_doc("/a.txt", "hello world")).await.unwrap();
        store.commit("ws1").await.unwrap();

        flip_a_byte_in_store_file(&tmp.path().join("ws1"));

        let outcome = store
            .repair(
                "ws1",
                RepairOptions {
                    create_backup: false,
                    remove_bad_segments: true,
                    validate_after_repair: true,
                    restore_on_failure: false,
                },
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.removed_segments, 1);
        assert_eq!(outcome.lost_docs, 1);

        let report = store.check_integrity("ws1").await.unwrap();
        assert!(report.clean);
    }

    #[tokio::test]
    async fn defragment_partial_merge_leaves_target_segment_count() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::new(tmp.path().to_path_buf(), 10, Duration::from_secs(900));
        for i in 0..6 {
            store
                .index_document("ws1", sample_doc(&format!("/f{i}.txt"), "content"))
                .await
                .unwrap();
            store.commit("ws1").await.unwrap();
        }

        let report = store
            .defragment("ws1", DefragmentOptions { create_backup: false }, 0, 1000, 3)
            .await
            .unwrap();
        assert_eq!(report.action, "partial_merge");
        assert_eq!(report.after.segments, 3);
    }
}
