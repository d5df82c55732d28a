//! Memory Subsystem (C5) — a typed document store layered on the same
//! Tantivy substrate as the code index, split into a project-scoped index
//! (meant to be version-controlled with the code) and a local-scoped index
//! (developer-private). Both index directories are protected: nothing in
//! this module ever calls a destructive operation against them.

use crate::config::Config;
use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::Query;
use tantivy::schema::{
    Field, IndexRecordOption, OwnedValue, Schema, TantivyDocument, TextFieldIndexing, TextOptions,
    FAST, STORED, STRING,
};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("refused destructive operation on protected index: {0}")]
    Protected(String),
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::Io(_) => ErrorKind::Recoverable,
            MemoryError::Tantivy(_) => ErrorKind::Critical,
            MemoryError::Json(_) => ErrorKind::Expected,
            MemoryError::Protected(_) => ErrorKind::Critical,
        }
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    Project,
    Local,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Scope::Project => "project",
            Scope::Local => "local",
        }
    }
}

/// `ArchitecturalDecision`, `CodePattern`, `SecurityRule` and
/// `ProjectInsight` go to the project index; everything else is local.
fn scope_for_type(memory_type: &str) -> Scope {
    match memory_type {
        "ArchitecturalDecision" | "CodePattern" | "SecurityRule" | "ProjectInsight" => {
            Scope::Project
        }
        _ => Scope::Local,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub memory_type: String,
    pub content: String,
    pub scope: Scope,
    pub keywords: Vec<String>,
    pub files_involved: Vec<String>,
    pub timestamp: i64,
    pub session_id: String,
    pub confidence: f64,
    pub category: Option<String>,
    pub reasoning: Option<String>,
    pub tags: Vec<String>,
}

/// Fields required to store a new entry; `id`, `scope`, `timestamp` and
/// `session_id` are stamped by [`MemoryStore::store_memory`].
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub memory_type: String,
    pub content: String,
    pub keywords: Vec<String>,
    pub files_involved: Vec<String>,
    pub confidence: f64,
    pub category: Option<String>,
    pub reasoning: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub entry: MemoryEntry,
    pub score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySearchResult {
    pub hits: Vec<MemoryHit>,
    pub suggested_queries: Vec<String>,
}

struct MemoryFields {
    id: Field,
    memory_type: Field,
    scope: Field,
    search_text: Field,
    timestamp: Field,
    confidence: Field,
    raw_json: Field,
}

fn build_memory_schema() -> (Schema, MemoryFields) {
    let mut builder = Schema::builder();
    let id = builder.add_text_field("id", STRING | STORED);
    let memory_type = builder.add_text_field("memory_type", STRING | STORED);
    let scope = builder.add_text_field("scope", STRING | STORED);

    let text_indexing = TextFieldIndexing::default()
        .set_tokenizer("default")
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let search_options = TextOptions::default().set_indexing_options(text_indexing);
    let search_text = builder.add_text_field("search_text", search_options);

    let timestamp = builder.add_i64_field("timestamp", STORED | FAST);
    let confidence = builder.add_f64_field("confidence", STORED | FAST);
    let raw_json = builder.add_text_field("raw_json", STORED);

    let schema = builder.build();
    (
        schema,
        MemoryFields {
            id,
            memory_type,
            scope,
            search_text,
            timestamp,
            confidence,
            raw_json,
        },
    )
}

struct MemoryIndex {
    #[allow(dead_code)]
    index: Index,
    fields: MemoryFields,
    writer: AsyncMutex<IndexWriter>,
    reader: AsyncMutex<(IndexReader, Instant)>,
}

fn open_memory_index(dir: &Path) -> Result<MemoryIndex> {
    std::fs::create_dir_all(dir)?;
    let directory = MmapDirectory::open(dir).map_err(tantivy::TantivyError::from)?;
    let (schema, fields) = build_memory_schema();
    let index = Index::open_or_create(directory, schema)?;
    let writer = index.writer(15_000_000)?;
    let reader = index
        .reader_builder()
        .reload_policy(ReloadPolicy::Manual)
        .try_into()?;
    Ok(MemoryIndex {
        index,
        fields,
        writer: AsyncMutex::new(writer),
        reader: AsyncMutex::new((reader, Instant::now())),
    })
}

/// Expands each keyword through the configured domain synonym table so
/// e.g. "auth" also matches memories tagged "authentication".
fn expand_keywords(keywords: &[String], synonyms: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut expanded = Vec::with_capacity(keywords.len());
    for kw in keywords {
        expanded.push(kw.clone());
        if let Some(extra) = synonyms.get(&kw.to_lowercase()) {
            expanded.extend(extra.iter().cloned());
        }
    }
    expanded
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Owns both memory indexes (project + local) for one workspace's data
/// directory.
pub struct MemoryStore {
    project: MemoryIndex,
    local: MemoryIndex,
    synonyms: HashMap<String, Vec<String>>,
    min_confidence: f64,
}

impl MemoryStore {
    pub fn open(config: &Config) -> Result<Self> {
        Ok(Self {
            project: open_memory_index(&config.project_memory_path())?,
            local: open_memory_index(&config.local_memory_path())?,
            synonyms: config.memory_analyzer_synonyms.clone(),
            min_confidence: config.min_confidence,
        })
    }

    fn index_for(&self, scope: Scope) -> &MemoryIndex {
        match scope {
            Scope::Project => &self.project,
            Scope::Local => &self.local,
        }
    }

    /// Stamps `id`, `scope`, `timestamp`, `session_id`, builds the document
    /// and commits immediately — memory writes are not batched.
    pub async fn store_memory(&self, new: NewMemory, session_id: &str) -> Result<MemoryEntry> {
        let scope = scope_for_type(&new.memory_type);
        let entry = MemoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            memory_type: new.memory_type,
            content: new.content,
            scope,
            keywords: new.keywords,
            files_involved: new.files_involved,
            timestamp: now_unix(),
            session_id: session_id.to_string(),
            confidence: new.confidence,
            category: new.category,
            reasoning: new.reasoning,
            tags: new.tags,
        };

        let index = self.index_for(scope);
        let fields = &index.fields;

        let expanded_keywords = expand_keywords(&entry.keywords, &self.synonyms);
        let search_text = [
            entry.content.as_str(),
            &expanded_keywords.join(" "),
            &entry.tags.join(" "),
        ]
        .join(" ");

        let mut doc = TantivyDocument::new();
        doc.add_text(fields.id, &entry.id);
        doc.add_text(fields.memory_type, &entry.memory_type);
        doc.add_text(fields.scope, entry.scope.as_str());
        doc.add_text(fields.search_text, &search_text);
        doc.add_i64(fields.timestamp, entry.timestamp);
        doc.add_f64(fields.confidence, entry.confidence);
        doc.add_text(fields.raw_json, serde_json::to_string(&entry)?);

        let mut writer = index.writer.lock().await;
        writer.add_document(doc)?;
        writer.commit()?;
        drop(writer);

        let mut reader_guard = index.reader.lock().await;
        reader_guard.0.reload()?;
        reader_guard.1 = Instant::now();

        debug!(id = %entry.id, scope = ?entry.scope, "stored memory entry");
        Ok(entry)
    }

    async fn search_index(
        &self,
        index: &MemoryIndex,
        raw_query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        let mut reader_guard = index.reader.lock().await;
        if reader_guard.1.elapsed() > std::time::Duration::from_secs(60) {
            reader_guard.0.reload()?;
            reader_guard.1 = Instant::now();
        }
        let reader = reader_guard.0.clone();
        drop(reader_guard);

        let searcher = reader.searcher();
        let fields = &index.fields;

        let query: Box<dyn Query> = if raw_query.trim() == "*" {
            Box::new(tantivy::query::AllQuery)
        } else {
            let parser =
                tantivy::query::QueryParser::for_index(&index.index, vec![fields.search_text]);
            parser
                .parse_query(&raw_query.to_lowercase())
                .unwrap_or_else(|_| Box::new(tantivy::query::AllQuery))
        };

        let top_docs = searcher.search(&*query, &TopDocs::with_limit(limit))?;
        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc: TantivyDocument = searcher.doc(addr)?;
            if let Some(raw) = get_text(&doc, fields.raw_json) {
                if let Ok(entry) = serde_json::from_str::<MemoryEntry>(&raw) {
                    hits.push(MemoryHit { entry, score });
                }
            }
        }
        Ok(hits)
    }

    /// Searches both indexes (or one, if `scope_filter` narrows it), drops
    /// hits below the configured confidence floor, sorts by confidence
    /// desc then recency desc, and derives up to 5 follow-up queries from
    /// the most frequent keywords across the surviving hit set.
    pub async fn search_memories(
        &self,
        raw_query: &str,
        scope_filter: Option<Scope>,
        max_results: usize,
    ) -> Result<MemorySearchResult> {
        let oversample = (max_results * 4).max(50);
        let mut all_hits = Vec::new();

        if scope_filter != Some(Scope::Local) {
            all_hits.extend(self.search_index(&self.project, raw_query, oversample).await?);
        }
        if scope_filter != Some(Scope::Project) {
            all_hits.extend(self.search_index(&self.local, raw_query, oversample).await?);
        }

        all_hits.retain(|h| h.entry.confidence >= self.min_confidence);
        all_hits.sort_by(|a, b| {
            b.entry
                .confidence
                .partial_cmp(&a.entry.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.entry.timestamp.cmp(&a.entry.timestamp))
        });
        all_hits.truncate(max_results);

        let suggested_queries = suggest_followups(&all_hits);

        Ok(MemorySearchResult {
            hits: all_hits,
            suggested_queries,
        })
    }
}

fn suggest_followups(hits: &[MemoryHit]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for hit in hits {
        for kw in &hit.entry.keywords {
            *counts.entry(kw.to_lowercase()).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(5).map(|(k, _)| k).collect()
}

fn get_text(doc: &TantivyDocument, field: Field) -> Option<String> {
    doc.get_first(field).and_then(|v| match v {
        OwnedValue::Str(s) => Some(s.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.base_data_dir = dir.to_path_buf();
        config
    }

    fn new_memory(memory_type: &str, content: &str, confidence: f64) -> NewMemory {
        NewMemory {
            memory_type: memory_type.to_string(),
            content: content.to_string(),
            keywords: vec!["auth".to_string()],
            files_involved: vec![],
            confidence,
            category: None,
            reasoning: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn architectural_decisions_route_to_project_scope() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(&test_config(tmp.path())).unwrap();
        let entry = store
            .store_memory(new_memory("ArchitecturalDecision", "use tantivy", 0.9), "s1")
            .await
            .unwrap();
        assert_eq!(entry.scope, Scope::Project);
    }

    #[tokio::test]
    async fn notes_route_to_local_scope_and_are_searchable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(&test_config(tmp.path())).unwrap();
        store
            .store_memory(new_memory("Note", "remember the auth flow quirk", 0.8), "s1")
            .await
            .unwrap();

        let result = store.search_memories("auth", None, 10).await.unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].entry.scope, Scope::Local);
    }

    #[tokio::test]
    async fn confidence_floor_drops_low_confidence_hits() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.min_confidence = 0.5;
        let store = MemoryStore::open(&config).unwrap();
        store
            .store_memory(new_memory("Note", "weak guess about auth", 0.1), "s1")
            .await
            .unwrap();
        store
            .store_memory(new_memory("Note", "confident claim about auth", 0.9), "s1")
            .await
            .unwrap();

        let result = store.search_memories("auth", None, 10).await.unwrap();
        assert_eq!(result.hits.len(), 1);
        assert!(result.hits[0].entry.confidence >= 0.5);
    }

    fn hit_with_keywords(keywords: &[&str]) -> MemoryHit {
        MemoryHit {
            entry: MemoryEntry {
                id: "id".to_string(),
                memory_type: "Note".to_string(),
                content: String::new(),
                scope: Scope::Local,
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
                files_involved: vec![],
                timestamp: 0,
                session_id: "s1".to_string(),
                confidence: 1.0,
                category: None,
                reasoning: None,
                tags: vec![],
            },
            score: 1.0,
        }
    }

    #[test]
    fn followups_count_frequency_across_every_hit_not_just_the_top_five() {
        let hits = vec![
            hit_with_keywords(&["rare"]),
            hit_with_keywords(&["rare"]),
            hit_with_keywords(&["rare"]),
            hit_with_keywords(&["rare"]),
            hit_with_keywords(&["rare"]),
            hit_with_keywords(&["common"]),
            hit_with_keywords(&["common"]),
            hit_with_keywords(&["common"]),
            hit_with_keywords(&["common"]),
            hit_with_keywords(&["common"]),
            hit_with_keywords(&["common"]),
        ];
        let suggestions = suggest_followups(&hits);
        assert_eq!(suggestions[0], "common");
    }
}
