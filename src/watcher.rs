//! Live Sync / File Watcher (C4) — OS change events, debouncing,
//! atomic-write coalescing, delete quiet-period confirmation, and
//! dispatch into the pipeline/index store.

use crate::config::Config;
use crate::error::ErrorKind;
use crate::index::IndexStore;
use crate::pipeline;
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("index error: {0}")]
    Index(#[from] crate::index::IndexError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] crate::pipeline::PipelineError),
}

impl WatcherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WatcherError::Notify(_) => ErrorKind::Recoverable,
            WatcherError::Index(e) => e.kind(),
            WatcherError::Pipeline(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WatcherError>;

/// The OS-level event buffer used between the notify callback thread and
/// the dispatcher task.
const QUEUE_CAPACITY: usize = 4096;
const RESTART_DELAY: Duration = Duration::from_secs(1);
const SUBSCRIBER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub workspace: PathBuf,
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub timestamp: Instant,
}

/// A subscriber notified once per processed event. Implementations must be
/// idempotent and return within the 5 s notification budget.
#[async_trait]
pub trait ChangeSubscriber: Send + Sync {
    async fn on_change(&self, event: ChangeEvent);
}

struct PendingChange {
    kind: ChangeKind,
    timestamp: Instant,
}

struct PendingDelete {
    first_seen_at: Instant,
    last_activity_at: Instant,
    cancelled: bool,
}

struct DispatchState {
    pending: HashMap<PathBuf, PendingChange>,
    pending_deletes: HashMap<PathBuf, PendingDelete>,
    recent_updates: HashMap<PathBuf, Instant>,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            pending_deletes: HashMap::new(),
            recent_updates: HashMap::new(),
        }
    }
}

/// Owns one OS watcher for one workspace root and drives the debounce →
/// batch → coalesce → dispatch pipeline.
pub struct Watcher {
    workspace_root: PathBuf,
    hash_dir: String,
    config: Config,
    store: Arc<IndexStore>,
    subscribers: Vec<Arc<dyn ChangeSubscriber>>,
    stop_tx: watch::Sender<bool>,
}

impl Watcher {
    pub fn new(
        workspace_root: PathBuf,
        hash_dir: String,
        config: Config,
        store: Arc<IndexStore>,
        subscribers: Vec<Arc<dyn ChangeSubscriber>>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            workspace_root,
            hash_dir,
            config,
            store,
            subscribers,
            stop_tx,
        }
    }

    /// Spawns the supervisor task. On a watcher setup error the supervisor
    /// restarts after [`RESTART_DELAY`]; on the stop signal it exits,
    /// disposing the OS watcher.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    return;
                }
                match self.run_once(&mut stop_rx).await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(workspace = %self.workspace_root.display(), "watcher failed, restarting in 1s: {e}");
                        tokio::time::sleep(RESTART_DELAY).await;
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    async fn run_once(&self, stop_rx: &mut watch::Receiver<bool>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(QUEUE_CAPACITY);

        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            if tx.blocking_send(res).is_err() {
                debug!("watcher event dropped, dispatcher gone");
            }
        })?;
        watcher.watch(&self.workspace_root, RecursiveMode::Recursive)?;
        info!(workspace = %self.workspace_root.display(), "watching workspace");

        let mut state = DispatchState::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.debounce_ms));

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        info!(workspace = %self.workspace_root.display(), "stopping watcher");
                        return Ok(());
                    }
                }
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(Ok(event)) => self.ingest(&mut state, event),
                        Some(Err(e)) => warn!("watcher event error: {e}"),
                        None => {
                            warn!("watcher channel closed unexpectedly");
                            tokio::time::sleep(RESTART_DELAY).await;
                            return Err(WatcherError::Notify(notify::Error::generic(
                                "event channel closed",
                            )));
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.drain_batch(&mut state).await;
                }
            }
        }
    }

    fn ingest(&self, state: &mut DispatchState, event: Event) {
        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.admit_upsert(state, path.clone(), ChangeKind::Created);
                }
            }
            EventKind::Modify(notify::event::ModifyKind::Name(
                notify::event::RenameMode::Both,
            )) if event.paths.len() == 2 => {
                let from = event.paths[0].clone();
                let to = event.paths[1].clone();
                self.admit_delete(state, from);
                self.admit_upsert(state, to, ChangeKind::Created);
            }
            EventKind::Modify(_) => {
                for path in &event.paths {
                    self.admit_upsert(state, path.clone(), ChangeKind::Modified);
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.admit_delete(state, path.clone());
                }
            }
            _ => {}
        }
    }

    fn is_filtered(&self, path: &Path) -> bool {
        if path.starts_with(&self.config.base_data_dir) {
            return true;
        }
        if let Some(parent) = path.parent() {
            for segment in parent.components() {
                if let std::path::Component::Normal(name) = segment {
                    if self.config.is_excluded_dir(&name.to_string_lossy()) {
                        return true;
                    }
                }
            }
        }
        if path.file_name().and_then(|n| n.to_str()).is_none() {
            return true;
        }
        if pipeline::is_temp_file(path) {
            return true;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => !self.config.extension_policy.allows(ext),
            None => true,
        }
    }

    /// Admits a Created/Modified event, applying the atomic-write
    /// coalescing rule against an in-flight `pendingDelete` for the same
    /// path before falling through to ordinary debounced admission.
    fn admit_upsert(&self, state: &mut DispatchState, path: PathBuf, kind: ChangeKind) {
        if self.is_filtered(&path) {
            return;
        }
        let now = Instant::now();

        if let Some(delete) = state.pending_deletes.get(&path) {
            let window = Duration::from_millis(self.config.atomic_write_window_ms);
            if now.duration_since(delete.first_seen_at) <= window {
                state.pending_deletes.remove(&path);
                state.pending.insert(
                    path.clone(),
                    PendingChange {
                        kind: ChangeKind::Modified,
                        timestamp: now,
                    },
                );
                state.recent_updates.insert(path, now);
                return;
            }
        }
        if let Some(delete) = state.pending_deletes.get_mut(&path) {
            delete.cancelled = true;
        }

        if let Some(last) = state.recent_updates.get(&path) {
            if now.duration_since(*last) < Duration::from_millis(self.config.debounce_ms) {
                return;
            }
        }

        let timestamp = match state.pending.get(&path) {
            Some(existing) => now.max(existing.timestamp),
            None => now,
        };
        state.pending.insert(path.clone(), PendingChange { kind, timestamp });
        state.recent_updates.insert(path, now);
    }

    fn admit_delete(&self, state: &mut DispatchState, path: PathBuf) {
        if self.is_filtered(&path) {
            return;
        }
        let now = Instant::now();
        state
            .pending_deletes
            .entry(path)
            .and_modify(|d| d.last_activity_at = now)
            .or_insert(PendingDelete {
                first_seen_at: now,
                last_activity_at: now,
                cancelled: false,
            });
    }

    /// Drains up to `batch_size` pending upserts, submits them to the
    /// index store, notifies subscribers, then resolves any pending
    /// deletes whose quiet period has elapsed.
    async fn drain_batch(&self, state: &mut DispatchState) {
        if state.pending.is_empty() && state.pending_deletes.is_empty() {
            return;
        }

        let batch: Vec<(PathBuf, PendingChange)> = {
            let keys: Vec<PathBuf> = state
                .pending
                .keys()
                .take(self.config.batch_size)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| state.pending.remove(&k).map(|v| (k, v)))
                .collect()
        };

        for (path, change) in batch {
            self.process_upsert(&path, change.timestamp).await;
            self.notify_subscribers(ChangeEvent {
                workspace: self.workspace_root.clone(),
                path,
                kind: change.kind,
                timestamp: change.timestamp,
            })
            .await;
        }

        self.resolve_pending_deletes(state).await;
    }

    async fn process_upsert(&self, path: &Path, _timestamp: Instant) {
        match pipeline_build_and_index(&self.store, &self.hash_dir, path, &self.workspace_root, &self.config).await {
            Ok(()) => {}
            Err(e) => warn!(path = %path.display(), "failed to reindex changed file: {e}"),
        }
        if let Err(e) = self.store.commit(&self.hash_dir).await {
            warn!("commit after batch failed: {e}");
        }
    }

    async fn resolve_pending_deletes(&self, state: &mut DispatchState) {
        let now = Instant::now();
        let quiet_period = Duration::from_secs(self.config.delete_quiet_period_sec);
        let mut resolved = Vec::new();

        for (path, pending) in state.pending_deletes.iter() {
            if pending.cancelled {
                resolved.push(path.clone());
                continue;
            }
            if now.duration_since(pending.last_activity_at) < quiet_period {
                continue;
            }
            resolved.push(path.clone());

            if path.exists() {
                self.process_upsert(path, now).await;
                self.notify_subscribers(ChangeEvent {
                    workspace: self.workspace_root.clone(),
                    path: path.clone(),
                    kind: ChangeKind::Modified,
                    timestamp: now,
                })
                .await;
            } else {
                let id = path.to_string_lossy().to_string();
                if let Err(e) = self.store.remove_document(&self.hash_dir, &id).await {
                    warn!(path = %path.display(), "failed to remove deleted file: {e}");
                }
                if let Err(e) = self.store.commit(&self.hash_dir).await {
                    warn!("commit after delete failed: {e}");
                }
                self.notify_subscribers(ChangeEvent {
                    workspace: self.workspace_root.clone(),
                    path: path.clone(),
                    kind: ChangeKind::Deleted,
                    timestamp: now,
                })
                .await;
            }
        }

        for path in resolved {
            state.pending_deletes.remove(&path);
        }
    }

    async fn notify_subscribers(&self, event: ChangeEvent) {
        let futures = self.subscribers.iter().map(|subscriber| {
            let subscriber = subscriber.clone();
            let event = event.clone();
            async move {
                if tokio::time::timeout(SUBSCRIBER_TIMEOUT, subscriber.on_change(event))
                    .await
                    .is_err()
                {
                    warn!("subscriber notification timed out");
                }
            }
        });
        futures::future::join_all(futures).await;
    }
}

async fn pipeline_build_and_index(
    store: &IndexStore,
    hash_dir: &str,
    path: &Path,
    root: &Path,
    config: &Config,
) -> Result<()> {
    if let Some(doc) = pipeline::build_document_for_path(path, root, config)? {
        store.index_document(hash_dir, doc).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingSubscriber {
        events: StdMutex<Vec<ChangeEvent>>,
    }

    #[async_trait]
    impl ChangeSubscriber for RecordingSubscriber {
        async fn on_change(&self, event: ChangeEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn test_watcher(config: Config, store: Arc<IndexStore>) -> Watcher {
        Watcher::new(
            PathBuf::from("/ws"),
            "hash".to_string(),
            config,
            store,
            vec![],
        )
    }

    #[tokio::test]
    async fn atomic_write_coalesces_to_single_modified() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(IndexStore::new(tmp.path().to_path_buf(), 10, Duration::from_secs(900)));
        let config = Config::default();
        let watcher = test_watcher(config, store);

        let mut state = DispatchState::new();
        let path = PathBuf::from("/ws/x.cs");
        watcher.admit_delete(&mut state, path.clone());
        watcher.admit_upsert(&mut state, path.clone(), ChangeKind::Created);

        assert!(state.pending_deletes.is_empty());
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.pending[&path].kind, ChangeKind::Modified);
    }

    #[tokio::test]
    async fn delete_outside_window_cancels_without_coalescing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(IndexStore::new(tmp.path().to_path_buf(), 10, Duration::from_secs(900)));
        let mut config = Config::default();
        config.atomic_write_window_ms = 0;
        let watcher = test_watcher(config, store);

        let mut state = DispatchState::new();
        let path = PathBuf::from("/ws/y.cs");
        watcher.admit_delete(&mut state, path.clone());
        tokio::time::sleep(Duration::from_millis(5)).await;
        watcher.admit_upsert(&mut state, path.clone(), ChangeKind::Created);

        let delete = state.pending_deletes.get(&path).unwrap();
        assert!(delete.cancelled);
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn debounce_skips_rapid_resubmission() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = Arc::new(IndexStore::new(tmp.path().to_path_buf(), 10, Duration::from_secs(900)));
        let config = Config::default();
        let watcher = test_watcher(config, store);
        let _guard = rt.enter();

        let mut state = DispatchState::new();
        let path = PathBuf::from("/ws/z.cs");
        watcher.admit_upsert(&mut state, path.clone(), ChangeKind::Modified);
        let counter = AtomicUsize::new(state.pending.len());
        watcher.admit_upsert(&mut state, path.clone(), ChangeKind::Modified);
        assert_eq!(counter.load(Ordering::Relaxed), state.pending.len());
    }
}
