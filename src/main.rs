//! codesearch-server: long-running daemon that indexes a workspace, keeps
//! it synchronized with the filesystem via the live watcher, and serves
//! search and memory queries.

use clap::Parser;
use codesearch_core::config::Config;
use codesearch_core::index::IndexStore;
use codesearch_core::memory::MemoryStore;
use codesearch_core::pipeline;
use codesearch_core::registry::Registry;
use codesearch_core::watcher::{ChangeEvent, ChangeSubscriber, Watcher};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "codesearch-server")]
#[command(about = "Live-synced workspace code search and memory daemon", long_about = None)]
struct Args {
    /// Workspace root to index and watch. Defaults to $CODESEARCH_WORKSPACE,
    /// then the current directory.
    #[arg(short, long)]
    workspace: Option<PathBuf>,
}

fn resolve_workspace_root(args: &Args) -> PathBuf {
    if let Some(path) = &args.workspace {
        if let Ok(canonical) = path.canonicalize() {
            return canonical;
        }
        warn!(path = %path.display(), "--workspace path does not exist, falling back");
    }

    if let Ok(path_str) = env::var("CODESEARCH_WORKSPACE") {
        let path = PathBuf::from(path_str);
        if let Ok(canonical) = path.canonicalize() {
            return canonical;
        }
    }

    env::current_dir()
        .ok()
        .and_then(|p| p.canonicalize().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

struct LoggingSubscriber;

#[async_trait::async_trait]
impl ChangeSubscriber for LoggingSubscriber {
    async fn on_change(&self, event: ChangeEvent) {
        info!(path = %event.path.display(), kind = ?event.kind, "change dispatched");
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_file {
        Some(log_file) => {
            let dir = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
            let _ = std::fs::create_dir_all(dir);
            let file_appender = tracing_appender::rolling::daily(
                dir,
                log_file.file_name().and_then(|n| n.to_str()).unwrap_or("codesearch.log"),
            );
            let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);
            // Leaked intentionally: the guard must outlive the process for
            // buffered log lines to flush, and this runs for the daemon's
            // entire lifetime.
            std::mem::forget(guard);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(non_blocking_file).with_ansi(false))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let workspace_root = resolve_workspace_root(&args);

    let config = Config::load_or_default(&workspace_root)?;
    init_logging(&config);

    info!(workspace = %workspace_root.display(), "starting codesearch-server");

    let registry = Arc::new(Registry::new(
        config.base_data_dir.join("workspaces.json"),
        config.index_root(),
    ));
    let hash_dir = registry.resolve_index_dir(&workspace_root).await?;

    let store = Arc::new(IndexStore::new(
        config.index_root(),
        config.max_contexts,
        Duration::from_secs(config.idle_timeout_min * 60),
    ));

    // Opened for the daemon's lifetime so the project/local memory indexes
    // are ready the moment a collaborator needs them.
    let _memory = MemoryStore::open(&config)?;

    info!("running initial scan");
    let report = pipeline::index_workspace(&store, &hash_dir, &workspace_root, &config).await?;
    info!(
        processed = report.processed,
        skipped = report.skipped,
        errors = report.errors.len(),
        "initial scan complete"
    );

    let subscribers: Vec<Arc<dyn ChangeSubscriber>> = vec![Arc::new(LoggingSubscriber)];
    let watcher = Arc::new(Watcher::new(
        workspace_root.clone(),
        hash_dir.clone(),
        config.clone(),
        store.clone(),
        subscribers,
    ));
    let watcher_handle = watcher.clone().start();

    let idle_store = store.clone();
    let idle_registry = registry.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        loop {
            tick.tick().await;
            let evicted = idle_store.evict_idle().await;
            if evicted > 0 {
                info!(evicted, "evicted idle index contexts");
            }
            if let Err(e) = idle_registry.cleanup_duplicates().await {
                warn!("registry cleanup failed: {e}");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    watcher.stop();
    let _ = watcher_handle.await;

    Ok(())
}
