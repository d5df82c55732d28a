//! codesearch: CLI front-end for scanning a workspace, searching it, and
//! running store maintenance (integrity repair, defragmentation).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codesearch_core::config::Config;
use codesearch_core::index::{DefragmentOptions, IndexStore, RepairOptions};
use codesearch_core::registry::Registry;
use codesearch_core::pipeline;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "codesearch")]
#[command(about = "Workspace-scoped code search and index maintenance", long_about = None)]
#[command(version)]
struct Cli {
    /// Optional log file; stderr-only logging if omitted.
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Full scan of a workspace directory, building or refreshing its index.
    Scan {
        #[arg(short, long)]
        dir: PathBuf,
    },

    /// Search a previously scanned workspace.
    Search {
        #[arg(short, long)]
        dir: PathBuf,

        query: String,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        language: Option<String>,
    },

    /// Check and optionally repair index corruption.
    Repair {
        #[arg(short, long)]
        dir: PathBuf,

        #[arg(long)]
        apply: bool,
    },

    /// Force a defragmentation pass irrespective of current fragmentation.
    Defragment {
        #[arg(short, long)]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log.as_ref())?;

    match cli.command {
        Commands::Scan { dir } => scan(dir).await,
        Commands::Search {
            dir,
            query,
            limit,
            language,
        } => search(dir, query, limit, language).await,
        Commands::Repair { dir, apply } => repair(dir, apply).await,
        Commands::Defragment { dir } => defragment(dir).await,
    }
}

fn init_logging(log_path: Option<&PathBuf>) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    if let Some(log_file) = log_path {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let file_appender = tracing_appender::rolling::never(
            log_file.parent().unwrap_or_else(|| std::path::Path::new(".")),
            log_file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("codesearch.log"),
        );

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(file_appender.and(std::io::stderr.with_max_level(tracing::Level::WARN)))
            .init();
    } else {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

async fn resolve(dir: &PathBuf) -> Result<(Config, Registry, IndexStore, String)> {
    let root = dir.canonicalize().with_context(|| format!("{dir:?} does not exist"))?;
    let config = Config::load_or_default(&root)?;
    let registry = Registry::new(config.base_data_dir.join("workspaces.json"), config.index_root());
    let hash_dir = registry.resolve_index_dir(&root).await?;
    let store = IndexStore::new(
        config.index_root(),
        config.max_contexts,
        Duration::from_secs(config.idle_timeout_min * 60),
    );
    Ok((config, registry, store, hash_dir))
}

async fn scan(dir: PathBuf) -> Result<()> {
    let (config, _registry, store, hash_dir) = resolve(&dir).await?;
    let root = dir.canonicalize()?;
    let report = pipeline::index_workspace(&store, &hash_dir, &root, &config).await?;
    info!(
        processed = report.processed,
        skipped = report.skipped,
        errors = report.errors.len(),
        duration_ms = report.duration_ms,
        "scan complete"
    );
    println!(
        "indexed {} files ({} skipped, {} errors) in {}ms",
        report.processed,
        report.skipped,
        report.errors.len(),
        report.duration_ms
    );
    for err in &report.errors {
        eprintln!("  error: {}: {}", err.path, err.message);
    }
    Ok(())
}

async fn search(dir: PathBuf, query: String, limit: usize, language: Option<String>) -> Result<()> {
    let (_config, _registry, store, hash_dir) = resolve(&dir).await?;
    let hits = store
        .search(&hash_dir, &query, limit, language.as_deref())
        .await?;
    for hit in hits {
        println!("{:>8.3}  {}  [{}]", hit.score, hit.path, hit.language);
    }
    Ok(())
}

async fn repair(dir: PathBuf, apply: bool) -> Result<()> {
    let (_config, _registry, store, hash_dir) = resolve(&dir).await?;
    let report = store.check_integrity(&hash_dir).await?;
    println!(
        "clean={} missing_segments={} lost_docs={}",
        report.clean, report.missing_segments, report.lost_docs
    );
    if !report.clean && apply {
        let outcome = store
            .repair(
                &hash_dir,
                RepairOptions {
                    create_backup: true,
                    remove_bad_segments: true,
                    validate_after_repair: true,
                    restore_on_failure: true,
                },
            )
            .await?;
        println!(
            "repair success={} removed_segments={} backup={:?}",
            outcome.success, outcome.removed_segments, outcome.backup_dir
        );
    }
    Ok(())
}

async fn defragment(dir: PathBuf) -> Result<()> {
    let (config, _registry, store, hash_dir) = resolve(&dir).await?;
    let report = store
        .defragment(
            &hash_dir,
            DefragmentOptions { create_backup: true },
            0,
            config.full_defragmentation_threshold,
            config.target_segment_count,
        )
        .await?;
    println!(
        "action={} before={}% after={}%",
        report.action, report.before.fragmentation_pct, report.after.fragmentation_pct
    );
    Ok(())
}
