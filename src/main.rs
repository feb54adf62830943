use anyhow::Context;
use catalog_import::category::{CategoryRepository, CategoryTreeCache, SqliteCategoryRepository};
use catalog_import::category_path::{CategoryPathRepository, SqliteCategoryPathRepository};
use catalog_import::config::ImportConfig;
use catalog_import::import::reconciler;
use catalog_import::import::run::{ImportRun, ImportRunRepository, SqliteImportRunRepository};
use catalog_import::import::service::ImportService;
use catalog_import::manufacturer::{ManufacturerRepository, SqliteManufacturerRepository};
use catalog_import::product::{ProductRepository, SqliteProductRepository};
use catalog_import::search::{FileSearchIndex, SearchIndex};
use catalog_import::sku::{SkuRepository, SqliteSkuRepository};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_rusqlite::Connection;

fn env_string(key: &str, default_value: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default_value.to_string())
}

fn poll_interval() -> Duration {
    let secs = env::var("IMPORT_POLL_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(5);
    Duration::from_secs(secs)
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    if let Err(env::VarError::NotPresent) = env::var("RUST_LOG") {
        env::set_var("RUST_LOG", "INFO");
    }
    pretty_env_logger::formatted_timed_builder()
        .parse_default_env()
        .init();

    match std::fs::File::open(".env") {
        Ok(_) => envmnt::load_file(".env")?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::File::create(".env")?;
            envmnt::load_file(".env")?;
        }
        Err(err) => {
            return Err(anyhow::anyhow!("Unable to open .env file: {err}"));
        }
    }

    let db_path = env_string("CATALOG_DB_PATH", "storage/catalog.db");
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Unable to create storage directory for {db_path}"))?;
    }

    // Note: repositories share database files through separate
    // connections; SQLite in WAL mode supports that safely, and the
    // batch upserter's retry loop absorbs busy/locked collisions.
    let conn_runs = Connection::open(&db_path).await?;
    let runs: Arc<dyn ImportRunRepository> =
        Arc::new(SqliteImportRunRepository::init(conn_runs).await?);
    let conn_catalog = Connection::open(&db_path).await?;
    let manufacturers: Arc<dyn ManufacturerRepository> =
        Arc::new(SqliteManufacturerRepository::init(conn_catalog.clone()).await?);
    let category_paths: Arc<dyn CategoryPathRepository> =
        Arc::new(SqliteCategoryPathRepository::init(conn_catalog.clone()).await?);
    let categories: Arc<dyn CategoryRepository> =
        Arc::new(SqliteCategoryRepository::init(conn_catalog.clone()).await?);
    let products: Arc<dyn ProductRepository> =
        Arc::new(SqliteProductRepository::init(conn_catalog).await?);
    let conn_skus = Connection::open(&db_path).await?;
    let skus: Arc<dyn SkuRepository> = Arc::new(SqliteSkuRepository::init(conn_skus).await?);

    let search: Arc<dyn SearchIndex> = Arc::new(FileSearchIndex::new(env_string(
        "SEARCH_SPOOL_PATH",
        "storage/search_reindex.json",
    )));
    let tree_cache = Arc::new(CategoryTreeCache::new());

    let config = ImportConfig::default();
    reconciler::fail_stale_runs(&runs, config.stale_after).await?;

    let service = ImportService::new(
        runs.clone(),
        manufacturers,
        category_paths,
        categories,
        products,
        skus,
        search,
        tree_cache,
        config.clone(),
    );

    log::info!(
        "Catalog import worker started (chunk size {}, {} workers)",
        config.chunk_size,
        config.concurrency
    );
    let interval = poll_interval();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Shutting down catalog import worker");
                break;
            }
            run = next_queued_run(&runs, interval) => {
                let run = run?;
                process_run(&service, &runs, run).await;
            }
        }
    }
    Ok(())
}

async fn next_queued_run(
    runs: &Arc<dyn ImportRunRepository>,
    interval: Duration,
) -> Result<ImportRun, anyhow::Error> {
    loop {
        if let Some(run) = runs.next_queued().await? {
            return Ok(run);
        }
        tokio::time::sleep(interval).await;
    }
}

async fn process_run(
    service: &ImportService,
    runs: &Arc<dyn ImportRunRepository>,
    run: ImportRun,
) {
    let path = PathBuf::from(&run.file_path);
    if let Err(err) = service.process_import(run.id, &path).await {
        // Covers failures raised before the orchestrator could record
        // the terminal status itself.
        match runs.mark_failed_if_unfinished(run.id, &format!("{err:#}")).await {
            Ok(true) => log::warn!("Import run {} marked failed by the worker", run.id),
            Ok(false) => (),
            Err(mark_err) => {
                log::error!("Unable to mark import run {} failed: {mark_err:#}", run.id)
            }
        }
    }
    // The uploaded feed file is removed once the run is terminal,
    // whether it succeeded or not.
    if let Err(err) = tokio::fs::remove_file(&path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Unable to remove processed feed file {}: {err}", path.display());
        }
    }
}
