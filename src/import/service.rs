use crate::category::{CategoryRepository, CategoryTreeCache};
use crate::category_path::CategoryPathRepository;
use crate::config::ImportConfig;
use crate::import::batch::BatchUpserter;
use crate::import::category_tree;
use crate::import::feed::{self, FeedRecord};
use crate::import::normalize;
use crate::import::run::{ImportRunRepository, ImportStats, NewRowError};
use crate::manufacturer::ManufacturerRepository;
use crate::product::ProductRepository;
use crate::search::{SearchIndex, SkuDocument};
use crate::sku::SkuRepository;
use anyhow::Context;
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const ERROR_FLUSH_BATCH: usize = 200;
const MISSING_CATEGORY_PATH_MESSAGE: &str = "Missing; set to Uncategorized";

/// Owns the run lifecycle: chunking, bounded-concurrency dispatch of
/// the batch upserter, error aggregation, category materialization,
/// stale-SKU deactivation and the terminal status transition.
pub struct ImportService {
    runs: Arc<dyn ImportRunRepository>,
    categories: Arc<dyn CategoryRepository>,
    products: Arc<dyn ProductRepository>,
    skus: Arc<dyn SkuRepository>,
    search: Arc<dyn SearchIndex>,
    tree_cache: Arc<CategoryTreeCache>,
    upserter: BatchUpserter,
    config: ImportConfig,
}

#[derive(Debug, Default)]
struct ChunkAggregate {
    inserted: u64,
    updated: u64,
    category_paths: BTreeSet<String>,
    errors: Vec<NewRowError>,
}

impl ImportService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runs: Arc<dyn ImportRunRepository>,
        manufacturers: Arc<dyn ManufacturerRepository>,
        category_paths: Arc<dyn CategoryPathRepository>,
        categories: Arc<dyn CategoryRepository>,
        products: Arc<dyn ProductRepository>,
        skus: Arc<dyn SkuRepository>,
        search: Arc<dyn SearchIndex>,
        tree_cache: Arc<CategoryTreeCache>,
        config: ImportConfig,
    ) -> Self {
        let upserter = BatchUpserter::new(
            manufacturers,
            category_paths,
            products.clone(),
            skus.clone(),
            config.retry_attempts,
            config.retry_backoff,
        );
        Self {
            runs,
            categories,
            products,
            skus,
            search,
            tree_cache,
            upserter,
            config,
        }
    }

    /// Entry point invoked by the queue worker for an accepted feed
    /// file. Row-level problems are recorded and the run still
    /// succeeds; any other failure marks the run FAILED and propagates.
    pub async fn process_import(&self, run_id: Uuid, path: &Path) -> anyhow::Result<ImportStats> {
        self.runs.mark_running(run_id).await?;
        log::info!("Import run {run_id} started for {}", path.display());
        match self.run_pipeline(run_id, path).await {
            Ok(stats) => {
                self.runs.mark_succeeded(run_id, stats).await?;
                log::info!(
                    "Import run {run_id} succeeded: {} rows, {} inserted, {} updated, {} deactivated, {} errors",
                    stats.total_rows,
                    stats.inserted,
                    stats.updated,
                    stats.deactivated,
                    stats.error_count
                );
                self.reindex_search().await;
                Ok(stats)
            }
            Err(err) => {
                log::error!("Import run {run_id} failed: {err:#}");
                if let Err(mark_err) = self.runs.mark_failed(run_id, &format!("{err:#}")).await {
                    log::error!("Unable to mark import run {run_id} failed: {mark_err:#}");
                }
                Err(err)
            }
        }
    }

    async fn run_pipeline(&self, run_id: Uuid, path: &Path) -> anyhow::Result<ImportStats> {
        let records = feed::read_feed(path).await?;
        let total_rows = records.len() as u64;

        // Row numbers are fixed here, before any chunk is dispatched:
        // the header is line 1, the first data row line 2.
        let rows: Vec<(usize, FeedRecord)> = records
            .into_iter()
            .enumerate()
            .map(|(idx, record)| (idx + 2, record))
            .collect();
        let chunk_size = self.config.chunk_size.max(1);
        let chunks: Arc<Vec<Vec<(usize, FeedRecord)>>> =
            Arc::new(rows.chunks(chunk_size).map(<[_]>::to_vec).collect());
        log::debug!(
            "Import run {run_id}: {total_rows} rows in {} chunk(s)",
            chunks.len()
        );

        let cursor = Arc::new(AtomicUsize::new(0));
        let workers = self.config.concurrency.max(1).min(chunks.len().max(1));
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let chunks = chunks.clone();
            let cursor = cursor.clone();
            let upserter = self.upserter.clone();
            handles.push(tokio::spawn(async move {
                let mut aggregate = ChunkAggregate::default();
                loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(chunk) = chunks.get(index) else {
                        break;
                    };
                    process_chunk(&upserter, run_id, chunk, &mut aggregate).await?;
                }
                Ok::<_, anyhow::Error>(aggregate)
            }));
        }

        let mut inserted = 0u64;
        let mut updated = 0u64;
        let mut category_paths = BTreeSet::new();
        let mut errors: Vec<NewRowError> = Vec::new();
        for joined in join_all(handles).await {
            let aggregate = joined.context("Import worker panicked")??;
            inserted += aggregate.inserted;
            updated += aggregate.updated;
            category_paths.extend(aggregate.category_paths);
            errors.extend(aggregate.errors);
        }
        errors.sort_by_key(|e| e.row_number);

        for batch in errors.chunks(ERROR_FLUSH_BATCH) {
            self.runs.add_row_errors(run_id, batch).await?;
        }

        if !category_paths.is_empty() {
            let nodes = category_tree::expand_paths(&category_paths);
            self.categories.insert_missing(nodes).await?;
            self.tree_cache.invalidate().await;
        }

        // Deactivation must only run once every chunk has stamped its
        // rows, which the worker join above guarantees.
        let deactivated = self.skus.deactivate_not_seen(run_id).await?;

        Ok(ImportStats {
            total_rows,
            inserted,
            updated,
            deactivated,
            error_count: errors.len() as u64,
        })
    }

    async fn reindex_search(&self) {
        let documents = match self.build_documents().await {
            Ok(documents) => documents,
            Err(err) => {
                log::error!("Unable to build search documents after import: {err:#}");
                return;
            }
        };
        let count = documents.len();
        if let Err(err) = self.search.reindex(documents).await {
            log::error!("Search reindex failed after a successful import: {err:#}");
        } else {
            log::info!("Search reindex triggered with {count} documents");
        }
    }

    async fn build_documents(&self) -> anyhow::Result<Vec<SkuDocument>> {
        let product_names: HashMap<i64, String> = self
            .products
            .list()
            .await?
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect();
        Ok(self
            .skus
            .list_active()
            .await?
            .into_iter()
            .map(|sku| SkuDocument {
                item_id: sku.item_id,
                product_id: sku.product_id,
                product_name: product_names.get(&sku.product_id).cloned(),
                item_description: sku.item_description,
                ndc_item_code: sku.ndc_item_code,
                brand_name: sku.brand_name,
                country_of_origin: sku.country_of_origin,
                unit_price: sku.unit_price,
            })
            .collect())
    }
}

async fn process_chunk(
    upserter: &BatchUpserter,
    run_id: Uuid,
    chunk: &[(usize, FeedRecord)],
    aggregate: &mut ChunkAggregate,
) -> anyhow::Result<()> {
    let mut valid = Vec::with_capacity(chunk.len());
    for (row_number, record) in chunk {
        match normalize::normalize(*row_number, record) {
            Ok(row) => {
                if row.missing_category_path() {
                    aggregate.errors.push(NewRowError {
                        row_number: *row_number as i64,
                        field: Some("CategoryPathID".to_string()),
                        message: MISSING_CATEGORY_PATH_MESSAGE.to_string(),
                    });
                }
                if let Some(name) = row.category_path_name.as_deref() {
                    aggregate.category_paths.insert(name.to_string());
                }
                valid.push(row);
            }
            Err(err) => aggregate.errors.push(err.into()),
        }
    }
    let outcome = upserter.upsert_chunk(run_id, &valid).await?;
    aggregate.inserted += outcome.inserted;
    aggregate.updated += outcome.updated;
    aggregate.errors.extend(outcome.errors);
    Ok(())
}
