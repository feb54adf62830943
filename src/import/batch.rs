use crate::category_path::{CategoryPath, CategoryPathRepository};
use crate::import::normalize::NormalizedRow;
use crate::import::run::NewRowError;
use crate::manufacturer::{Manufacturer, ManufacturerRepository};
use crate::product::{Product, ProductRepository};
use crate::sku::{Sku, SkuRepository};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::sleep;
use uuid::Uuid;

/// Writes one chunk of normalized rows as a unit: manufacturers and
/// category-path labels first, then products, then SKUs, so every SKU
/// write finds its product in place. Busy/locked conflicts from
/// concurrent chunks are retried with linear backoff; exhausting the
/// retries demotes the chunk to row-level errors instead of failing the
/// run.
#[derive(Clone)]
pub struct BatchUpserter {
    manufacturers: Arc<dyn ManufacturerRepository>,
    category_paths: Arc<dyn CategoryPathRepository>,
    products: Arc<dyn ProductRepository>,
    skus: Arc<dyn SkuRepository>,
    retry_attempts: usize,
    retry_backoff: Duration,
}

#[derive(Debug, Default)]
pub struct ChunkOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub errors: Vec<NewRowError>,
}

impl BatchUpserter {
    pub fn new(
        manufacturers: Arc<dyn ManufacturerRepository>,
        category_paths: Arc<dyn CategoryPathRepository>,
        products: Arc<dyn ProductRepository>,
        skus: Arc<dyn SkuRepository>,
        retry_attempts: usize,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            manufacturers,
            category_paths,
            products,
            skus,
            retry_attempts: retry_attempts.max(1),
            retry_backoff,
        }
    }

    pub async fn upsert_chunk(
        &self,
        run_id: Uuid,
        rows: &[NormalizedRow],
    ) -> anyhow::Result<ChunkOutcome> {
        if rows.is_empty() {
            return Ok(ChunkOutcome::default());
        }
        let mut attempt = 1;
        loop {
            match self.write_chunk(run_id, rows).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if is_transient_conflict(&err) => {
                    if attempt >= self.retry_attempts {
                        log::warn!(
                            "Chunk of {} rows dropped after {attempt} conflicted attempts: {err}",
                            rows.len()
                        );
                        let message =
                            format!("Write conflict persisted after {attempt} attempts: {err}");
                        let errors = rows
                            .iter()
                            .map(|row| NewRowError {
                                row_number: row.row_number as i64,
                                field: None,
                                message: message.clone(),
                            })
                            .collect();
                        return Ok(ChunkOutcome {
                            inserted: 0,
                            updated: 0,
                            errors,
                        });
                    }
                    log::debug!("Transient write conflict on attempt {attempt}, retrying: {err}");
                    sleep(self.retry_backoff * attempt as u32).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn write_chunk(
        &self,
        run_id: Uuid,
        rows: &[NormalizedRow],
    ) -> anyhow::Result<ChunkOutcome> {
        let item_ids: Vec<i64> = rows.iter().map(|r| r.item_id).collect();
        // The pre-write read makes the inserted/updated split; a race
        // with another chunk only skews the informational counts.
        let existing = self.skus.existing_ids(&item_ids).await?;

        let mut manufacturers = HashMap::new();
        let mut paths = HashMap::new();
        let mut products = HashMap::new();
        for row in rows {
            manufacturers.insert(
                row.manufacturer_id,
                Manufacturer {
                    id: row.manufacturer_id,
                    name: row.manufacturer_name.clone(),
                },
            );
            if let (Some(id), Some(name)) = (row.category_path_id, row.category_path_name.as_ref())
            {
                paths.insert(
                    id,
                    CategoryPath {
                        id,
                        name: name.clone(),
                    },
                );
            }
            products.insert(
                row.product_id,
                Product {
                    id: row.product_id,
                    name: row.product_name.clone(),
                    description: row.product_description.clone(),
                    manufacturer_id: Some(row.manufacturer_id),
                    category_path_id: row.category_path_id,
                },
            );
        }
        let now = OffsetDateTime::now_utc();
        let skus: Vec<Sku> = rows.iter().map(|row| sku_from_row(row, run_id, now)).collect();

        self.manufacturers
            .upsert_many(manufacturers.into_values().collect())
            .await?;
        self.category_paths
            .upsert_many(paths.into_values().collect())
            .await?;
        self.products
            .upsert_many(products.into_values().collect())
            .await?;
        self.skus.upsert_many(skus).await?;

        let mut inserted = 0u64;
        let mut updated = 0u64;
        let mut seen = HashSet::new();
        for id in &item_ids {
            if !seen.insert(*id) {
                continue;
            }
            if existing.contains(id) {
                updated += 1;
            } else {
                inserted += 1;
            }
        }
        Ok(ChunkOutcome {
            inserted,
            updated,
            errors: Vec::new(),
        })
    }
}

fn sku_from_row(row: &NormalizedRow, run_id: Uuid, now: OffsetDateTime) -> Sku {
    Sku {
        item_id: row.item_id,
        product_id: row.product_id,
        item_description: row.item_description.clone(),
        image_url: row.image_url.clone(),
        ndc_item_code: row.ndc_item_code.clone(),
        package: row.package.clone(),
        unit_price: row.unit_price,
        price_description: row.price_description.clone(),
        availability: row.availability.clone(),
        packing_list_description: row.packing_list_description.clone(),
        unit_weight: row.unit_weight,
        unit_volume: row.unit_volume,
        uom_factor: row.uom_factor,
        country_of_origin: row.country_of_origin.clone(),
        tariff_code: row.tariff_code.clone(),
        hazmat_code: row.hazmat_code.clone(),
        hazmat_class: row.hazmat_class.clone(),
        pharmacy_product_type: row.pharmacy_product_type.clone(),
        national_drug_code: row.national_drug_code.clone(),
        brand_id: row.brand_id,
        brand_name: row.brand_name.clone(),
        is_active: true,
        last_seen_import_run_id: Some(run_id),
        last_seen_at: Some(now),
    }
}

/// Busy/locked sqlite errors are the transient conflict class worth
/// retrying; anything else fails the chunk immediately.
pub(crate) fn is_transient_conflict(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(e) = cause.downcast_ref::<rusqlite::Error>() {
            return is_busy(e);
        }
        if let Some(tokio_rusqlite::Error::Rusqlite(e)) =
            cause.downcast_ref::<tokio_rusqlite::Error>()
        {
            return is_busy(e);
        }
        false
    })
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category_path::SqliteCategoryPathRepository;
    use crate::manufacturer::SqliteManufacturerRepository;
    use crate::product::SqliteProductRepository;
    use crate::sku::SqliteSkuRepository;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use tokio_rusqlite::Connection;

    fn row(item_id: i64, product_id: i64) -> NormalizedRow {
        NormalizedRow {
            row_number: 2,
            item_id,
            product_id,
            product_name: "Nitrile Exam Gloves".to_string(),
            product_description: None,
            manufacturer_id: 55,
            manufacturer_name: "Acme Medical".to_string(),
            category_path_id: Some(7),
            category_path_name: Some("Gloves>Exam".to_string()),
            item_description: None,
            image_url: None,
            ndc_item_code: None,
            package: None,
            unit_price: Some(dec!(12.99)),
            price_description: None,
            availability: None,
            packing_list_description: None,
            unit_weight: None,
            unit_volume: None,
            uom_factor: None,
            country_of_origin: None,
            tariff_code: None,
            hazmat_code: None,
            hazmat_class: None,
            pharmacy_product_type: None,
            national_drug_code: None,
            brand_id: None,
            brand_name: None,
        }
    }

    async fn upserter() -> (BatchUpserter, Arc<dyn SkuRepository>, Arc<dyn ProductRepository>) {
        let conn = Connection::open_in_memory().await.expect("open sqlite");
        let manufacturers: Arc<dyn ManufacturerRepository> = Arc::new(
            SqliteManufacturerRepository::init(conn.clone())
                .await
                .expect("init manufacturers"),
        );
        let category_paths: Arc<dyn CategoryPathRepository> = Arc::new(
            SqliteCategoryPathRepository::init(conn.clone())
                .await
                .expect("init category paths"),
        );
        let products: Arc<dyn ProductRepository> = Arc::new(
            SqliteProductRepository::init(conn.clone())
                .await
                .expect("init products"),
        );
        let skus: Arc<dyn SkuRepository> = Arc::new(
            SqliteSkuRepository::init(conn).await.expect("init skus"),
        );
        let upserter = BatchUpserter::new(
            manufacturers,
            category_paths,
            products.clone(),
            skus.clone(),
            4,
            Duration::from_millis(1),
        );
        (upserter, skus, products)
    }

    #[tokio::test]
    async fn splits_inserted_and_updated_counts() {
        let (upserter, skus, products) = upserter().await;
        let run_one = Uuid::new_v4();
        let outcome = upserter
            .upsert_chunk(run_one, &[row(1001, 9001), row(1002, 9001)])
            .await
            .expect("first chunk");
        assert_eq!((outcome.inserted, outcome.updated), (2, 0));
        assert!(outcome.errors.is_empty());

        let run_two = Uuid::new_v4();
        let outcome = upserter
            .upsert_chunk(run_two, &[row(1001, 9001), row(1003, 9002)])
            .await
            .expect("second chunk");
        assert_eq!((outcome.inserted, outcome.updated), (1, 1));

        let sku = skus.get(1001).await.expect("get").expect("sku");
        assert_eq!(sku.last_seen_import_run_id, Some(run_two));
        assert!(sku.is_active);
        assert!(products.get(9002).await.expect("get").is_some());
    }

    struct BusySkuRepository;

    #[async_trait]
    impl SkuRepository for BusySkuRepository {
        async fn existing_ids(&self, _item_ids: &[i64]) -> anyhow::Result<HashSet<i64>> {
            Ok(HashSet::new())
        }

        async fn upsert_many(&self, _skus: Vec<Sku>) -> anyhow::Result<()> {
            Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some("database is locked".to_string()),
            )
            .into())
        }

        async fn deactivate_not_seen(&self, _run_id: Uuid) -> anyhow::Result<u64> {
            Ok(0)
        }

        async fn get(&self, _item_id: i64) -> anyhow::Result<Option<Sku>> {
            Ok(None)
        }

        async fn list_active(&self) -> anyhow::Result<Vec<Sku>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn demotes_an_exhausted_conflict_to_row_errors() {
        let conn = Connection::open_in_memory().await.expect("open sqlite");
        let manufacturers: Arc<dyn ManufacturerRepository> = Arc::new(
            SqliteManufacturerRepository::init(conn.clone())
                .await
                .expect("init manufacturers"),
        );
        let category_paths: Arc<dyn CategoryPathRepository> = Arc::new(
            SqliteCategoryPathRepository::init(conn.clone())
                .await
                .expect("init category paths"),
        );
        let products: Arc<dyn ProductRepository> = Arc::new(
            SqliteProductRepository::init(conn).await.expect("init products"),
        );
        let upserter = BatchUpserter::new(
            manufacturers,
            category_paths,
            products,
            Arc::new(BusySkuRepository),
            2,
            Duration::from_millis(1),
        );

        let mut first = row(1001, 9001);
        first.row_number = 2;
        let mut second = row(1002, 9002);
        second.row_number = 3;
        let outcome = upserter
            .upsert_chunk(Uuid::new_v4(), &[first, second])
            .await
            .expect("demoted, not fatal");
        assert_eq!((outcome.inserted, outcome.updated), (0, 0));
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.errors[0].row_number, 2);
        assert_eq!(outcome.errors[1].row_number, 3);
        assert_eq!(outcome.errors[0].message, outcome.errors[1].message);
        assert!(outcome.errors[0].message.contains("2 attempts"));
    }

    struct BrokenSkuRepository;

    #[async_trait]
    impl SkuRepository for BrokenSkuRepository {
        async fn existing_ids(&self, _item_ids: &[i64]) -> anyhow::Result<HashSet<i64>> {
            Ok(HashSet::new())
        }

        async fn upsert_many(&self, _skus: Vec<Sku>) -> anyhow::Result<()> {
            Err(anyhow!("sku table is gone"))
        }

        async fn deactivate_not_seen(&self, _run_id: Uuid) -> anyhow::Result<u64> {
            Ok(0)
        }

        async fn get(&self, _item_id: i64) -> anyhow::Result<Option<Sku>> {
            Ok(None)
        }

        async fn list_active(&self) -> anyhow::Result<Vec<Sku>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn escalates_non_transient_errors() {
        let conn = Connection::open_in_memory().await.expect("open sqlite");
        let manufacturers: Arc<dyn ManufacturerRepository> = Arc::new(
            SqliteManufacturerRepository::init(conn.clone())
                .await
                .expect("init manufacturers"),
        );
        let category_paths: Arc<dyn CategoryPathRepository> = Arc::new(
            SqliteCategoryPathRepository::init(conn.clone())
                .await
                .expect("init category paths"),
        );
        let products: Arc<dyn ProductRepository> = Arc::new(
            SqliteProductRepository::init(conn).await.expect("init products"),
        );
        let upserter = BatchUpserter::new(
            manufacturers,
            category_paths,
            products,
            Arc::new(BrokenSkuRepository),
            4,
            Duration::from_millis(1),
        );
        let err = upserter
            .upsert_chunk(Uuid::new_v4(), &[row(1001, 9001)])
            .await
            .expect_err("must escalate");
        assert!(err.to_string().contains("sku table is gone"));
    }

    #[test]
    fn classifies_busy_and_locked_as_transient() {
        let busy: anyhow::Error = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        )
        .into();
        assert!(is_transient_conflict(&busy));

        let locked: anyhow::Error = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            None,
        )
        .into();
        assert!(is_transient_conflict(&locked.context("while writing a chunk")));

        let other = anyhow!("connection refused");
        assert!(!is_transient_conflict(&other));
    }
}
