use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Transaction, TransactionBehavior};
use rust_decimal::Decimal;
use std::collections::HashSet;
use time::OffsetDateTime;
use tokio_rusqlite::Connection;
use uuid::Uuid;

/// One orderable supplier item. `is_active` is the lifecycle signal:
/// set when the SKU appears in an import run, cleared by the
/// stale-deactivation pass for SKUs the current run never stamped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sku {
    pub item_id: i64,
    pub product_id: i64,
    pub item_description: Option<String>,
    pub image_url: Option<String>,
    pub ndc_item_code: Option<String>,
    pub package: Option<String>,
    pub unit_price: Option<Decimal>,
    pub price_description: Option<String>,
    pub availability: Option<String>,
    pub packing_list_description: Option<String>,
    pub unit_weight: Option<Decimal>,
    pub unit_volume: Option<Decimal>,
    pub uom_factor: Option<Decimal>,
    pub country_of_origin: Option<String>,
    pub tariff_code: Option<String>,
    pub hazmat_code: Option<String>,
    pub hazmat_class: Option<String>,
    pub pharmacy_product_type: Option<String>,
    pub national_drug_code: Option<String>,
    pub brand_id: Option<i64>,
    pub brand_name: Option<String>,
    pub is_active: bool,
    pub last_seen_import_run_id: Option<Uuid>,
    pub last_seen_at: Option<OffsetDateTime>,
}

impl Sku {
    fn decimal_to_db(value: &Option<Decimal>) -> Option<String> {
        value.as_ref().map(ToString::to_string)
    }

    fn decimal_from_db(raw: Option<String>) -> Option<Decimal> {
        raw.and_then(|s| s.parse::<Decimal>().ok())
    }
}

#[async_trait]
pub trait SkuRepository: Send + Sync {
    /// Which of the given item ids already exist in the catalog.
    async fn existing_ids(&self, item_ids: &[i64]) -> anyhow::Result<HashSet<i64>>;
    async fn upsert_many(&self, skus: Vec<Sku>) -> anyhow::Result<()>;
    /// Deactivates every active SKU whose last-seen stamp is not `run_id`.
    /// Returns the number of SKUs deactivated.
    async fn deactivate_not_seen(&self, run_id: Uuid) -> anyhow::Result<u64>;
    async fn get(&self, item_id: i64) -> anyhow::Result<Option<Sku>>;
    async fn list_active(&self) -> anyhow::Result<Vec<Sku>>;
}

pub struct SqliteSkuRepository {
    conn: Connection,
}

const SKU_COLUMNS: &str = "item_id, product_id, item_description, image_url, ndc_item_code, package,
     unit_price, price_description, availability, packing_list_description, unit_weight,
     unit_volume, uom_factor, country_of_origin, tariff_code, hazmat_code, hazmat_class,
     pharmacy_product_type, national_drug_code, brand_id, brand_name, is_active,
     last_seen_import_run_id, last_seen_at";

fn row_to_sku(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sku> {
    let last_seen_at: Option<i64> = row.get(23)?;
    Ok(Sku {
        item_id: row.get(0)?,
        product_id: row.get(1)?,
        item_description: row.get(2)?,
        image_url: row.get(3)?,
        ndc_item_code: row.get(4)?,
        package: row.get(5)?,
        unit_price: Sku::decimal_from_db(row.get(6)?),
        price_description: row.get(7)?,
        availability: row.get(8)?,
        packing_list_description: row.get(9)?,
        unit_weight: Sku::decimal_from_db(row.get(10)?),
        unit_volume: Sku::decimal_from_db(row.get(11)?),
        uom_factor: Sku::decimal_from_db(row.get(12)?),
        country_of_origin: row.get(13)?,
        tariff_code: row.get(14)?,
        hazmat_code: row.get(15)?,
        hazmat_class: row.get(16)?,
        pharmacy_product_type: row.get(17)?,
        national_drug_code: row.get(18)?,
        brand_id: row.get(19)?,
        brand_name: row.get(20)?,
        is_active: row.get::<_, i64>(21)? != 0,
        last_seen_import_run_id: row.get(22)?,
        last_seen_at: last_seen_at
            .map(|ts| OffsetDateTime::from_unix_timestamp(ts).unwrap_or(OffsetDateTime::UNIX_EPOCH)),
    })
}

impl SqliteSkuRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            let _ = conn.pragma_update(None, "journal_mode", &"WAL");
            let _ = conn.pragma_update(None, "synchronous", &"NORMAL");
            let _ = conn.pragma_update(None, "busy_timeout", &5000i64);
            conn.execute(
                "CREATE TABLE IF NOT EXISTS sku (
                    item_id INTEGER PRIMARY KEY,
                    product_id INTEGER NOT NULL,
                    item_description TEXT,
                    image_url TEXT,
                    ndc_item_code TEXT,
                    package TEXT,
                    unit_price TEXT,
                    price_description TEXT,
                    availability TEXT,
                    packing_list_description TEXT,
                    unit_weight TEXT,
                    unit_volume TEXT,
                    uom_factor TEXT,
                    country_of_origin TEXT,
                    tariff_code TEXT,
                    hazmat_code TEXT,
                    hazmat_class TEXT,
                    pharmacy_product_type TEXT,
                    national_drug_code TEXT,
                    brand_id INTEGER,
                    brand_name TEXT,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    last_seen_import_run_id BLOB,
                    last_seen_at INTEGER
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_sku_active_last_seen
                 ON sku (is_active, last_seen_import_run_id)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SkuRepository for SqliteSkuRepository {
    async fn existing_ids(&self, item_ids: &[i64]) -> anyhow::Result<HashSet<i64>> {
        let item_ids = item_ids.to_vec();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT 1 FROM sku WHERE item_id = ?1")?;
                let mut found = HashSet::new();
                for id in item_ids {
                    if stmt.exists([id])? {
                        found.insert(id);
                    }
                }
                Ok(found)
            })
            .await
            .context("Unable to check existing SKU ids")
    }

    async fn upsert_many(&self, skus: Vec<Sku>) -> anyhow::Result<()> {
        if skus.is_empty() {
            return Ok(());
        }
        self.conn
            .call(move |conn| {
                let tx = Transaction::new(conn, TransactionBehavior::Deferred)?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO sku (item_id, product_id, item_description, image_url,
                            ndc_item_code, package, unit_price, price_description, availability,
                            packing_list_description, unit_weight, unit_volume, uom_factor,
                            country_of_origin, tariff_code, hazmat_code, hazmat_class,
                            pharmacy_product_type, national_drug_code, brand_id, brand_name,
                            is_active, last_seen_import_run_id, last_seen_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                            ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
                         ON CONFLICT(item_id) DO UPDATE SET
                            product_id = excluded.product_id,
                            item_description = excluded.item_description,
                            image_url = excluded.image_url,
                            ndc_item_code = excluded.ndc_item_code,
                            package = excluded.package,
                            unit_price = excluded.unit_price,
                            price_description = excluded.price_description,
                            availability = excluded.availability,
                            packing_list_description = excluded.packing_list_description,
                            unit_weight = excluded.unit_weight,
                            unit_volume = excluded.unit_volume,
                            uom_factor = excluded.uom_factor,
                            country_of_origin = excluded.country_of_origin,
                            tariff_code = excluded.tariff_code,
                            hazmat_code = excluded.hazmat_code,
                            hazmat_class = excluded.hazmat_class,
                            pharmacy_product_type = excluded.pharmacy_product_type,
                            national_drug_code = excluded.national_drug_code,
                            brand_id = excluded.brand_id,
                            brand_name = excluded.brand_name,
                            is_active = excluded.is_active,
                            last_seen_import_run_id = excluded.last_seen_import_run_id,
                            last_seen_at = excluded.last_seen_at",
                    )?;
                    for sku in skus {
                        stmt.execute(params![
                            sku.item_id,
                            sku.product_id,
                            sku.item_description,
                            sku.image_url,
                            sku.ndc_item_code,
                            sku.package,
                            Sku::decimal_to_db(&sku.unit_price),
                            sku.price_description,
                            sku.availability,
                            sku.packing_list_description,
                            Sku::decimal_to_db(&sku.unit_weight),
                            Sku::decimal_to_db(&sku.unit_volume),
                            Sku::decimal_to_db(&sku.uom_factor),
                            sku.country_of_origin,
                            sku.tariff_code,
                            sku.hazmat_code,
                            sku.hazmat_class,
                            sku.pharmacy_product_type,
                            sku.national_drug_code,
                            sku.brand_id,
                            sku.brand_name,
                            sku.is_active as i64,
                            sku.last_seen_import_run_id,
                            sku.last_seen_at.map(|ts| ts.unix_timestamp()),
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .context("Unable to upsert SKUs")
    }

    async fn deactivate_not_seen(&self, run_id: Uuid) -> anyhow::Result<u64> {
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE sku SET is_active = 0
                     WHERE is_active = 1
                       AND (last_seen_import_run_id IS NULL OR last_seen_import_run_id != ?1)",
                    params![run_id],
                )?;
                Ok(changed as u64)
            })
            .await
            .context("Unable to deactivate stale SKUs")
    }

    async fn get(&self, item_id: i64) -> anyhow::Result<Option<Sku>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {SKU_COLUMNS} FROM sku WHERE item_id = ?1"))?;
                let sku = stmt.query_map([item_id], row_to_sku)?.next().transpose()?;
                Ok(sku)
            })
            .await
            .context("Unable to get SKU")
    }

    async fn list_active(&self) -> anyhow::Result<Vec<Sku>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SKU_COLUMNS} FROM sku WHERE is_active = 1 ORDER BY item_id"
                ))?;
                let skus = stmt
                    .query_map([], row_to_sku)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(skus)
            })
            .await
            .context("Unable to list active SKUs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sku(item_id: i64, run_id: Uuid) -> Sku {
        Sku {
            item_id,
            product_id: 9001,
            item_description: Some("Box of 100".to_string()),
            image_url: None,
            ndc_item_code: Some("12345-678-90".to_string()),
            package: Some("BX".to_string()),
            unit_price: Some(dec!(12.99)),
            price_description: Some("per box".to_string()),
            availability: Some("In Stock".to_string()),
            packing_list_description: None,
            unit_weight: Some(dec!(0.45)),
            unit_volume: None,
            uom_factor: Some(dec!(1)),
            country_of_origin: Some("US".to_string()),
            tariff_code: None,
            hazmat_code: None,
            hazmat_class: None,
            pharmacy_product_type: Some("OTC".to_string()),
            national_drug_code: None,
            brand_id: Some(77),
            brand_name: Some("Acme".to_string()),
            is_active: true,
            last_seen_import_run_id: Some(run_id),
            last_seen_at: Some(OffsetDateTime::now_utc()),
        }
    }

    #[tokio::test]
    async fn roundtrips_decimal_fields() {
        let conn = Connection::open_in_memory().await.expect("open sqlite");
        let repo = SqliteSkuRepository::init(conn).await.expect("init");
        let run_id = Uuid::new_v4();
        repo.upsert_many(vec![sku(1001, run_id)]).await.expect("upsert");
        let stored = repo.get(1001).await.expect("get").expect("sku");
        assert_eq!(stored.unit_price, Some(dec!(12.99)));
        assert_eq!(stored.unit_weight, Some(dec!(0.45)));
        assert_eq!(stored.last_seen_import_run_id, Some(run_id));
    }

    #[tokio::test]
    async fn deactivates_skus_not_stamped_by_the_current_run() {
        let conn = Connection::open_in_memory().await.expect("open sqlite");
        let repo = SqliteSkuRepository::init(conn).await.expect("init");
        let first = Uuid::new_v4();
        repo.upsert_many(vec![sku(1, first), sku(2, first), sku(3, first)])
            .await
            .expect("first upsert");

        let second = Uuid::new_v4();
        repo.upsert_many(vec![sku(1, second)]).await.expect("second upsert");
        let deactivated = repo.deactivate_not_seen(second).await.expect("deactivate");
        assert_eq!(deactivated, 2);

        let active: Vec<i64> = repo
            .list_active()
            .await
            .expect("list")
            .into_iter()
            .map(|s| s.item_id)
            .collect();
        assert_eq!(active, vec![1]);
        let stale = repo.get(2).await.expect("get").expect("sku");
        assert!(!stale.is_active);
    }
}
