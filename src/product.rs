use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Transaction, TransactionBehavior};
use time::OffsetDateTime;
use tokio_rusqlite::Connection;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub manufacturer_id: Option<i64>,
    pub category_path_id: Option<i64>,
}

#[async_trait]
pub trait ProductRepository: Send + Sync {
    async fn upsert_many(&self, products: Vec<Product>) -> anyhow::Result<()>;
    async fn get(&self, id: i64) -> anyhow::Result<Option<Product>>;
    async fn list(&self) -> anyhow::Result<Vec<Product>>;
}

pub struct SqliteProductRepository {
    conn: Connection,
}

fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        manufacturer_id: row.get(3)?,
        category_path_id: row.get(4)?,
    })
}

impl SqliteProductRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS product (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT,
                    manufacturer_id INTEGER,
                    category_path_id INTEGER,
                    updated_at INTEGER NOT NULL
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ProductRepository for SqliteProductRepository {
    async fn upsert_many(&self, products: Vec<Product>) -> anyhow::Result<()> {
        if products.is_empty() {
            return Ok(());
        }
        self.conn
            .call(move |conn| {
                let tx = Transaction::new(conn, TransactionBehavior::Deferred)?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO product (id, name, description, manufacturer_id, category_path_id, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                         ON CONFLICT(id) DO UPDATE SET
                            name = excluded.name,
                            description = excluded.description,
                            manufacturer_id = excluded.manufacturer_id,
                            category_path_id = excluded.category_path_id,
                            updated_at = excluded.updated_at",
                    )?;
                    let now = OffsetDateTime::now_utc().unix_timestamp();
                    for p in products {
                        stmt.execute(params![
                            p.id,
                            p.name,
                            p.description,
                            p.manufacturer_id,
                            p.category_path_id,
                            now
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .context("Unable to upsert products")
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<Product>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, manufacturer_id, category_path_id
                     FROM product WHERE id = ?1",
                )?;
                let p = stmt.query_map([id], row_to_product)?.next().transpose()?;
                Ok(p)
            })
            .await
            .context("Unable to get product")
    }

    async fn list(&self) -> anyhow::Result<Vec<Product>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, manufacturer_id, category_path_id
                     FROM product ORDER BY id",
                )?;
                let products = stmt
                    .query_map([], row_to_product)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(products)
            })
            .await
            .context("Unable to list products")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_is_idempotent_by_external_id() {
        let conn = Connection::open_in_memory().await.expect("open sqlite");
        let repo = SqliteProductRepository::init(conn).await.expect("init");
        let product = Product {
            id: 9001,
            name: "Nitrile Exam Gloves".to_string(),
            description: Some("Powder-free".to_string()),
            manufacturer_id: Some(55),
            category_path_id: Some(7),
        };
        repo.upsert_many(vec![product.clone()]).await.expect("upsert");
        repo.upsert_many(vec![product.clone()]).await.expect("re-upsert");
        assert_eq!(repo.list().await.expect("list"), vec![product]);
    }
}
