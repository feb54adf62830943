use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Transaction, TransactionBehavior};
use time::OffsetDateTime;
use tokio_rusqlite::Connection;

/// The feed's leaf category label, keyed by the supplier's external id.
/// Distinct from the materialized category tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategoryPath {
    pub id: i64,
    pub name: String,
}

#[async_trait]
pub trait CategoryPathRepository: Send + Sync {
    async fn upsert_many(&self, paths: Vec<CategoryPath>) -> anyhow::Result<()>;
    async fn get(&self, id: i64) -> anyhow::Result<Option<CategoryPath>>;
}

pub struct SqliteCategoryPathRepository {
    conn: Connection,
}

impl SqliteCategoryPathRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS category_path (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
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
impl CategoryPathRepository for SqliteCategoryPathRepository {
    async fn upsert_many(&self, paths: Vec<CategoryPath>) -> anyhow::Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        self.conn
            .call(move |conn| {
                let tx = Transaction::new(conn, TransactionBehavior::Deferred)?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO category_path (id, name, updated_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(id) DO UPDATE SET
                            name = excluded.name,
                            updated_at = excluded.updated_at",
                    )?;
                    let now = OffsetDateTime::now_utc().unix_timestamp();
                    for p in paths {
                        stmt.execute(params![p.id, p.name, now])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .context("Unable to upsert category paths")
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<CategoryPath>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT id, name FROM category_path WHERE id = ?1")?;
                let p = stmt
                    .query_map([id], |row| {
                        Ok(CategoryPath {
                            id: row.get(0)?,
                            name: row.get(1)?,
                        })
                    })?
                    .next()
                    .transpose()?;
                Ok(p)
            })
            .await
            .context("Unable to get category path")
    }
}
