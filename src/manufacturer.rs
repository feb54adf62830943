use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Transaction, TransactionBehavior};
use time::OffsetDateTime;
use tokio_rusqlite::Connection;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manufacturer {
    pub id: i64,
    pub name: String,
}

#[async_trait]
pub trait ManufacturerRepository: Send + Sync {
    async fn upsert_many(&self, manufacturers: Vec<Manufacturer>) -> anyhow::Result<()>;
    async fn get(&self, id: i64) -> anyhow::Result<Option<Manufacturer>>;
}

pub struct SqliteManufacturerRepository {
    conn: Connection,
}

impl SqliteManufacturerRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            let _ = conn.pragma_update(None, "journal_mode", &"WAL");
            let _ = conn.pragma_update(None, "synchronous", &"NORMAL");
            let _ = conn.pragma_update(None, "busy_timeout", &5000i64);
            conn.execute(
                "CREATE TABLE IF NOT EXISTS manufacturer (
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
impl ManufacturerRepository for SqliteManufacturerRepository {
    async fn upsert_many(&self, manufacturers: Vec<Manufacturer>) -> anyhow::Result<()> {
        if manufacturers.is_empty() {
            return Ok(());
        }
        self.conn
            .call(move |conn| {
                let tx = Transaction::new(conn, TransactionBehavior::Deferred)?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO manufacturer (id, name, updated_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(id) DO UPDATE SET
                            name = excluded.name,
                            updated_at = excluded.updated_at",
                    )?;
                    let now = OffsetDateTime::now_utc().unix_timestamp();
                    for m in manufacturers {
                        stmt.execute(params![m.id, m.name, now])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .context("Unable to upsert manufacturers")
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<Manufacturer>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT id, name FROM manufacturer WHERE id = ?1")?;
                let m = stmt
                    .query_map([id], |row| {
                        Ok(Manufacturer {
                            id: row.get(0)?,
                            name: row.get(1)?,
                        })
                    })?
                    .next()
                    .transpose()?;
                Ok(m)
            })
            .await
            .context("Unable to get manufacturer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_overwrites_name_by_external_id() {
        let conn = Connection::open_in_memory().await.expect("open sqlite");
        let repo = SqliteManufacturerRepository::init(conn).await.expect("init");
        repo.upsert_many(vec![Manufacturer {
            id: 55,
            name: "Acme Medical".to_string(),
        }])
        .await
        .expect("first upsert");
        repo.upsert_many(vec![Manufacturer {
            id: 55,
            name: "Acme Medical Inc".to_string(),
        }])
        .await
        .expect("second upsert");
        let m = repo.get(55).await.expect("get").expect("manufacturer");
        assert_eq!(m.name, "Acme Medical Inc");
    }
}
