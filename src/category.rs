use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{params, Transaction, TransactionBehavior};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_rusqlite::Connection;
use typesafe_repository::async_ops::{Get, List, Save};
use typesafe_repository::macros::Id;
use typesafe_repository::prelude::*;

/// A materialized category tree node, keyed by its full `>`-joined path.
/// Nodes are only ever added by imports, never removed.
#[derive(Id, Clone, Debug, PartialEq, Eq)]
pub struct Category {
    #[id]
    pub path: String,
    pub name: String,
    pub parent_path: Option<String>,
    pub depth: u32,
}

#[async_trait]
pub trait CategoryRepository:
    Repository<Category, Error = anyhow::Error>
    + Save<Category>
    + Get<Category>
    + List<Category>
    + Send
    + Sync
{
    /// Inserts the nodes that do not exist yet, skipping duplicates.
    /// Returns the number of newly inserted nodes.
    async fn insert_missing(&self, nodes: Vec<Category>) -> Result<usize, Self::Error>;
}

pub struct SqliteCategoryRepository {
    conn: Connection,
}

fn row_to_category(row: &rusqlite::Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        path: row.get(0)?,
        name: row.get(1)?,
        parent_path: row.get(2)?,
        depth: row.get(3)?,
    })
}

impl SqliteCategoryRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS category (
                    path TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    parent_path TEXT,
                    depth INTEGER NOT NULL
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

impl Repository<Category> for SqliteCategoryRepository {
    type Error = anyhow::Error;
}

#[async_trait]
impl Save<Category> for SqliteCategoryRepository {
    async fn save(&self, c: Category) -> Result<(), Self::Error> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO category (path, name, parent_path, depth) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(path) DO UPDATE SET
                        name = excluded.name,
                        parent_path = excluded.parent_path,
                        depth = excluded.depth",
                    params![c.path, c.name, c.parent_path, c.depth],
                )?;
                Ok(())
            })
            .await
            .context("Unable to save category")
    }
}

#[async_trait]
impl Get<Category> for SqliteCategoryRepository {
    async fn get_one(&self, id: &IdentityOf<Category>) -> Result<Option<Category>, Self::Error> {
        let path = id.clone();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT path, name, parent_path, depth FROM category WHERE path = ?1",
                )?;
                let c = stmt.query_map([path], row_to_category)?.next().transpose()?;
                Ok(c)
            })
            .await
            .context("Unable to get category")
    }
}

#[async_trait]
impl List<Category> for SqliteCategoryRepository {
    async fn list(&self) -> Result<Vec<Category>, Self::Error> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT path, name, parent_path, depth FROM category ORDER BY path",
                )?;
                let categories = stmt
                    .query_map([], row_to_category)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(categories)
            })
            .await
            .context("Unable to list categories")
    }
}

#[async_trait]
impl CategoryRepository for SqliteCategoryRepository {
    async fn insert_missing(&self, nodes: Vec<Category>) -> Result<usize, Self::Error> {
        if nodes.is_empty() {
            return Ok(0);
        }
        self.conn
            .call(move |conn| {
                let tx = Transaction::new(conn, TransactionBehavior::Deferred)?;
                let mut inserted = 0usize;
                {
                    let mut stmt = tx.prepare(
                        "INSERT OR IGNORE INTO category (path, name, parent_path, depth)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for node in nodes {
                        inserted +=
                            stmt.execute(params![node.path, node.name, node.parent_path, node.depth])?;
                    }
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await
            .context("Unable to insert category nodes")
    }
}

/// Shared snapshot of the materialized tree, loaded on first use and
/// dropped whenever an import adds nodes.
#[derive(Default)]
pub struct CategoryTreeCache {
    tree: RwLock<Option<Arc<Vec<Category>>>>,
}

impl CategoryTreeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_load(
        &self,
        repo: &Arc<dyn CategoryRepository>,
    ) -> anyhow::Result<Arc<Vec<Category>>> {
        if let Some(tree) = self.tree.read().await.clone() {
            return Ok(tree);
        }
        let tree = Arc::new(repo.list().await?);
        *self.tree.write().await = Some(tree.clone());
        Ok(tree)
    }

    pub async fn invalidate(&self) {
        *self.tree.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(path: &str, name: &str, parent: Option<&str>, depth: u32) -> Category {
        Category {
            path: path.to_string(),
            name: name.to_string(),
            parent_path: parent.map(ToString::to_string),
            depth,
        }
    }

    #[tokio::test]
    async fn insert_missing_skips_existing_nodes() {
        let conn = Connection::open_in_memory().await.expect("open sqlite");
        let repo = SqliteCategoryRepository::init(conn).await.expect("init");
        let nodes = vec![
            node("Dental", "Dental", None, 0),
            node("Dental>Anesthetics", "Anesthetics", Some("Dental"), 1),
        ];
        assert_eq!(repo.insert_missing(nodes.clone()).await.expect("insert"), 2);
        assert_eq!(repo.insert_missing(nodes).await.expect("re-insert"), 0);
        assert_eq!(repo.list().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn cache_reloads_after_invalidation() {
        let conn = Connection::open_in_memory().await.expect("open sqlite");
        let repo: Arc<dyn CategoryRepository> =
            Arc::new(SqliteCategoryRepository::init(conn).await.expect("init"));
        let cache = CategoryTreeCache::new();
        assert!(cache.get_or_load(&repo).await.expect("load").is_empty());

        repo.insert_missing(vec![node("Dental", "Dental", None, 0)])
            .await
            .expect("insert");
        // Still the cached empty snapshot until invalidated.
        assert!(cache.get_or_load(&repo).await.expect("cached").is_empty());
        cache.invalidate().await;
        assert_eq!(cache.get_or_load(&repo).await.expect("reload").len(), 1);
    }
}
