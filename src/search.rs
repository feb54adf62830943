use anyhow::Context;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;

/// What the search collaborator indexes per active SKU.
#[derive(Clone, Debug, Serialize)]
pub struct SkuDocument {
    pub item_id: i64,
    pub product_id: i64,
    pub product_name: Option<String>,
    pub item_description: Option<String>,
    pub ndc_item_code: Option<String>,
    pub brand_name: Option<String>,
    pub country_of_origin: Option<String>,
    pub unit_price: Option<Decimal>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn reindex(&self, documents: Vec<SkuDocument>) -> anyhow::Result<()>;
}

/// Spools the document list to a file the external indexer picks up.
pub struct FileSearchIndex {
    path: PathBuf,
}

impl FileSearchIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SearchIndex for FileSearchIndex {
    async fn reindex(&self, documents: Vec<SkuDocument>) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&documents).context("Unable to serialize documents")?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, payload)
            .await
            .with_context(|| format!("Unable to write search spool {}", self.path.display()))?;
        Ok(())
    }
}

pub struct NullSearchIndex;

#[async_trait]
impl SearchIndex for NullSearchIndex {
    async fn reindex(&self, documents: Vec<SkuDocument>) -> anyhow::Result<()> {
        log::debug!("Discarding reindex request with {} documents", documents.len());
        Ok(())
    }
}
