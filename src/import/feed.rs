use anyhow::Context;
use futures::StreamExt;
use itertools::Itertools;
use std::collections::HashMap;
use std::path::Path;

/// Every header the supplier feed must carry. Exact and case-sensitive;
/// column order does not matter.
pub const REQUIRED_HEADERS: [&str; 27] = [
    "ItemID",
    "CategoryPathID",
    "CategoryPathName",
    "ManufacturerID",
    "ManufacturerName",
    "ProductID",
    "ProductName",
    "ProductDescription",
    "ItemDescription",
    "ItemImageURL",
    "NDCItemCode",
    "Package",
    "UnitPrice",
    "PriceDescription",
    "Availability",
    "PackingListDescription",
    "UnitWeight",
    "UnitVolume",
    "UOMFactor",
    "CountryOfOrigin",
    "TariffCode",
    "HazmatCode",
    "HazmatClass",
    "PharmacyProductType",
    "NationalDrugCode",
    "BrandID",
    "BrandName",
];

#[derive(Debug)]
pub struct MissingHeaders {
    pub missing: Vec<String>,
}

impl std::fmt::Display for MissingHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Feed is missing required headers: {}",
            self.missing.iter().join(", ")
        )
    }
}

impl std::error::Error for MissingHeaders {}

/// One data row of the feed, keyed by header name. Cells a ragged row
/// did not provide read as absent.
#[derive(Clone, Debug, Default)]
pub struct FeedRecord {
    fields: HashMap<String, String>,
}

impl FeedRecord {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            fields: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, header: &str) -> Option<&str> {
        self.fields.get(header).map(String::as_str)
    }
}

/// Suppliers produce the feed in Windows-1252, not UTF-8. The explicit
/// decode keeps non-ASCII manufacturer and product names intact.
pub async fn read_feed(path: &Path) -> Result<Vec<FeedRecord>, anyhow::Error> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("Unable to read feed file {}", path.display()))?;
    let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(&raw);
    parse_feed(&decoded).await
}

pub(crate) async fn parse_feed(decoded: &str) -> Result<Vec<FeedRecord>, anyhow::Error> {
    let mut rdr = csv_async::AsyncReaderBuilder::new()
        .delimiter(b',')
        .flexible(true)
        .create_reader(decoded.as_bytes());
    let names: Vec<String> = rdr
        .headers()
        .await
        .context("Unable to read feed header line")?
        .iter()
        .map(ToString::to_string)
        .collect();
    let missing: Vec<String> = REQUIRED_HEADERS
        .iter()
        .filter(|required| !names.iter().any(|n| n == *required))
        .map(ToString::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(MissingHeaders { missing }.into());
    }

    let mut records = rdr.records();
    let mut rows = Vec::new();
    while let Some(record) = records.next().await.transpose()? {
        let fields = names
            .iter()
            .cloned()
            .zip(record.iter().map(ToString::to_string))
            .collect();
        rows.push(FeedRecord { fields });
    }
    Ok(rows)
}
