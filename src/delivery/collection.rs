//! Key-value collection sink for snapshot sources
//!
//! Snapshot sources replace the whole collection on every run: the collection
//! is emptied first, then the new records are inserted in batches.

use async_trait::async_trait;
use url::Url;

use super::DeliveryClient;
use crate::batch::chunk;
use crate::error::{Error, Result};
use crate::types::Event;

/// Destination for replace-all record sets
#[async_trait]
pub trait CollectionSink: Send + Sync {
    /// Delete every record of `collection`
    async fn empty_collection(&self, collection: &str, token: &str) -> Result<()>;

    /// Insert `records` into `collection` in one request
    async fn insert_batch(&self, collection: &str, records: &[Event], token: &str) -> Result<()>;
}

/// Collection REST API client (`Authorization: Bearer <token>`)
#[derive(Clone, Debug)]
pub struct CollectionClient {
    client: DeliveryClient,
    base: Url,
}

impl CollectionClient {
    /// Client for the API rooted at `base_url`
    pub fn new(client: DeliveryClient, base_url: &str) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| Error::config(format!("invalid URL: {}", e), "delivery.collections_url"))?;
        // Url::join replaces the last segment unless the base ends with a slash
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { client, base })
    }

    fn data_url(&self, collection: &str, suffix: &str) -> Result<Url> {
        let relative = format!(
            "storage/collections/data/{}{}",
            urlencoding::encode(collection),
            suffix
        );
        self.base
            .join(&relative)
            .map_err(|e| Error::Other(format!("Failed to build collection URL: {}", e)))
    }
}

#[async_trait]
impl CollectionSink for CollectionClient {
    async fn empty_collection(&self, collection: &str, token: &str) -> Result<()> {
        let url = self.data_url(collection, "")?;
        let authorization = format!("Bearer {}", token);

        self.client
            .send(|http| {
                http.delete(url.clone())
                    .header(reqwest::header::AUTHORIZATION, &authorization)
            })
            .await?;

        tracing::info!(collection, "Emptied collection");
        Ok(())
    }

    async fn insert_batch(&self, collection: &str, records: &[Event], token: &str) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let url = self.data_url(collection, "/batch_save")?;
        let authorization = format!("Bearer {}", token);

        self.client
            .send(|http| {
                http.post(url.clone())
                    .header(reqwest::header::AUTHORIZATION, &authorization)
                    .json(records)
            })
            .await?;

        tracing::debug!(collection, records = records.len(), "Inserted collection batch");
        Ok(())
    }
}

/// Replace the contents of `collection` with `records`
///
/// Empties the collection, then inserts `batch_size` records per request.
/// A failure after the collection was emptied leaves it partially filled;
/// the next successful run restores it.
pub async fn replace_collection(
    sink: &dyn CollectionSink,
    collection: &str,
    records: &[Event],
    batch_size: usize,
    token: &str,
) -> Result<usize> {
    let batches = chunk(records, batch_size)?;

    sink.empty_collection(collection, token).await?;
    for batch in &batches {
        sink.insert_batch(collection, batch, token).await?;
    }

    tracing::info!(
        collection,
        records = records.len(),
        batches = batches.len(),
        "Replaced collection"
    );
    Ok(records.len())
}
