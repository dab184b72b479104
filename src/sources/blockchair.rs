use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::http::fetch_json;
use super::{BlockSource, FetchError, FetchOutcome, RateLimiter};
use crate::config::Settings;

pub const BLOCKCHAIR_BASE_URL: &str = "https://api.blockchair.com";

// Dashboard page sizes; a short page ends pagination.
const BLOCK_PAGE_LIMIT: usize = 1000;
const TX_PAGE_LIMIT: usize = 10000;
// Comma-joined detail endpoints accept at most this many keys per request.
const ADDRESS_BATCH_SIZE: usize = 10;
const HEIGHT_BATCH_SIZE: usize = 10;

/// Adapter for the Blockchair HTTP API. One instance per process; the rate
/// limiter is shared so concurrent per-coin fetches draw from one budget.
pub struct BlockchairAdapter {
    client: Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
    timeout: Duration,
    max_attempts: u32,
}

impl BlockchairAdapter {
    pub fn new(settings: &Settings) -> Self {
        Self::with_base_url(settings, BLOCKCHAIR_BASE_URL)
    }

    pub fn with_base_url(settings: &Settings, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            limiter: Arc::new(RateLimiter::per_minute(settings.blockchair_rate_limit_rpm)),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: settings.http_timeout,
            max_attempts: settings.max_fetch_attempts,
        }
    }

    /// GET `{base}/{coin}/{path}` and unwrap the `data` envelope.
    async fn fetch_data(&self, coin: &str, path: &str, query: &[(&str, String)]) -> Result<Value, FetchError> {
        let url = format!("{}/{}/{}", self.base_url, coin.to_lowercase(), path);
        let body = fetch_json(&self.client, &self.limiter, self.timeout, self.max_attempts, &url, query).await?;

        match body.get("data") {
            Some(data) => Ok(data.clone()),
            None => Err(FetchError::Shape {
                url,
                message: "missing 'data' envelope".to_string(),
            }),
        }
    }

    /// Paginate one dashboard endpoint. A page that fails with a
    /// non-retryable error ends pagination and is counted; the records from
    /// earlier pages are kept. Exhausted retries fail the whole fetch.
    async fn fetch_dashboard_pages(
        &self,
        coin: &str,
        path: &str,
        date: NaiveDate,
        page_limit: usize,
    ) -> Result<FetchOutcome<Value>, FetchError> {
        let mut records = Vec::new();
        let mut failed_pages = 0u32;
        let mut offset = 0usize;

        loop {
            let query = [
                ("date", date.format("%Y-%m-%d").to_string()),
                ("limit", page_limit.to_string()),
                ("offset", offset.to_string()),
            ];
            let data = match self.fetch_data(coin, path, &query).await {
                Ok(data) => data,
                Err(err @ FetchError::RetriesExhausted { .. }) => return Err(err),
                Err(err) => {
                    warn!(
                        "Page at offset {} of {}/{} failed, keeping {} records from earlier pages: {}",
                        offset, coin, path, records.len(), err
                    );
                    failed_pages += 1;
                    break;
                }
            };

            let page = match data {
                Value::Array(items) => items,
                // Some dashboards key records by identifier instead.
                Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
                other => {
                    warn!(
                        "Page at offset {} of {}/{} had unexpected shape {}, ending pagination",
                        offset, coin, path, type_name(&other)
                    );
                    failed_pages += 1;
                    break;
                }
            };

            let page_len = page.len();
            records.extend(page);
            if page_len < page_limit {
                break;
            }
            offset += page_len;
        }

        info!(
            "Fetched {} raw records from blockchair {}/{} for {} ({} failed pages)",
            records.len(), coin, path, date, failed_pages
        );
        Ok(FetchOutcome::new(records, failed_pages))
    }
}

#[async_trait]
impl BlockSource for BlockchairAdapter {
    fn source_name(&self) -> &'static str {
        "blockchair"
    }

    async fn fetch_blocks(&self, coin: &str, date: NaiveDate) -> Result<FetchOutcome<Value>, FetchError> {
        self.fetch_dashboard_pages(coin, "dashboards/blocks", date, BLOCK_PAGE_LIMIT).await
    }

    async fn fetch_blocks_by_height(
        &self,
        coin: &str,
        start: i64,
        end: i64,
    ) -> Result<FetchOutcome<Value>, FetchError> {
        let heights: Vec<String> = (start..=end).map(|h| h.to_string()).collect();
        let mut records = Vec::new();
        let mut failed_pages = 0u32;

        // The block-detail endpoint takes comma-joined heights and returns a
        // map of height to details, with the height repeated under `id`.
        // Batches are independent, so a failed one is skipped and counted.
        for batch in heights.chunks(HEIGHT_BATCH_SIZE) {
            let path = format!("blocks/{}", batch.join(","));
            match self.fetch_data(coin, &path, &[]).await {
                Ok(Value::Object(map)) => {
                    for (height, mut details) in map {
                        if details.get("id").is_none() {
                            if let Some(obj) = details.as_object_mut() {
                                obj.insert("id".to_string(), Value::String(height));
                            }
                        }
                        records.push(details);
                    }
                }
                Ok(other) => {
                    warn!(
                        "Height batch {} for {} had unexpected shape {}, skipping",
                        batch.join(","), coin, type_name(&other)
                    );
                    failed_pages += 1;
                }
                Err(err @ FetchError::RetriesExhausted { .. }) => return Err(err),
                Err(err) => {
                    warn!("Height batch {} for {} failed, skipping: {}", batch.join(","), coin, err);
                    failed_pages += 1;
                }
            }
        }

        info!(
            "Fetched {} raw blocks from blockchair {} heights {}..={} ({} failed batches)",
            records.len(), coin, start, end, failed_pages
        );
        Ok(FetchOutcome::new(records, failed_pages))
    }

    async fn fetch_transactions(&self, coin: &str, date: NaiveDate) -> Result<FetchOutcome<Value>, FetchError> {
        self.fetch_dashboard_pages(coin, "dashboards/transactions", date, TX_PAGE_LIMIT).await
    }

    async fn fetch_addresses(
        &self,
        coin: &str,
        addresses: &[String],
    ) -> Result<FetchOutcome<(String, Value)>, FetchError> {
        let mut records = Vec::new();
        let mut failed_pages = 0u32;

        for batch in addresses.chunks(ADDRESS_BATCH_SIZE) {
            let path = format!("dashboards/addresses/{}", batch.join(","));
            match self.fetch_data(coin, &path, &[]).await {
                Ok(Value::Object(map)) => {
                    for (address, details) in map {
                        // Per-address payloads nest the summary under "address",
                        // next to the transaction list we do not ingest.
                        let summary = details.get("address").cloned().unwrap_or(details);
                        records.push((address, summary));
                    }
                }
                Ok(other) => {
                    warn!(
                        "Address batch for {} had unexpected shape {}, skipping",
                        coin, type_name(&other)
                    );
                    failed_pages += 1;
                }
                Err(err @ FetchError::RetriesExhausted { .. }) => return Err(err),
                Err(err) => {
                    warn!("Address batch for {} failed, skipping: {}", coin, err);
                    failed_pages += 1;
                }
            }
        }

        info!(
            "Fetched {} raw addresses from blockchair {} ({} failed batches)",
            records.len(), coin, failed_pages
        );
        Ok(FetchOutcome::new(records, failed_pages))
    }

    async fn latest_block_height(&self, coin: &str) -> Result<i64, FetchError> {
        let url = format!("{}/{}/stats", self.base_url, coin.to_lowercase());
        let data = self.fetch_data(coin, "stats", &[]).await?;

        data.get("blocks").and_then(Value::as_i64).ok_or(FetchError::Shape {
            url,
            message: "stats payload missing 'blocks'".to_string(),
        })
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
