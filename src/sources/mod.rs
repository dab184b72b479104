pub mod blockchair;
pub mod coingecko;
mod http;
pub mod rate_limit;

pub use blockchair::BlockchairAdapter;
pub use coingecko::CoinGeckoAdapter;
pub use rate_limit::RateLimiter;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("source returned status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("malformed JSON from {url}: {message}")]
    Json { url: String, message: String },
    #[error("retries exhausted after {attempts} attempts for {url}: {message}")]
    RetriesExhausted {
        attempts: u32,
        url: String,
        message: String,
    },
    #[error("unexpected payload shape from {url}: {message}")]
    Shape { url: String, message: String },
}

/// Records from one multi-page fetch. A page or batch that fails with a
/// non-retryable error is counted here instead of discarding the records
/// already fetched; only an exhausted retry budget surfaces as `Err`
/// (whole-source failure).
#[derive(Debug)]
pub struct FetchOutcome<T> {
    pub records: Vec<T>,
    pub failed_pages: u32,
}

impl<T> FetchOutcome<T> {
    pub fn new(records: Vec<T>, failed_pages: u32) -> Self {
        Self { records, failed_pages }
    }
}

/// Blockchain-data source seam. Raw JSON records cross this boundary
/// unvalidated; the schema layer is the single point of trust.
#[async_trait]
pub trait BlockSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// All blocks confirmed on `date`, one raw object per block.
    async fn fetch_blocks(&self, coin: &str, date: NaiveDate) -> Result<FetchOutcome<Value>, FetchError>;

    /// Blocks in an explicit inclusive height range (backfill path).
    async fn fetch_blocks_by_height(
        &self,
        coin: &str,
        start: i64,
        end: i64,
    ) -> Result<FetchOutcome<Value>, FetchError>;

    /// All transactions confirmed on `date`.
    async fn fetch_transactions(&self, coin: &str, date: NaiveDate) -> Result<FetchOutcome<Value>, FetchError>;

    /// Per-address activity, (address, raw dashboard object) pairs.
    async fn fetch_addresses(
        &self,
        coin: &str,
        addresses: &[String],
    ) -> Result<FetchOutcome<(String, Value)>, FetchError>;

    /// Chain tip height, used to bound height-range backfills.
    async fn latest_block_height(&self, coin: &str) -> Result<i64, FetchError>;
}

/// Market-data source seam: at most one raw price object per (coin, date).
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// The `market_data` object for the given day, or `None` when the source
    /// has no snapshot for that date.
    async fn fetch_price(&self, coin_id: &str, date: NaiveDate) -> Result<Option<Value>, FetchError>;
}
