use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Terminal (and one in-flight) status of an ingestion run, stored as the
/// short strings the transformation layer queries against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestionStatus {
    Running,
    Succeeded,
    PartiallySucceeded,
    Failed,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Running => "running",
            IngestionStatus::Succeeded => "success",
            IngestionStatus::PartiallySucceeded => "partial",
            IngestionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct NewIngestionLog {
    pub source: String,
    pub data_kind: String,
    pub coin_symbol: Option<String>,
    pub target_date: Option<NaiveDate>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IngestionLogRow {
    pub id: i64,
    pub source: String,
    pub data_kind: String,
    pub coin_symbol: Option<String>,
    pub target_date: Option<NaiveDate>,
    pub status: String,
    pub records_fetched: i64,
    pub records_written: i64,
    pub records_failed: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CoinMetadataRow {
    pub id: i32,
    pub symbol: String,
    pub name: String,
    pub coingecko_id: Option<String>,
    pub blockchair_id: Option<String>,
    pub is_active: bool,
    pub ingestion_enabled: bool,
    pub last_ingested_date: Option<NaiveDate>,
}

/// Result of one batched upsert. Conflicts resolved by the entity's policy
/// are not failures; `failed` counts records in chunks that could not be
/// written after a retry.
#[derive(Debug, Clone, Default)]
pub struct UpsertOutcome {
    pub written: u64,
    pub conflicts: u64,
    pub failed: u64,
    pub chunk_failures: Vec<ChunkFailure>,
}

impl UpsertOutcome {
    pub fn merge(&mut self, other: UpsertOutcome) {
        self.written += other.written;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
        self.chunk_failures.extend(other.chunk_failures);
    }
}

#[derive(Debug, Clone)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub records: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WarehouseStats {
    pub total_blocks: i64,
    pub total_transactions: i64,
    pub total_addresses: i64,
    pub total_price_records: i64,
    pub total_log_rows: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct MarketPriceRow {
    pub coin_id: String,
    pub price_date: NaiveDate,
    pub price_usd: Option<Decimal>,
    pub volume_usd: Option<Decimal>,
    pub market_cap_usd: Option<Decimal>,
}
