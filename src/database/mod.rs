pub mod migrations;
pub mod models;
pub mod warehouse;

pub use migrations::MigrationRunner;
pub use models::*;
pub use warehouse::Warehouse;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

use crate::schema::{AddressRecord, BlockRecord, MarketPriceRecord, TransactionRecord};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("chunk {chunk_index} write failed: {message}")]
    Chunk { chunk_index: usize, message: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistence seam used by the run coordinator. `Warehouse` is the Postgres
/// implementation; tests substitute an in-memory store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_blocks(&self, blocks: &[BlockRecord], batch_size: usize) -> Result<UpsertOutcome, PersistenceError>;

    async fn upsert_transactions(
        &self,
        transactions: &[TransactionRecord],
        batch_size: usize,
    ) -> Result<UpsertOutcome, PersistenceError>;

    async fn upsert_addresses(
        &self,
        addresses: &[AddressRecord],
        batch_size: usize,
    ) -> Result<UpsertOutcome, PersistenceError>;

    async fn upsert_market_prices(
        &self,
        prices: &[MarketPriceRecord],
        batch_size: usize,
    ) -> Result<UpsertOutcome, PersistenceError>;

    async fn log_run(&self, log: &NewIngestionLog) -> Result<i64, PersistenceError>;

    #[allow(clippy::too_many_arguments)]
    async fn finish_run(
        &self,
        log_id: i64,
        status: IngestionStatus,
        records_fetched: i64,
        records_written: i64,
        records_failed: i64,
        finished_at: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> Result<(), PersistenceError>;

    async fn existing_price_dates(
        &self,
        coin_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<NaiveDate>, PersistenceError>;

    async fn mark_coin_ingested(&self, symbol: &str, date: NaiveDate) -> Result<(), PersistenceError>;
}

/// Open the shared connection pool. The pool is safe for concurrent use by
/// multiple coordinators running in the same scheduled batch.
pub async fn connect(database_url: &str) -> Result<PgPool, PersistenceError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    Ok(pool)
}
