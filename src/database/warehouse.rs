use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{info, warn};

use super::models::*;
use super::{PersistenceError, Store};
use crate::config::CoinConfig;
use crate::schema::{AddressRecord, BlockRecord, MarketPriceRecord, TransactionRecord};

/// All warehouse writes go through this repository. Each chunk is written in
/// its own transaction; a failed chunk is retried once and then counted,
/// without undoing chunks that already committed.
pub struct Warehouse {
    pool: PgPool,
}

impl Warehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run one chunk write, retrying once. Connection loss aborts the whole
    /// operation; any other failure is counted against this chunk only.
    async fn with_chunk_retry<F, Fut>(
        &self,
        chunk_index: usize,
        chunk_len: usize,
        mut write: F,
    ) -> Result<UpsertOutcome, PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<UpsertOutcome, sqlx::Error>>,
    {
        match write().await {
            Ok(outcome) => Ok(outcome),
            Err(first) => {
                warn!("Chunk {} write failed, retrying once: {}", chunk_index, first);
                match write().await {
                    Ok(outcome) => Ok(outcome),
                    Err(second) if is_connection_loss(&second) => Err(PersistenceError::Chunk {
                        chunk_index,
                        message: second.to_string(),
                    }),
                    Err(second) => {
                        warn!("Chunk {} failed after retry: {}", chunk_index, second);
                        Ok(UpsertOutcome {
                            failed: chunk_len as u64,
                            chunk_failures: vec![ChunkFailure {
                                chunk_index,
                                records: chunk_len,
                                error: second.to_string(),
                            }],
                            ..UpsertOutcome::default()
                        })
                    }
                }
            }
        }
    }

    async fn write_block_chunk(&self, chunk: &[BlockRecord]) -> Result<UpsertOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO raw_blockchain_blocks \
             (coin_symbol, height, block_hash, block_time, transaction_count, size_bytes, difficulty, miner) ",
        );
        qb.push_values(chunk, |mut b, rec| {
            b.push_bind(&rec.coin_symbol)
                .push_bind(rec.height)
                .push_bind(&rec.block_hash)
                .push_bind(rec.block_time)
                .push_bind(rec.transaction_count)
                .push_bind(rec.size_bytes)
                .push_bind(rec.difficulty)
                .push_bind(&rec.miner);
        });
        qb.push(" ON CONFLICT (coin_symbol, height) DO NOTHING");
        let written = qb.build().execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;

        Ok(UpsertOutcome {
            written,
            conflicts: chunk.len() as u64 - written,
            ..UpsertOutcome::default()
        })
    }

    async fn write_transaction_chunk(&self, chunk: &[TransactionRecord]) -> Result<UpsertOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO raw_blockchain_transactions \
             (coin_symbol, tx_hash, block_height, tx_time, fee_usd, output_total_usd, \
              input_count, output_count, size_bytes, is_coinbase) ",
        );
        qb.push_values(chunk, |mut b, rec| {
            b.push_bind(&rec.coin_symbol)
                .push_bind(&rec.tx_hash)
                .push_bind(rec.block_height)
                .push_bind(rec.tx_time)
                .push_bind(rec.fee_usd)
                .push_bind(rec.output_total_usd)
                .push_bind(rec.input_count)
                .push_bind(rec.output_count)
                .push_bind(rec.size_bytes)
                .push_bind(rec.is_coinbase);
        });
        qb.push(" ON CONFLICT (coin_symbol, tx_hash) DO NOTHING");
        let written = qb.build().execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;

        Ok(UpsertOutcome {
            written,
            conflicts: chunk.len() as u64 - written,
            ..UpsertOutcome::default()
        })
    }

    async fn write_address_chunk(&self, chunk: &[AddressRecord]) -> Result<UpsertOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO raw_blockchain_addresses \
             (coin_symbol, address, first_seen_time, last_seen_time, transaction_count, \
              received_total_usd, spent_total_usd, balance_usd) ",
        );
        qb.push_values(chunk, |mut b, rec| {
            b.push_bind(&rec.coin_symbol)
                .push_bind(&rec.address)
                .push_bind(rec.first_seen_time)
                .push_bind(rec.last_seen_time)
                .push_bind(rec.transaction_count)
                .push_bind(rec.received_total_usd)
                .push_bind(rec.spent_total_usd)
                .push_bind(rec.balance_usd);
        });
        qb.push(" ON CONFLICT (coin_symbol, address) DO NOTHING");
        let written = qb.build().execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;

        Ok(UpsertOutcome {
            written,
            conflicts: chunk.len() as u64 - written,
            ..UpsertOutcome::default()
        })
    }

    async fn write_price_chunk(&self, chunk: &[MarketPriceRecord]) -> Result<UpsertOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO raw_market_prices (coin_id, price_date, price_usd, volume_usd, market_cap_usd) ",
        );
        qb.push_values(chunk, |mut b, rec| {
            b.push_bind(&rec.coin_id)
                .push_bind(rec.price_date)
                .push_bind(rec.price_usd)
                .push_bind(rec.volume_usd)
                .push_bind(rec.market_cap_usd);
        });
        qb.push(
            " ON CONFLICT (coin_id, price_date) DO UPDATE SET \
               price_usd = EXCLUDED.price_usd, \
               volume_usd = EXCLUDED.volume_usd, \
               market_cap_usd = EXCLUDED.market_cap_usd, \
               updated_at = NOW() \
             RETURNING (xmax <> 0) AS overwritten",
        );
        let rows = qb.build().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        let overwritten = rows
            .iter()
            .filter(|row| row.get::<bool, _>("overwritten"))
            .count() as u64;
        Ok(UpsertOutcome {
            written: rows.len() as u64,
            conflicts: overwritten,
            ..UpsertOutcome::default()
        })
    }

    pub async fn recent_runs(&self, source: Option<&str>, limit: i64) -> Result<Vec<IngestionLogRow>, PersistenceError> {
        let rows = sqlx::query_as::<_, IngestionLogRow>(
            r#"
            SELECT id, source, data_kind, coin_symbol, target_date, status,
                   records_fetched, records_written, records_failed,
                   started_at, finished_at, error_message
            FROM ingestion_log
            WHERE ($1::text IS NULL OR source = $1)
            ORDER BY started_at DESC
            LIMIT $2
            "#,
        )
        .bind(source)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Retention sweep: drop audit rows older than the cutoff.
    pub async fn purge_ingestion_logs(&self, cutoff: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let result = sqlx::query("DELETE FROM ingestion_log WHERE started_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        info!("Purged {} ingestion log rows older than {}", result.rows_affected(), cutoff);
        Ok(result.rows_affected())
    }

    // Coin metadata is administered from the static registry; ingestion only
    // reads it.

    pub async fn seed_coin_metadata(&self, coins: &[CoinConfig]) -> Result<(), PersistenceError> {
        for coin in coins {
            sqlx::query(
                r#"
                INSERT INTO coin_metadata (symbol, name, coingecko_id, blockchair_id, is_active, ingestion_enabled)
                VALUES ($1, $2, $3, $4, TRUE, $5)
                ON CONFLICT (symbol) DO UPDATE SET
                    name = EXCLUDED.name,
                    coingecko_id = EXCLUDED.coingecko_id,
                    blockchair_id = EXCLUDED.blockchair_id,
                    ingestion_enabled = EXCLUDED.ingestion_enabled,
                    updated_at = NOW()
                "#,
            )
            .bind(coin.symbol)
            .bind(coin.name)
            .bind(coin.coingecko_id)
            .bind(coin.blockchair_id)
            .bind(coin.ingestion_enabled)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn get_active_coins(&self) -> Result<Vec<CoinMetadataRow>, PersistenceError> {
        let rows = sqlx::query_as::<_, CoinMetadataRow>(
            r#"
            SELECT id, symbol, name, coingecko_id, blockchair_id,
                   is_active, ingestion_enabled, last_ingested_date
            FROM coin_metadata
            WHERE is_active = TRUE AND ingestion_enabled = TRUE
            ORDER BY symbol
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn latest_block_height(&self, coin_symbol: &str) -> Result<Option<i64>, PersistenceError> {
        let row = sqlx::query("SELECT MAX(height) AS max_height FROM raw_blockchain_blocks WHERE coin_symbol = $1")
            .bind(coin_symbol)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("max_height"))
    }

    pub async fn get_market_price(
        &self,
        coin_id: &str,
        date: NaiveDate,
    ) -> Result<Option<MarketPriceRow>, PersistenceError> {
        let row = sqlx::query_as::<_, MarketPriceRow>(
            r#"
            SELECT coin_id, price_date, price_usd, volume_usd, market_cap_usd
            FROM raw_market_prices
            WHERE coin_id = $1 AND price_date = $2
            "#,
        )
        .bind(coin_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn warehouse_stats(&self) -> Result<WarehouseStats, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM raw_blockchain_blocks) AS total_blocks,
                (SELECT COUNT(*) FROM raw_blockchain_transactions) AS total_transactions,
                (SELECT COUNT(*) FROM raw_blockchain_addresses) AS total_addresses,
                (SELECT COUNT(*) FROM raw_market_prices) AS total_price_records,
                (SELECT COUNT(*) FROM ingestion_log) AS total_log_rows
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(WarehouseStats {
            total_blocks: row.get("total_blocks"),
            total_transactions: row.get("total_transactions"),
            total_addresses: row.get("total_addresses"),
            total_price_records: row.get("total_price_records"),
            total_log_rows: row.get("total_log_rows"),
        })
    }
}

#[async_trait]
impl Store for Warehouse {
    // Block, transaction and address facts are immutable once confirmed, so
    // their conflict policy is first-write-wins (DO NOTHING). Market data
    // sources republish corrected history, so prices are last-write-wins.

    async fn upsert_blocks(&self, blocks: &[BlockRecord], batch_size: usize) -> Result<UpsertOutcome, PersistenceError> {
        let mut outcome = UpsertOutcome::default();
        for (index, chunk) in blocks.chunks(batch_size.max(1)).enumerate() {
            let result = self
                .with_chunk_retry(index, chunk.len(), || self.write_block_chunk(chunk))
                .await?;
            outcome.merge(result);
        }
        info!(
            "Blocks - written: {}, conflicts skipped: {}, failed: {}",
            outcome.written, outcome.conflicts, outcome.failed
        );
        Ok(outcome)
    }

    async fn upsert_transactions(
        &self,
        transactions: &[TransactionRecord],
        batch_size: usize,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let mut outcome = UpsertOutcome::default();
        for (index, chunk) in transactions.chunks(batch_size.max(1)).enumerate() {
            let result = self
                .with_chunk_retry(index, chunk.len(), || self.write_transaction_chunk(chunk))
                .await?;
            outcome.merge(result);
        }
        info!(
            "Transactions - written: {}, conflicts skipped: {}, failed: {}",
            outcome.written, outcome.conflicts, outcome.failed
        );
        Ok(outcome)
    }

    async fn upsert_addresses(
        &self,
        addresses: &[AddressRecord],
        batch_size: usize,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let mut outcome = UpsertOutcome::default();
        for (index, chunk) in addresses.chunks(batch_size.max(1)).enumerate() {
            let result = self
                .with_chunk_retry(index, chunk.len(), || self.write_address_chunk(chunk))
                .await?;
            outcome.merge(result);
        }
        info!(
            "Addresses - written: {}, conflicts skipped: {}, failed: {}",
            outcome.written, outcome.conflicts, outcome.failed
        );
        Ok(outcome)
    }

    async fn upsert_market_prices(
        &self,
        prices: &[MarketPriceRecord],
        batch_size: usize,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let mut outcome = UpsertOutcome::default();
        for (index, chunk) in prices.chunks(batch_size.max(1)).enumerate() {
            let result = self
                .with_chunk_retry(index, chunk.len(), || self.write_price_chunk(chunk))
                .await?;
            outcome.merge(result);
        }
        info!(
            "Prices - written: {}, overwritten: {}, failed: {}",
            outcome.written, outcome.conflicts, outcome.failed
        );
        Ok(outcome)
    }

    async fn log_run(&self, log: &NewIngestionLog) -> Result<i64, PersistenceError> {
        let row = sqlx::query(
            r#"
            INSERT INTO ingestion_log (source, data_kind, coin_symbol, target_date, status, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&log.source)
        .bind(&log.data_kind)
        .bind(&log.coin_symbol)
        .bind(log.target_date)
        .bind(IngestionStatus::Running.as_str())
        .bind(log.started_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn finish_run(
        &self,
        log_id: i64,
        status: IngestionStatus,
        records_fetched: i64,
        records_written: i64,
        records_failed: i64,
        finished_at: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            UPDATE ingestion_log
            SET status = $2, records_fetched = $3, records_written = $4,
                records_failed = $5, finished_at = $6, error_message = $7
            WHERE id = $1
            "#,
        )
        .bind(log_id)
        .bind(status.as_str())
        .bind(records_fetched)
        .bind(records_written)
        .bind(records_failed)
        .bind(finished_at)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn existing_price_dates(
        &self,
        coin_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<NaiveDate>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT price_date FROM raw_market_prices WHERE coin_id = $1 AND price_date BETWEEN $2 AND $3",
        )
        .bind(coin_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.get("price_date")).collect())
    }

    async fn mark_coin_ingested(&self, symbol: &str, date: NaiveDate) -> Result<(), PersistenceError> {
        sqlx::query(
            "UPDATE coin_metadata SET last_ingested_date = $2, updated_at = NOW() WHERE symbol = $1",
        )
        .bind(symbol)
        .bind(date)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn is_connection_loss(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}
