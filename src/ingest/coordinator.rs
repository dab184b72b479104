use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{error, info, warn};

use super::{DataKind, PipelineError, RunReport, RunRequest};
use crate::config::{self, CoinConfig, ConfigError};
use crate::database::{IngestionStatus, NewIngestionLog, Store, UpsertOutcome};
use crate::schema::{AddressRecord, BlockRecord, MarketPriceRecord, TransactionRecord};
use crate::sources::{BlockSource, FetchError, PriceSource};

const ERROR_SUMMARY_MAX: usize = 512;
const DEFAULT_BACKFILL_SPAN: i64 = 100;

/// Drives one ingestion run end to end: open a log row, fetch raw records,
/// validate them into typed rows, upsert, classify and close the log row.
/// Fetch and persistence are behind trait seams so runs can be exercised
/// without the network or a live database.
pub struct Coordinator {
    store: Arc<dyn Store>,
    block_source: Arc<dyn BlockSource>,
    price_source: Arc<dyn PriceSource>,
    batch_size: usize,
}

/// Irrecoverable mid-run failures, kept separate from `PipelineError` so the
/// run can still close its log row before surfacing them.
enum RunAbort {
    Fetch(FetchError),
    Persistence(crate::database::PersistenceError),
}

impl From<FetchError> for RunAbort {
    fn from(err: FetchError) -> Self {
        RunAbort::Fetch(err)
    }
}

impl From<crate::database::PersistenceError> for RunAbort {
    fn from(err: crate::database::PersistenceError) -> Self {
        RunAbort::Persistence(err)
    }
}

struct RunTally {
    fetched: i64,
    invalid: i64,
    failed_pages: u32,
    outcome: UpsertOutcome,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        block_source: Arc<dyn BlockSource>,
        price_source: Arc<dyn PriceSource>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            block_source,
            price_source,
            batch_size,
        }
    }

    fn source_name(&self, kind: DataKind) -> &'static str {
        match kind {
            DataKind::Prices => self.price_source.source_name(),
            _ => self.block_source.source_name(),
        }
    }

    fn resolve_coins(&self, request: &RunRequest) -> Result<Vec<&'static CoinConfig>, ConfigError> {
        request
            .coins
            .iter()
            .map(|symbol| {
                config::coin_by_symbol(symbol).ok_or_else(|| ConfigError::Invalid {
                    var: "coins",
                    value: symbol.clone(),
                })
            })
            .collect()
    }

    /// Execute one run. Returns `Err(RunFailed)` only when the run as a whole
    /// is classified failed; partial success is an `Ok` report the caller can
    /// inspect.
    pub async fn run(&self, request: &RunRequest) -> Result<RunReport, PipelineError> {
        let coins = self.resolve_coins(request)?;
        let started_at = Utc::now();
        let source = self.source_name(request.kind).to_string();

        let log_id = self
            .store
            .log_run(&NewIngestionLog {
                source: source.clone(),
                data_kind: request.kind.as_str().to_string(),
                coin_symbol: match coins.as_slice() {
                    [only] => Some(only.symbol.to_string()),
                    _ => None,
                },
                target_date: Some(request.date),
                started_at,
            })
            .await?;

        info!(
            "Run {} started: kind={} source={} date={} coins={}",
            log_id,
            request.kind,
            source,
            request.date,
            request.coins.join(",")
        );

        match self.collect_and_persist(request, &coins).await {
            Ok(tally) => {
                let succeeded = tally.outcome.written as i64 + tally.outcome.conflicts as i64;
                let failed = tally.invalid + tally.outcome.failed as i64;
                let status = classify_outcome(tally.fetched, succeeded, failed, tally.failed_pages);
                let finished_at = Utc::now();
                let error_summary = summarize_failures(&tally);

                self.finish_best_effort(
                    log_id,
                    status,
                    tally.fetched,
                    tally.outcome.written as i64,
                    failed,
                    finished_at,
                    error_summary.as_deref(),
                )
                .await;

                if status != IngestionStatus::Failed {
                    for coin in &coins {
                        if let Err(err) = self.store.mark_coin_ingested(coin.symbol, request.date).await {
                            warn!("Could not record last ingested date for {}: {}", coin.symbol, err);
                        }
                    }
                }

                let report = RunReport {
                    source,
                    kind: request.kind,
                    status,
                    records_fetched: tally.fetched,
                    records_written: tally.outcome.written as i64,
                    records_conflicted: tally.outcome.conflicts as i64,
                    records_failed: failed,
                    started_at,
                    finished_at,
                    error_summary,
                };

                if status == IngestionStatus::Failed {
                    Err(PipelineError::RunFailed { report })
                } else {
                    info!(
                        "Run {} finished: status={} fetched={} written={} conflicts={} failed={}",
                        log_id,
                        status,
                        report.records_fetched,
                        report.records_written,
                        report.records_conflicted,
                        report.records_failed
                    );
                    Ok(report)
                }
            }
            Err(abort) => {
                let finished_at = Utc::now();
                let message = match &abort {
                    RunAbort::Fetch(err) => err.to_string(),
                    RunAbort::Persistence(err) => err.to_string(),
                };
                error!("Run {} aborted: {}", log_id, message);

                self.finish_best_effort(
                    log_id,
                    IngestionStatus::Failed,
                    0,
                    0,
                    0,
                    finished_at,
                    Some(&truncate_summary(&message)),
                )
                .await;

                match abort {
                    RunAbort::Persistence(err) => Err(PipelineError::Persistence(err)),
                    RunAbort::Fetch(_) => Err(PipelineError::RunFailed {
                        report: RunReport {
                            source,
                            kind: request.kind,
                            status: IngestionStatus::Failed,
                            records_fetched: 0,
                            records_written: 0,
                            records_conflicted: 0,
                            records_failed: 0,
                            started_at,
                            finished_at,
                            error_summary: Some(truncate_summary(&message)),
                        },
                    }),
                }
            }
        }
    }

    async fn collect_and_persist(
        &self,
        request: &RunRequest,
        coins: &[&'static CoinConfig],
    ) -> Result<RunTally, RunAbort> {
        match request.kind {
            DataKind::Blocks => {
                let mut records = Vec::new();
                let mut fetched = 0i64;
                let mut invalid = 0i64;
                let mut failed_pages = 0u32;
                for coin in coins {
                    let raw = self.block_source.fetch_blocks(coin.blockchair_id, request.date).await?;
                    fetched += raw.records.len() as i64;
                    failed_pages += raw.failed_pages;
                    for value in &raw.records {
                        match BlockRecord::from_raw(coin.symbol, value) {
                            Ok(record) => records.push(record),
                            Err(err) => {
                                invalid += 1;
                                warn!("Rejected block record for {}: {}", coin.symbol, err);
                            }
                        }
                    }
                }
                let outcome = self.store.upsert_blocks(&records, self.batch_size).await?;
                Ok(RunTally { fetched, invalid, failed_pages, outcome })
            }
            DataKind::Transactions => {
                let mut records = Vec::new();
                let mut fetched = 0i64;
                let mut invalid = 0i64;
                let mut failed_pages = 0u32;
                for coin in coins {
                    let raw = self
                        .block_source
                        .fetch_transactions(coin.blockchair_id, request.date)
                        .await?;
                    fetched += raw.records.len() as i64;
                    failed_pages += raw.failed_pages;
                    for value in &raw.records {
                        match TransactionRecord::from_raw(coin.symbol, value) {
                            Ok(record) => records.push(record),
                            Err(err) => {
                                invalid += 1;
                                warn!("Rejected transaction record for {}: {}", coin.symbol, err);
                            }
                        }
                    }
                }
                let outcome = self.store.upsert_transactions(&records, self.batch_size).await?;
                Ok(RunTally { fetched, invalid, failed_pages, outcome })
            }
            DataKind::Addresses => {
                let mut records = Vec::new();
                let mut fetched = 0i64;
                let mut invalid = 0i64;
                let mut failed_pages = 0u32;
                for coin in coins {
                    let raw = self
                        .block_source
                        .fetch_addresses(coin.blockchair_id, &request.addresses)
                        .await?;
                    fetched += raw.records.len() as i64;
                    failed_pages += raw.failed_pages;
                    for (address, value) in &raw.records {
                        match AddressRecord::from_raw(coin.symbol, address, value) {
                            Ok(record) => records.push(record),
                            Err(err) => {
                                invalid += 1;
                                warn!("Rejected address record {} for {}: {}", address, coin.symbol, err);
                            }
                        }
                    }
                }
                let outcome = self.store.upsert_addresses(&records, self.batch_size).await?;
                Ok(RunTally { fetched, invalid, failed_pages, outcome })
            }
            DataKind::Prices => {
                let mut records = Vec::new();
                let mut fetched = 0i64;
                let mut invalid = 0i64;
                for coin in coins {
                    match self.price_source.fetch_price(coin.coingecko_id, request.date).await? {
                        Some(value) => {
                            fetched += 1;
                            match MarketPriceRecord::from_raw(coin.coingecko_id, request.date, &value) {
                                Ok(record) => records.push(record),
                                Err(err) => {
                                    invalid += 1;
                                    warn!("Rejected price record for {}: {}", coin.coingecko_id, err);
                                }
                            }
                        }
                        None => {
                            info!("No price snapshot for {} on {}", coin.coingecko_id, request.date);
                        }
                    }
                }
                let outcome = self.store.upsert_market_prices(&records, self.batch_size).await?;
                Ok(RunTally { fetched, invalid, failed_pages: 0, outcome })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_best_effort(
        &self,
        log_id: i64,
        status: IngestionStatus,
        fetched: i64,
        written: i64,
        failed: i64,
        finished_at: chrono::DateTime<Utc>,
        error_message: Option<&str>,
    ) {
        if let Err(err) = self
            .store
            .finish_run(log_id, status, fetched, written, failed, finished_at, error_message)
            .await
        {
            // The run's classification stands even if the audit row update is
            // lost; the row stays 'running' and the sweep query can spot it.
            error!("Could not finalize ingestion log {}: {}", log_id, err);
        }
    }

    /// Fill missing price days in `[from, to]`, one run per gap day. A day
    /// that fails is logged and skipped; the backfill keeps going.
    pub async fn backfill_prices(
        &self,
        coins: &[String],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RunReport>, PipelineError> {
        let resolved = self.resolve_coins(&RunRequest {
            kind: DataKind::Prices,
            coins: coins.to_vec(),
            date: from,
            addresses: Vec::new(),
        })?;

        let mut reports = Vec::new();
        for coin in &resolved {
            let existing = self
                .store
                .existing_price_dates(coin.coingecko_id, from, to)
                .await?;

            let gaps: Vec<NaiveDate> = from
                .iter_days()
                .take_while(|day| *day <= to)
                .filter(|day| !existing.contains(day))
                .collect();

            info!(
                "Backfill {}: {} day(s) missing between {} and {}",
                coin.coingecko_id,
                gaps.len(),
                from,
                to
            );

            for day in gaps {
                let request = RunRequest {
                    kind: DataKind::Prices,
                    coins: vec![coin.symbol.to_string()],
                    date: day,
                    addresses: Vec::new(),
                };
                match self.run(&request).await {
                    Ok(report) => reports.push(report),
                    Err(PipelineError::RunFailed { report }) => {
                        warn!("Backfill day {} for {} failed, continuing", day, coin.coingecko_id);
                        reports.push(report);
                    }
                    Err(other) => return Err(other),
                }
            }
        }

        Ok(reports)
    }

    /// Ingest a contiguous height range for one coin. When `end` is absent the
    /// chain tip is used; when `start` is absent the last
    /// `DEFAULT_BACKFILL_SPAN` blocks below `end` are taken.
    pub async fn backfill_blocks(
        &self,
        coin_symbol: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<RunReport, PipelineError> {
        let coin = config::coin_by_symbol(coin_symbol).ok_or(ConfigError::Invalid {
            var: "coin",
            value: coin_symbol.to_string(),
        })?;

        let started_at = Utc::now();
        let source = self.block_source.source_name().to_string();
        let log_id = self
            .store
            .log_run(&NewIngestionLog {
                source: source.clone(),
                data_kind: DataKind::Blocks.as_str().to_string(),
                coin_symbol: Some(coin.symbol.to_string()),
                target_date: None,
                started_at,
            })
            .await?;

        let result: Result<RunTally, RunAbort> = async {
            let end = match end {
                Some(height) => height,
                None => self.block_source.latest_block_height(coin.blockchair_id).await?,
            };
            let start = start.unwrap_or_else(|| (end - DEFAULT_BACKFILL_SPAN + 1).max(0));

            info!("Backfilling {} blocks {}..={}", coin.symbol, start, end);

            let raw = self
                .block_source
                .fetch_blocks_by_height(coin.blockchair_id, start, end)
                .await?;
            let fetched = raw.records.len() as i64;
            let failed_pages = raw.failed_pages;
            let mut invalid = 0i64;
            let mut records = Vec::new();
            for value in &raw.records {
                match BlockRecord::from_raw(coin.symbol, value) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        invalid += 1;
                        warn!("Rejected block record for {}: {}", coin.symbol, err);
                    }
                }
            }
            let outcome = self.store.upsert_blocks(&records, self.batch_size).await?;
            Ok(RunTally { fetched, invalid, failed_pages, outcome })
        }
        .await;

        match result {
            Ok(tally) => {
                let succeeded = tally.outcome.written as i64 + tally.outcome.conflicts as i64;
                let failed = tally.invalid + tally.outcome.failed as i64;
                let status = classify_outcome(tally.fetched, succeeded, failed, tally.failed_pages);
                let finished_at = Utc::now();
                let error_summary = summarize_failures(&tally);

                self.finish_best_effort(
                    log_id,
                    status,
                    tally.fetched,
                    tally.outcome.written as i64,
                    failed,
                    finished_at,
                    error_summary.as_deref(),
                )
                .await;

                let report = RunReport {
                    source,
                    kind: DataKind::Blocks,
                    status,
                    records_fetched: tally.fetched,
                    records_written: tally.outcome.written as i64,
                    records_conflicted: tally.outcome.conflicts as i64,
                    records_failed: failed,
                    started_at,
                    finished_at,
                    error_summary,
                };

                if status == IngestionStatus::Failed {
                    Err(PipelineError::RunFailed { report })
                } else {
                    Ok(report)
                }
            }
            Err(abort) => {
                let finished_at = Utc::now();
                let message = match &abort {
                    RunAbort::Fetch(err) => err.to_string(),
                    RunAbort::Persistence(err) => err.to_string(),
                };
                error!("Block backfill for {} aborted: {}", coin.symbol, message);
                self.finish_best_effort(
                    log_id,
                    IngestionStatus::Failed,
                    0,
                    0,
                    0,
                    finished_at,
                    Some(&truncate_summary(&message)),
                )
                .await;

                match abort {
                    RunAbort::Persistence(err) => Err(PipelineError::Persistence(err)),
                    RunAbort::Fetch(_) => Err(PipelineError::RunFailed {
                        report: RunReport {
                            source,
                            kind: DataKind::Blocks,
                            status: IngestionStatus::Failed,
                            records_fetched: 0,
                            records_written: 0,
                            records_conflicted: 0,
                            records_failed: 0,
                            started_at,
                            finished_at,
                            error_summary: Some(truncate_summary(&message)),
                        },
                    }),
                }
            }
        }
    }
}

/// A run fails outright when everything it fetched was lost, or when failed
/// page fetches left nothing fetched at all; it partially succeeds when some
/// records or pages were lost but at least one record was persisted.
/// Conflicts resolved by policy count as persisted, so re-running an already
/// ingested day classifies as succeeded.
fn classify_outcome(fetched: i64, succeeded: i64, failed: i64, failed_pages: u32) -> IngestionStatus {
    if (fetched > 0 && succeeded == 0) || (fetched == 0 && failed_pages > 0) {
        IngestionStatus::Failed
    } else if failed > 0 || failed_pages > 0 {
        IngestionStatus::PartiallySucceeded
    } else {
        IngestionStatus::Succeeded
    }
}

fn summarize_failures(tally: &RunTally) -> Option<String> {
    let mut parts = Vec::new();
    if tally.failed_pages > 0 {
        parts.push(format!("{} page fetch(es) failed", tally.failed_pages));
    }
    for f in &tally.outcome.chunk_failures {
        parts.push(format!("chunk {} ({} records): {}", f.chunk_index, f.records, f.error));
    }
    if parts.is_empty() {
        return None;
    }
    Some(truncate_summary(&parts.join("; ")))
}

fn truncate_summary(message: &str) -> String {
    if message.len() <= ERROR_SUMMARY_MAX {
        return message.to_string();
    }
    let mut cut = ERROR_SUMMARY_MAX;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &message[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_persisted_out_of_some_fetched_is_failed() {
        assert_eq!(classify_outcome(100, 0, 100, 0), IngestionStatus::Failed);
    }

    #[test]
    fn some_failures_with_some_successes_is_partial() {
        assert_eq!(classify_outcome(50, 45, 5, 0), IngestionStatus::PartiallySucceeded);
    }

    #[test]
    fn clean_run_is_succeeded() {
        assert_eq!(classify_outcome(50, 50, 0, 0), IngestionStatus::Succeeded);
    }

    #[test]
    fn empty_fetch_is_succeeded() {
        assert_eq!(classify_outcome(0, 0, 0, 0), IngestionStatus::Succeeded);
    }

    #[test]
    fn rerun_where_everything_conflicts_is_succeeded() {
        // 50 fetched, 0 written, 50 conflicts: succeeded = written + conflicts
        assert_eq!(classify_outcome(50, 50, 0, 0), IngestionStatus::Succeeded);
    }

    #[test]
    fn failed_page_with_persisted_records_is_partial() {
        assert_eq!(classify_outcome(1000, 1000, 0, 1), IngestionStatus::PartiallySucceeded);
    }

    #[test]
    fn all_pages_failed_with_nothing_fetched_is_failed() {
        assert_eq!(classify_outcome(0, 0, 0, 3), IngestionStatus::Failed);
    }

    #[test]
    fn long_error_summary_is_truncated() {
        let long = "x".repeat(2000);
        let truncated = truncate_summary(&long);
        assert_eq!(truncated.len(), ERROR_SUMMARY_MAX + 3);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(600);
        let truncated = truncate_summary(&long);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= ERROR_SUMMARY_MAX + 3);
    }
}
