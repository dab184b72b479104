use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};

use crypto_warehouse::database::{
    IngestionStatus, NewIngestionLog, PersistenceError, Store, UpsertOutcome,
};
use crypto_warehouse::ingest::{Coordinator, DataKind, PipelineError, RunRequest};
use crypto_warehouse::schema::{AddressRecord, BlockRecord, MarketPriceRecord, TransactionRecord};
use crypto_warehouse::sources::{BlockSource, FetchError, FetchOutcome, PriceSource};

/// In-memory store emulating the warehouse conflict policies: blocks,
/// transactions and addresses keep the first write, prices keep the last.
#[derive(Default)]
struct MemoryStore {
    blocks: Mutex<HashMap<(String, i64), BlockRecord>>,
    transactions: Mutex<HashMap<(String, String), TransactionRecord>>,
    addresses: Mutex<HashMap<(String, String), AddressRecord>>,
    prices: Mutex<HashMap<(String, NaiveDate), MarketPriceRecord>>,
    finished: Mutex<Vec<FinishedRun>>,
    ingested_marks: Mutex<Vec<(String, NaiveDate)>>,
    next_log_id: AtomicI64,
}

#[derive(Debug, Clone)]
struct FinishedRun {
    log_id: i64,
    status: IngestionStatus,
    records_fetched: i64,
    records_written: i64,
    records_failed: i64,
    error_message: Option<String>,
}

impl MemoryStore {
    fn last_finished(&self) -> FinishedRun {
        self.finished
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no run was finalized")
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_blocks(&self, blocks: &[BlockRecord], _batch_size: usize) -> Result<UpsertOutcome, PersistenceError> {
        let mut map = self.blocks.lock().unwrap();
        let mut outcome = UpsertOutcome::default();
        for record in blocks {
            let key = (record.coin_symbol.clone(), record.height);
            if map.contains_key(&key) {
                outcome.conflicts += 1;
            } else {
                map.insert(key, record.clone());
                outcome.written += 1;
            }
        }
        Ok(outcome)
    }

    async fn upsert_transactions(
        &self,
        transactions: &[TransactionRecord],
        _batch_size: usize,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let mut map = self.transactions.lock().unwrap();
        let mut outcome = UpsertOutcome::default();
        for record in transactions {
            let key = (record.coin_symbol.clone(), record.tx_hash.clone());
            if map.contains_key(&key) {
                outcome.conflicts += 1;
            } else {
                map.insert(key, record.clone());
                outcome.written += 1;
            }
        }
        Ok(outcome)
    }

    async fn upsert_addresses(
        &self,
        addresses: &[AddressRecord],
        _batch_size: usize,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let mut map = self.addresses.lock().unwrap();
        let mut outcome = UpsertOutcome::default();
        for record in addresses {
            let key = (record.coin_symbol.clone(), record.address.clone());
            if map.contains_key(&key) {
                outcome.conflicts += 1;
            } else {
                map.insert(key, record.clone());
                outcome.written += 1;
            }
        }
        Ok(outcome)
    }

    async fn upsert_market_prices(
        &self,
        prices: &[MarketPriceRecord],
        _batch_size: usize,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let mut map = self.prices.lock().unwrap();
        let mut outcome = UpsertOutcome::default();
        for record in prices {
            let key = (record.coin_id.clone(), record.price_date);
            if map.insert(key, record.clone()).is_some() {
                outcome.conflicts += 1;
            }
            outcome.written += 1;
        }
        Ok(outcome)
    }

    async fn log_run(&self, _log: &NewIngestionLog) -> Result<i64, PersistenceError> {
        Ok(self.next_log_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn finish_run(
        &self,
        log_id: i64,
        status: IngestionStatus,
        records_fetched: i64,
        records_written: i64,
        records_failed: i64,
        _finished_at: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> Result<(), PersistenceError> {
        self.finished.lock().unwrap().push(FinishedRun {
            log_id,
            status,
            records_fetched,
            records_written,
            records_failed,
            error_message: error_message.map(str::to_string),
        });
        Ok(())
    }

    async fn existing_price_dates(
        &self,
        coin_id: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<NaiveDate>, PersistenceError> {
        let map = self.prices.lock().unwrap();
        Ok(map
            .keys()
            .filter(|(id, date)| id == coin_id && *date >= from && *date <= to)
            .map(|(_, date)| *date)
            .collect())
    }

    async fn mark_coin_ingested(&self, symbol: &str, date: NaiveDate) -> Result<(), PersistenceError> {
        self.ingested_marks.lock().unwrap().push((symbol.to_string(), date));
        Ok(())
    }
}

/// Canned block source. `fail` makes every fetch report exhausted retries;
/// `failed_pages` is reported alongside the records, as when a later page
/// of a paginated fetch was lost.
#[derive(Default)]
struct FakeBlockSource {
    blocks: Vec<Value>,
    transactions: Vec<Value>,
    addresses: Vec<(String, Value)>,
    fail: bool,
    failed_pages: u32,
}

fn exhausted() -> FetchError {
    FetchError::RetriesExhausted {
        attempts: 3,
        url: "https://api.blockchair.com/bitcoin/blocks".to_string(),
        message: "status 503".to_string(),
    }
}

#[async_trait]
impl BlockSource for FakeBlockSource {
    fn source_name(&self) -> &'static str {
        "blockchair"
    }

    async fn fetch_blocks(&self, _coin: &str, _date: NaiveDate) -> Result<FetchOutcome<Value>, FetchError> {
        if self.fail {
            return Err(exhausted());
        }
        Ok(FetchOutcome::new(self.blocks.clone(), self.failed_pages))
    }

    async fn fetch_blocks_by_height(
        &self,
        _coin: &str,
        start: i64,
        end: i64,
    ) -> Result<FetchOutcome<Value>, FetchError> {
        if self.fail {
            return Err(exhausted());
        }
        let records = self
            .blocks
            .iter()
            .filter(|b| {
                b.get("id")
                    .and_then(Value::as_i64)
                    .map(|h| h >= start && h <= end)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(FetchOutcome::new(records, self.failed_pages))
    }

    async fn fetch_transactions(&self, _coin: &str, _date: NaiveDate) -> Result<FetchOutcome<Value>, FetchError> {
        if self.fail {
            return Err(exhausted());
        }
        Ok(FetchOutcome::new(self.transactions.clone(), self.failed_pages))
    }

    async fn fetch_addresses(
        &self,
        _coin: &str,
        _addresses: &[String],
    ) -> Result<FetchOutcome<(String, Value)>, FetchError> {
        if self.fail {
            return Err(exhausted());
        }
        Ok(FetchOutcome::new(self.addresses.clone(), self.failed_pages))
    }

    async fn latest_block_height(&self, _coin: &str) -> Result<i64, FetchError> {
        if self.fail {
            return Err(exhausted());
        }
        Ok(self
            .blocks
            .iter()
            .filter_map(|b| b.get("id").and_then(Value::as_i64))
            .max()
            .unwrap_or(0))
    }
}

/// Price source answering from a fixed (coin, date) table.
#[derive(Default)]
struct FakePriceSource {
    snapshots: HashMap<(String, NaiveDate), Value>,
}

#[async_trait]
impl PriceSource for FakePriceSource {
    fn source_name(&self) -> &'static str {
        "coingecko"
    }

    async fn fetch_price(&self, coin_id: &str, date: NaiveDate) -> Result<Option<Value>, FetchError> {
        Ok(self.snapshots.get(&(coin_id.to_string(), date)).cloned())
    }
}

fn raw_block(height: i64) -> Value {
    json!({
        "id": height,
        "hash": format!("{:0>64}", height),
        "time": "2024-03-01 12:00:00",
        "transaction_count": 2500,
        "size": 1_400_000,
        "difficulty": 81.0e12
    })
}

fn raw_transaction(n: u32) -> Value {
    json!({
        "hash": format!("{:0>64}", n),
        "block_id": 830_000,
        "time": "2024-03-01 12:00:00",
        "fee_usd": 1.25,
        "output_total_usd": 10_000.0,
        "input_count": 1,
        "output_count": 2,
        "size": 250,
        "is_coinbase": false
    })
}

fn target_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

fn coordinator(
    store: Arc<MemoryStore>,
    block_source: FakeBlockSource,
    price_source: FakePriceSource,
) -> Coordinator {
    Coordinator::new(store, Arc::new(block_source), Arc::new(price_source), 500)
}

fn block_request(date: NaiveDate) -> RunRequest {
    RunRequest {
        kind: DataKind::Blocks,
        coins: vec!["BTC".to_string()],
        date,
        addresses: Vec::new(),
    }
}

#[tokio::test]
async fn clean_block_run_succeeds_and_marks_coin() {
    let store = Arc::new(MemoryStore::default());
    let source = FakeBlockSource {
        blocks: (830_000..830_010).map(raw_block).collect(),
        ..Default::default()
    };
    let coordinator = coordinator(store.clone(), source, FakePriceSource::default());

    let report = coordinator.run(&block_request(target_date())).await.unwrap();

    assert_eq!(report.status, IngestionStatus::Succeeded);
    assert_eq!(report.records_fetched, 10);
    assert_eq!(report.records_written, 10);
    assert_eq!(report.records_failed, 0);
    assert_eq!(store.blocks.lock().unwrap().len(), 10);

    let finished = store.last_finished();
    assert_eq!(finished.log_id, 1);
    assert_eq!(finished.status, IngestionStatus::Succeeded);
    assert_eq!(finished.records_fetched, 10);
    assert_eq!(finished.records_written, 10);
    assert_eq!(finished.records_failed, 0);
    assert_eq!(
        store.ingested_marks.lock().unwrap().as_slice(),
        &[("BTC".to_string(), target_date())]
    );
}

#[tokio::test]
async fn invalid_records_make_run_partial() {
    let mut blocks: Vec<Value> = (830_000..830_045).map(raw_block).collect();
    for _ in 0..5 {
        blocks.push(json!({ "hash": "deadbeef", "time": "2024-03-01 12:00:00" }));
    }
    let store = Arc::new(MemoryStore::default());
    let source = FakeBlockSource { blocks, ..Default::default() };
    let coordinator = coordinator(store.clone(), source, FakePriceSource::default());

    let report = coordinator.run(&block_request(target_date())).await.unwrap();

    assert_eq!(report.status, IngestionStatus::PartiallySucceeded);
    assert_eq!(report.records_fetched, 50);
    assert_eq!(report.records_written, 45);
    assert_eq!(report.records_failed, 5);
}

#[tokio::test]
async fn exhausted_fetch_fails_run_and_persists_nothing() {
    let store = Arc::new(MemoryStore::default());
    let source = FakeBlockSource { fail: true, ..Default::default() };
    let coordinator = coordinator(store.clone(), source, FakePriceSource::default());

    let err = coordinator.run(&block_request(target_date())).await.unwrap_err();
    match err {
        PipelineError::RunFailed { report } => {
            assert_eq!(report.status, IngestionStatus::Failed);
            assert!(report.error_summary.unwrap().contains("retries exhausted"));
        }
        other => panic!("expected RunFailed, got {other:?}"),
    }

    assert!(store.blocks.lock().unwrap().is_empty());
    let finished = store.last_finished();
    assert_eq!(finished.status, IngestionStatus::Failed);
    assert!(finished.error_message.is_some());
    assert!(store.ingested_marks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn lost_page_keeps_earlier_records_and_classifies_partial() {
    let store = Arc::new(MemoryStore::default());
    let source = FakeBlockSource {
        blocks: (830_000..831_000).map(raw_block).collect(),
        failed_pages: 1,
        ..Default::default()
    };
    let coordinator = coordinator(store.clone(), source, FakePriceSource::default());

    let report = coordinator.run(&block_request(target_date())).await.unwrap();

    // The page that failed is reflected in the status and summary, not by
    // discarding the thousand records from the pages that succeeded.
    assert_eq!(report.status, IngestionStatus::PartiallySucceeded);
    assert_eq!(report.records_written, 1000);
    assert!(report.error_summary.unwrap().contains("1 page fetch(es) failed"));
    assert_eq!(store.blocks.lock().unwrap().len(), 1000);
}

#[tokio::test]
async fn all_pages_lost_with_nothing_fetched_fails_run() {
    let store = Arc::new(MemoryStore::default());
    let source = FakeBlockSource {
        failed_pages: 2,
        ..Default::default()
    };
    let coordinator = coordinator(store.clone(), source, FakePriceSource::default());

    let err = coordinator.run(&block_request(target_date())).await.unwrap_err();
    assert!(matches!(err, PipelineError::RunFailed { .. }));
    assert!(store.blocks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn run_counters_survive_past_thirty_two_bits() {
    let store = MemoryStore::default();
    store
        .finish_run(1, IngestionStatus::Succeeded, 5_000_000_000, 5_000_000_000, 0, Utc::now(), None)
        .await
        .unwrap();

    let finished = store.last_finished();
    assert_eq!(finished.records_fetched, 5_000_000_000);
    assert_eq!(finished.records_written, 5_000_000_000);
}

#[tokio::test]
async fn rerunning_same_day_is_idempotent_and_succeeds() {
    let store = Arc::new(MemoryStore::default());
    let blocks: Vec<Value> = (830_000..830_010).map(raw_block).collect();
    let coordinator = coordinator(
        store.clone(),
        FakeBlockSource { blocks, ..Default::default() },
        FakePriceSource::default(),
    );

    let first = coordinator.run(&block_request(target_date())).await.unwrap();
    let second = coordinator.run(&block_request(target_date())).await.unwrap();

    assert_eq!(first.records_written, 10);
    // Everything conflicts on the second pass, which still classifies as a
    // successful run.
    assert_eq!(second.status, IngestionStatus::Succeeded);
    assert_eq!(second.records_written, 0);
    assert_eq!(second.records_conflicted, 10);
    assert_eq!(store.blocks.lock().unwrap().len(), 10);
}

#[tokio::test]
async fn transaction_run_persists_validated_rows() {
    let store = Arc::new(MemoryStore::default());
    let source = FakeBlockSource {
        transactions: (1..=20).map(raw_transaction).collect(),
        ..Default::default()
    };
    let coordinator = coordinator(store.clone(), source, FakePriceSource::default());

    let request = RunRequest {
        kind: DataKind::Transactions,
        coins: vec!["BTC".to_string()],
        date: target_date(),
        addresses: Vec::new(),
    };
    let report = coordinator.run(&request).await.unwrap();

    assert_eq!(report.status, IngestionStatus::Succeeded);
    assert_eq!(store.transactions.lock().unwrap().len(), 20);
}

#[tokio::test]
async fn address_run_keeps_first_write() {
    let store = Arc::new(MemoryStore::default());
    let payload = json!({
        "address": {
            "type": "pubkeyhash",
            "first_seen_receiving": "2013-01-01 00:00:00",
            "last_seen_spending": "2024-02-28 00:00:00",
            "transaction_count": 42,
            "received_usd": 1000.0,
            "spent_usd": 400.0,
            "balance_usd": 600.0
        }
    });
    let addr = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".to_string();
    let source = FakeBlockSource {
        addresses: vec![(addr.clone(), payload["address"].clone())],
        ..Default::default()
    };
    let coordinator = coordinator(store.clone(), source, FakePriceSource::default());

    let request = RunRequest {
        kind: DataKind::Addresses,
        coins: vec!["BTC".to_string()],
        date: target_date(),
        addresses: vec![addr.clone()],
    };

    coordinator.run(&request).await.unwrap();
    let second = coordinator.run(&request).await.unwrap();

    assert_eq!(second.records_conflicted, 1);
    assert_eq!(store.addresses.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn price_run_overwrites_existing_day() {
    let store = Arc::new(MemoryStore::default());
    let mut snapshots = HashMap::new();
    snapshots.insert(
        ("bitcoin".to_string(), target_date()),
        json!({
            "current_price": { "usd": 62000.5 },
            "total_volume": { "usd": 30_000_000_000.0 },
            "market_cap": { "usd": 1_200_000_000_000.0 }
        }),
    );
    let coordinator = coordinator(
        store.clone(),
        FakeBlockSource::default(),
        FakePriceSource { snapshots },
    );

    let request = RunRequest {
        kind: DataKind::Prices,
        coins: vec!["BTC".to_string()],
        date: target_date(),
        addresses: Vec::new(),
    };

    let first = coordinator.run(&request).await.unwrap();
    let second = coordinator.run(&request).await.unwrap();

    assert_eq!(first.status, IngestionStatus::Succeeded);
    assert_eq!(second.status, IngestionStatus::Succeeded);
    // Last write wins: the row is replaced, not skipped.
    assert_eq!(second.records_written, 1);
    assert_eq!(second.records_conflicted, 1);
    assert_eq!(store.prices.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_price_snapshot_is_an_empty_success() {
    let store = Arc::new(MemoryStore::default());
    let coordinator = coordinator(
        store.clone(),
        FakeBlockSource::default(),
        FakePriceSource::default(),
    );

    let request = RunRequest {
        kind: DataKind::Prices,
        coins: vec!["BTC".to_string()],
        date: target_date(),
        addresses: Vec::new(),
    };
    let report = coordinator.run(&request).await.unwrap();

    assert_eq!(report.status, IngestionStatus::Succeeded);
    assert_eq!(report.records_fetched, 0);
    assert!(store.prices.lock().unwrap().is_empty());
}

#[tokio::test]
async fn price_backfill_only_fetches_gap_days() {
    let store = Arc::new(MemoryStore::default());
    let from = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    let to = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();

    let mut snapshots = HashMap::new();
    for day in from.iter_days().take_while(|d| *d <= to) {
        snapshots.insert(
            ("bitcoin".to_string(), day),
            json!({ "current_price": { "usd": 60000.0 } }),
        );
    }
    let coordinator = coordinator(
        store.clone(),
        FakeBlockSource::default(),
        FakePriceSource { snapshots },
    );

    // Pre-seed March 2 and 4 so only three gap days remain.
    for day in [
        NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
    ] {
        let request = RunRequest {
            kind: DataKind::Prices,
            coins: vec!["BTC".to_string()],
            date: day,
            addresses: Vec::new(),
        };
        coordinator.run(&request).await.unwrap();
    }

    let reports = coordinator
        .backfill_prices(&["BTC".to_string()], from, to)
        .await
        .unwrap();

    assert_eq!(reports.len(), 3);
    assert_eq!(store.prices.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn block_backfill_uses_chain_tip_when_unbounded() {
    let store = Arc::new(MemoryStore::default());
    let blocks: Vec<Value> = (830_000..830_050).map(raw_block).collect();
    let coordinator = coordinator(
        store.clone(),
        FakeBlockSource { blocks, ..Default::default() },
        FakePriceSource::default(),
    );

    let report = coordinator
        .backfill_blocks("BTC", Some(830_040), None)
        .await
        .unwrap();

    assert_eq!(report.status, IngestionStatus::Succeeded);
    // Tip is 830_049, so exactly ten blocks land.
    assert_eq!(report.records_written, 10);
}

#[tokio::test]
async fn unknown_coin_symbol_is_a_config_error() {
    let store = Arc::new(MemoryStore::default());
    let coordinator = coordinator(store, FakeBlockSource::default(), FakePriceSource::default());

    let request = RunRequest {
        kind: DataKind::Blocks,
        coins: vec!["XYZ".to_string()],
        date: target_date(),
        addresses: Vec::new(),
    };
    let err = coordinator.run(&request).await.unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}
