use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crypto_warehouse::config::{self, Settings};
use crypto_warehouse::database::{self, IngestionStatus, MigrationRunner, Store, Warehouse};
use crypto_warehouse::ingest::{Coordinator, DataKind, PipelineError, RunRequest};
use crypto_warehouse::sources::{BlockSource, BlockchairAdapter, CoinGeckoAdapter, PriceSource};

#[derive(Parser, Debug)]
#[command(version, about = "Cryptocurrency warehouse ingestion", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one ingestion for a data kind and target day
    Ingest {
        /// What to ingest: blocks, transactions, addresses or prices
        #[arg(long)]
        kind: String,

        /// Target day (YYYY-MM-DD); defaults to yesterday UTC
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Coin symbols to cover (can be specified multiple times);
        /// defaults to the configured coin set
        #[arg(long = "coin")]
        coins: Vec<String>,

        /// Addresses to fetch, only used with --kind addresses
        #[arg(long = "address")]
        addresses: Vec<String>,
    },

    /// Fetch daily prices for every missing day in a date range
    BackfillPrices {
        #[arg(long)]
        from: NaiveDate,

        /// Defaults to yesterday UTC
        #[arg(long)]
        to: Option<NaiveDate>,

        #[arg(long = "coin")]
        coins: Vec<String>,
    },

    /// Ingest a contiguous block height range for one coin
    BackfillBlocks {
        #[arg(long)]
        coin: String,

        /// First height, inclusive; defaults to 100 blocks below the end
        #[arg(long)]
        start_height: Option<i64>,

        /// Last height, inclusive; defaults to the chain tip
        #[arg(long)]
        end_height: Option<i64>,
    },

    /// Delete ingestion log rows older than the retention window
    PurgeLogs {
        #[arg(long, default_value = "90")]
        older_than_days: u64,
    },

    /// Show recent ingestion runs
    Runs {
        /// Only runs from this source
        #[arg(long)]
        source: Option<String>,

        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Print row counts for every warehouse table
    Stats,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::from)
        .and_then(|runtime| runtime.block_on(run(Cli::parse())));

    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = Settings::from_env()?;

    let pool = database::connect(&settings.database_url).await?;
    MigrationRunner::new(pool.clone()).run_migrations().await?;

    let warehouse = Arc::new(Warehouse::new(pool));
    warehouse.seed_coin_metadata(config::SUPPORTED_COINS).await?;

    let block_source: Arc<dyn BlockSource> = Arc::new(BlockchairAdapter::new(&settings));
    let price_source: Arc<dyn PriceSource> = Arc::new(CoinGeckoAdapter::new(&settings));

    let store: Arc<dyn Store> = warehouse.clone();
    let coordinator = Coordinator::new(store, block_source, price_source, settings.batch_size);

    match cli.command {
        Command::Ingest {
            kind,
            date,
            coins,
            addresses,
        } => {
            let kind = parse_kind(&kind)?;
            let request = RunRequest {
                kind,
                coins: default_coins(coins, &settings),
                date: date.unwrap_or_else(yesterday_utc),
                addresses,
            };
            run_to_exit_code(coordinator.run(&request).await)
        }

        Command::BackfillPrices { from, to, coins } => {
            let to = to.unwrap_or_else(yesterday_utc);
            if from > to {
                anyhow::bail!("--from {} is after --to {}", from, to);
            }
            let coins = default_coins(coins, &settings);
            let reports = coordinator.backfill_prices(&coins, from, to).await?;
            let failed = reports
                .iter()
                .filter(|r| r.status == IngestionStatus::Failed)
                .count();
            info!("Price backfill finished: {} run(s), {} failed", reports.len(), failed);
            Ok(if failed == reports.len() && !reports.is_empty() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }

        Command::BackfillBlocks {
            coin,
            start_height,
            end_height,
        } => run_to_exit_code(coordinator.backfill_blocks(&coin, start_height, end_height).await),

        Command::PurgeLogs { older_than_days } => {
            let cutoff = Utc::now() - chrono::Duration::days(older_than_days as i64);
            let purged = warehouse.purge_ingestion_logs(cutoff).await?;
            info!("Purged {} log row(s)", purged);
            Ok(ExitCode::SUCCESS)
        }

        Command::Runs { source, limit } => {
            let runs = warehouse.recent_runs(source.as_deref(), limit).await?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
            Ok(ExitCode::SUCCESS)
        }

        Command::Stats => {
            let stats = warehouse.warehouse_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_to_exit_code(
    result: Result<crypto_warehouse::ingest::RunReport, PipelineError>,
) -> anyhow::Result<ExitCode> {
    match result {
        Ok(report) => {
            info!(
                "{} run {}: fetched={} written={} conflicts={} failed={}",
                report.kind,
                report.status,
                report.records_fetched,
                report.records_written,
                report.records_conflicted,
                report.records_failed
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(PipelineError::RunFailed { report }) => {
            error!(
                "{} run failed: {}",
                report.kind,
                report.error_summary.as_deref().unwrap_or("no records persisted")
            );
            Ok(ExitCode::FAILURE)
        }
        Err(other) => Err(other.into()),
    }
}

fn parse_kind(raw: &str) -> anyhow::Result<DataKind> {
    match raw.to_ascii_lowercase().as_str() {
        "blocks" => Ok(DataKind::Blocks),
        "transactions" => Ok(DataKind::Transactions),
        "addresses" => Ok(DataKind::Addresses),
        "prices" => Ok(DataKind::Prices),
        other => anyhow::bail!("unknown data kind: {} (expected blocks, transactions, addresses or prices)", other),
    }
}

fn default_coins(coins: Vec<String>, settings: &Settings) -> Vec<String> {
    if coins.is_empty() {
        settings.default_coins.clone()
    } else {
        coins
    }
}

fn yesterday_utc() -> NaiveDate {
    Utc::now()
        .date_naive()
        .checked_sub_days(Days::new(1))
        .unwrap_or_else(|| Utc::now().date_naive())
}
