pub mod coordinator;

pub use coordinator::Coordinator;

use chrono::{DateTime, NaiveDate, Utc};

use crate::config::ConfigError;
use crate::database::{IngestionStatus, PersistenceError};

/// Which entity family a run ingests. One run covers exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Blocks,
    Transactions,
    Addresses,
    Prices,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Blocks => "blocks",
            DataKind::Transactions => "transactions",
            DataKind::Addresses => "addresses",
            DataKind::Prices => "prices",
        }
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ingestion run: a data kind, the coins it covers and the target day.
/// `addresses` is only consulted for `DataKind::Addresses`.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub kind: DataKind,
    pub coins: Vec<String>,
    pub date: NaiveDate,
    pub addresses: Vec<String>,
}

/// What a finished run reported to the ingestion log, returned to the caller
/// so the CLI can print it and pick an exit code.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub source: String,
    pub kind: DataKind,
    pub status: IngestionStatus,
    pub records_fetched: i64,
    pub records_written: i64,
    pub records_conflicted: i64,
    pub records_failed: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error_summary: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("run marked failed: {}", .report.error_summary.as_deref().unwrap_or("no records persisted"))]
    RunFailed { report: RunReport },
}
