//! Validation boundary between raw API payloads and the warehouse.
//!
//! Everything downstream of this module works with strongly-typed records;
//! nothing here performs network or database I/O. Unknown extra fields in a
//! raw payload are ignored, missing or malformed expected fields reject only
//! the record they belong to.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("wrong type for field {0}")]
    WrongType(&'static str),
    #[error("field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
    #[error("field {field} has invalid length {len} (expected {min}..={max})")]
    BadLength {
        field: &'static str,
        len: usize,
        min: usize,
        max: usize,
    },
    #[error("unparseable timestamp in {field}: {value}")]
    BadTimestamp { field: &'static str, value: String },
    #[error("empty identifier: {0}")]
    EmptyIdentifier(&'static str),
    #[error("field {field} is in the future: {value}")]
    FutureDate { field: &'static str, value: String },
}

/// A block confirmed on one chain, keyed by (coin_symbol, height).
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub coin_symbol: String,
    pub height: i64,
    pub block_hash: String,
    pub block_time: Option<DateTime<Utc>>,
    pub transaction_count: Option<i32>,
    pub size_bytes: Option<i32>,
    pub difficulty: Option<Decimal>,
    pub miner: Option<String>,
}

impl BlockRecord {
    pub fn from_raw(coin_symbol: &str, raw: &Value) -> Result<Self, ValidationError> {
        let obj = require_object(raw)?;
        let height = require_i64(obj, "id")?;
        if height < 0 {
            return Err(ValidationError::OutOfRange {
                field: "id",
                value: height.to_string(),
            });
        }
        let block_hash = require_identifier(obj, "hash", 64, 255)?;

        Ok(Self {
            coin_symbol: require_symbol(coin_symbol)?,
            height,
            block_hash,
            block_time: optional_timestamp(obj, "time")?,
            transaction_count: optional_count(obj, "transaction_count")?,
            size_bytes: optional_count(obj, "size")?,
            difficulty: optional_non_negative_decimal(obj, "difficulty")?,
            // The source's best guess at the mining pool, an opaque tag.
            miner: optional_string(obj, "guessed_miner", 100)?,
        })
    }
}

/// A confirmed transaction, keyed by (coin_symbol, tx_hash). The containing
/// block is a soft reference: blocks and transactions may arrive in either
/// order, so no hard foreign key is enforced.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub coin_symbol: String,
    pub tx_hash: String,
    pub block_height: Option<i64>,
    pub tx_time: Option<DateTime<Utc>>,
    pub fee_usd: Option<Decimal>,
    pub output_total_usd: Option<Decimal>,
    pub input_count: Option<i32>,
    pub output_count: Option<i32>,
    pub size_bytes: Option<i32>,
    pub is_coinbase: bool,
}

impl TransactionRecord {
    pub fn from_raw(coin_symbol: &str, raw: &Value) -> Result<Self, ValidationError> {
        let obj = require_object(raw)?;
        let tx_hash = require_identifier(obj, "hash", 64, 255)?;

        let block_height = match optional_i64(obj, "block_id")? {
            Some(h) if h < 0 => {
                return Err(ValidationError::OutOfRange {
                    field: "block_id",
                    value: h.to_string(),
                })
            }
            other => other,
        };

        Ok(Self {
            coin_symbol: require_symbol(coin_symbol)?,
            tx_hash,
            block_height,
            tx_time: optional_timestamp(obj, "time")?,
            fee_usd: optional_non_negative_decimal(obj, "fee_usd")?,
            output_total_usd: optional_non_negative_decimal(obj, "output_total_usd")?,
            input_count: optional_count(obj, "input_count")?,
            output_count: optional_count(obj, "output_count")?,
            size_bytes: optional_count(obj, "size")?,
            is_coinbase: obj.get("is_coinbase").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

/// Address-level activity, keyed by (coin_symbol, address).
#[derive(Debug, Clone, PartialEq)]
pub struct AddressRecord {
    pub coin_symbol: String,
    pub address: String,
    pub first_seen_time: Option<DateTime<Utc>>,
    pub last_seen_time: Option<DateTime<Utc>>,
    pub transaction_count: Option<i32>,
    pub received_total_usd: Option<Decimal>,
    pub spent_total_usd: Option<Decimal>,
    pub balance_usd: Option<Decimal>,
}

impl AddressRecord {
    pub fn from_raw(coin_symbol: &str, address: &str, raw: &Value) -> Result<Self, ValidationError> {
        let obj = require_object(raw)?;
        if address.is_empty() {
            return Err(ValidationError::EmptyIdentifier("address"));
        }
        if address.len() < 20 || address.len() > 255 {
            return Err(ValidationError::BadLength {
                field: "address",
                len: address.len(),
                min: 20,
                max: 255,
            });
        }

        Ok(Self {
            coin_symbol: require_symbol(coin_symbol)?,
            address: address.to_string(),
            first_seen_time: optional_timestamp(obj, "first_seen_receiving")?,
            last_seen_time: optional_timestamp(obj, "last_seen_spending")?,
            transaction_count: optional_count(obj, "transaction_count")?,
            received_total_usd: optional_non_negative_decimal(obj, "received_usd")?,
            spent_total_usd: optional_non_negative_decimal(obj, "spent_usd")?,
            // Sources occasionally report a marginally negative balance after
            // USD rounding; stored as-is.
            balance_usd: optional_decimal(obj, "balance_usd")?,
        })
    }
}

/// Daily market snapshot, keyed by (coin_id, price_date). A later fetch for
/// the same key overwrites prior values.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketPriceRecord {
    pub coin_id: String,
    pub price_date: NaiveDate,
    pub price_usd: Option<Decimal>,
    pub volume_usd: Option<Decimal>,
    pub market_cap_usd: Option<Decimal>,
}

impl MarketPriceRecord {
    /// `raw` is the `market_data` object of a CoinGecko history response.
    pub fn from_raw(coin_id: &str, price_date: NaiveDate, raw: &Value) -> Result<Self, ValidationError> {
        let obj = require_object(raw)?;
        if coin_id.is_empty() {
            return Err(ValidationError::EmptyIdentifier("coin_id"));
        }
        if price_date > Utc::now().date_naive() {
            return Err(ValidationError::FutureDate {
                field: "price_date",
                value: price_date.to_string(),
            });
        }

        Ok(Self {
            coin_id: coin_id.to_string(),
            price_date,
            price_usd: optional_non_negative_usd(obj, "current_price")?,
            volume_usd: optional_non_negative_usd(obj, "total_volume")?,
            market_cap_usd: optional_non_negative_usd(obj, "market_cap")?,
        })
    }
}

fn require_object(raw: &Value) -> Result<&serde_json::Map<String, Value>, ValidationError> {
    raw.as_object().ok_or(ValidationError::WrongType("record"))
}

fn require_symbol(coin_symbol: &str) -> Result<String, ValidationError> {
    if coin_symbol.is_empty() {
        return Err(ValidationError::EmptyIdentifier("coin_symbol"));
    }
    if coin_symbol.len() < 2 || coin_symbol.len() > 10 {
        return Err(ValidationError::BadLength {
            field: "coin_symbol",
            len: coin_symbol.len(),
            min: 2,
            max: 10,
        });
    }
    Ok(coin_symbol.to_ascii_uppercase())
}

fn require_identifier(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
    min: usize,
    max: usize,
) -> Result<String, ValidationError> {
    let value = obj
        .get(field)
        .ok_or(ValidationError::MissingField(field))?
        .as_str()
        .ok_or(ValidationError::WrongType(field))?;
    if value.is_empty() {
        return Err(ValidationError::EmptyIdentifier(field));
    }
    if value.len() < min || value.len() > max {
        return Err(ValidationError::BadLength {
            field,
            len: value.len(),
            min,
            max,
        });
    }
    Ok(value.to_string())
}

fn optional_string(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
    max: usize,
) -> Result<Option<String>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) if s.len() > max => Err(ValidationError::BadLength {
            field,
            len: s.len(),
            min: 1,
            max,
        }),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ValidationError::WrongType(field)),
    }
}

fn require_i64(obj: &serde_json::Map<String, Value>, field: &'static str) -> Result<i64, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::Number(n)) => n.as_i64().ok_or(ValidationError::WrongType(field)),
        // Dashboard endpoints key block maps by stringified height.
        Some(Value::String(s)) => s.parse().map_err(|_| ValidationError::WrongType(field)),
        Some(_) => Err(ValidationError::WrongType(field)),
    }
}

fn optional_i64(obj: &serde_json::Map<String, Value>, field: &'static str) -> Result<Option<i64>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or(ValidationError::WrongType(field)),
        Some(_) => Err(ValidationError::WrongType(field)),
    }
}

fn optional_count(obj: &serde_json::Map<String, Value>, field: &'static str) -> Result<Option<i32>, ValidationError> {
    match optional_i64(obj, field)? {
        None => Ok(None),
        Some(v) if v < 0 => Err(ValidationError::OutOfRange {
            field,
            value: v.to_string(),
        }),
        Some(v) => i32::try_from(v).map(Some).map_err(|_| ValidationError::OutOfRange {
            field,
            value: v.to_string(),
        }),
    }
}

fn optional_decimal(obj: &serde_json::Map<String, Value>, field: &'static str) -> Result<Option<Decimal>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string())
            .map(Some)
            .map_err(|_| ValidationError::WrongType(field)),
        Some(Value::String(s)) => Decimal::from_str(s).map(Some).map_err(|_| ValidationError::WrongType(field)),
        Some(_) => Err(ValidationError::WrongType(field)),
    }
}

fn optional_non_negative_decimal(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<Option<Decimal>, ValidationError> {
    match optional_decimal(obj, field)? {
        Some(d) if d < Decimal::ZERO => Err(ValidationError::OutOfRange {
            field,
            value: d.to_string(),
        }),
        other => Ok(other),
    }
}

/// CoinGecko nests per-currency quotes: `{"current_price": {"usd": 42000.0}}`.
fn optional_non_negative_usd(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<Option<Decimal>, ValidationError> {
    let quotes = match obj.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(quotes)) => quotes,
        Some(_) => return Err(ValidationError::WrongType(field)),
    };
    match quotes.get("usd") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let d = Decimal::from_str(&n.to_string()).map_err(|_| ValidationError::WrongType(field))?;
            if d < Decimal::ZERO {
                return Err(ValidationError::OutOfRange {
                    field,
                    value: d.to_string(),
                });
            }
            Ok(Some(d))
        }
        Some(_) => Err(ValidationError::WrongType(field)),
    }
}

/// Timestamp policy: an explicit offset or trailing `Z` is honored, a naive
/// timestamp is assumed UTC. Blockchair emits `YYYY-MM-DD HH:MM:SS` naive.
fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(ValidationError::BadTimestamp {
        field,
        value: value.to_string(),
    })
}

fn optional_timestamp(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_timestamp(field, s).map(Some),
        Some(_) => Err(ValidationError::WrongType(field)),
    }
}
