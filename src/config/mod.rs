use std::env;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// All runtime configuration, resolved once at process start.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub coingecko_api_key: Option<String>,
    pub coingecko_rate_limit_rpm: u32,
    pub blockchair_rate_limit_rpm: u32,
    pub batch_size: usize,
    pub http_timeout: Duration,
    pub max_fetch_attempts: u32,
    pub default_coins: Vec<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = match env::var("DATABASE_URL") {
            Ok(url) => url,
            // Fall back to the discrete DB_* variables the warehouse
            // deployment exports.
            Err(_) => {
                let host = env::var("DB_HOST").map_err(|_| ConfigError::MissingVar("DATABASE_URL or DB_HOST"))?;
                let port = env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
                let user = env::var("DB_USER_APP").map_err(|_| ConfigError::MissingVar("DB_USER_APP"))?;
                let password = env::var("DB_PASSWORD_APP").map_err(|_| ConfigError::MissingVar("DB_PASSWORD_APP"))?;
                let name = env::var("DB_NAME_APP").map_err(|_| ConfigError::MissingVar("DB_NAME_APP"))?;
                format!("postgresql://{}:{}@{}:{}/{}", user, password, host, port, name)
            }
        };

        let coingecko_api_key = env::var("COINGECKO_API_KEY").ok().filter(|k| !k.is_empty());
        if coingecko_api_key.is_none() {
            warn!("COINGECKO_API_KEY not set, using public endpoint at reduced rate");
        }

        let batch_size = parse_var("INGEST_BATCH_SIZE", 500usize)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                var: "INGEST_BATCH_SIZE",
                value: "0".to_string(),
            });
        }

        // Symbols, resolved against SUPPORTED_COINS when a run starts.
        let default_coins = env::var("DEFAULT_COINS")
            .unwrap_or_else(|_| "BTC,ETH,DOGE".to_string())
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        Ok(Self {
            database_url,
            coingecko_api_key,
            coingecko_rate_limit_rpm: parse_var("COINGECKO_RATE_LIMIT_RPM", 20)?,
            blockchair_rate_limit_rpm: parse_var("BLOCKCHAIR_RATE_LIMIT_RPM", 60)?,
            batch_size,
            http_timeout: Duration::from_secs(parse_var("HTTP_TIMEOUT_SECS", 30u64)?),
            max_fetch_attempts: parse_var("MAX_FETCH_ATTEMPTS", 3)?,
            default_coins,
        })
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid { var, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Static coin registry: symbol to per-source identifiers. Seeded into the
/// warehouse on startup; ingestion only runs for enabled coins.
#[derive(Debug, Clone)]
pub struct CoinConfig {
    pub symbol: &'static str,
    pub name: &'static str,
    pub coingecko_id: &'static str,
    pub blockchair_id: &'static str,
    pub ingestion_enabled: bool,
}

pub const SUPPORTED_COINS: &[CoinConfig] = &[
    CoinConfig {
        symbol: "BTC",
        name: "Bitcoin",
        coingecko_id: "bitcoin",
        blockchair_id: "bitcoin",
        ingestion_enabled: true,
    },
    CoinConfig {
        symbol: "ETH",
        name: "Ethereum",
        coingecko_id: "ethereum",
        blockchair_id: "ethereum",
        ingestion_enabled: true,
    },
    CoinConfig {
        symbol: "DOGE",
        name: "Dogecoin",
        coingecko_id: "dogecoin",
        blockchair_id: "dogecoin",
        ingestion_enabled: true,
    },
    CoinConfig {
        symbol: "LTC",
        name: "Litecoin",
        coingecko_id: "litecoin",
        blockchair_id: "litecoin",
        ingestion_enabled: false,
    },
    CoinConfig {
        symbol: "BCH",
        name: "Bitcoin Cash",
        coingecko_id: "bitcoin-cash",
        blockchair_id: "bitcoin-cash",
        ingestion_enabled: false,
    },
];

pub fn coin_by_symbol(symbol: &str) -> Option<&'static CoinConfig> {
    SUPPORTED_COINS.iter().find(|c| c.symbol.eq_ignore_ascii_case(symbol))
}

pub fn coin_by_blockchair_id(id: &str) -> Option<&'static CoinConfig> {
    SUPPORTED_COINS.iter().find(|c| c.blockchair_id == id)
}

pub fn coin_by_coingecko_id(id: &str) -> Option<&'static CoinConfig> {
    SUPPORTED_COINS.iter().find(|c| c.coingecko_id == id)
}

pub fn active_coins() -> impl Iterator<Item = &'static CoinConfig> {
    SUPPORTED_COINS.iter().filter(|c| c.ingestion_enabled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_coins_excludes_disabled() {
        let symbols: Vec<&str> = active_coins().map(|c| c.symbol).collect();
        assert!(symbols.contains(&"BTC"));
        assert!(!symbols.contains(&"LTC"));
    }

    #[test]
    fn symbol_lookup_is_case_insensitive() {
        assert_eq!(coin_by_symbol("btc").unwrap().name, "Bitcoin");
        assert!(coin_by_symbol("XYZ").is_none());
    }

    #[test]
    fn lookup_by_source_ids() {
        assert_eq!(coin_by_blockchair_id("bitcoin").unwrap().symbol, "BTC");
        assert_eq!(coin_by_coingecko_id("dogecoin").unwrap().symbol, "DOGE");
        assert!(coin_by_coingecko_id("unknown-coin").is_none());
    }
}
