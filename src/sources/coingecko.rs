use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::http::fetch_json;
use super::{FetchError, PriceSource, RateLimiter};
use crate::config::Settings;

pub const COINGECKO_PUBLIC_URL: &str = "https://api.coingecko.com/api/v3";
pub const COINGECKO_PRO_URL: &str = "https://pro-api.coingecko.com/api/v3";

/// Adapter for the CoinGecko history API. Uses the pro endpoint when an API
/// key is configured, the public endpoint (at a reduced rate) otherwise.
pub struct CoinGeckoAdapter {
    client: Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    max_attempts: u32,
}

impl CoinGeckoAdapter {
    pub fn new(settings: &Settings) -> Self {
        let base_url = if settings.coingecko_api_key.is_some() {
            COINGECKO_PRO_URL
        } else {
            COINGECKO_PUBLIC_URL
        };
        Self::with_base_url(settings, base_url)
    }

    pub fn with_base_url(settings: &Settings, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            limiter: Arc::new(RateLimiter::per_minute(settings.coingecko_rate_limit_rpm)),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: settings.coingecko_api_key.clone(),
            timeout: settings.http_timeout,
            max_attempts: settings.max_fetch_attempts,
        }
    }
}

#[async_trait]
impl PriceSource for CoinGeckoAdapter {
    fn source_name(&self) -> &'static str {
        "coingecko"
    }

    async fn fetch_price(&self, coin_id: &str, date: NaiveDate) -> Result<Option<Value>, FetchError> {
        let url = format!("{}/coins/{}/history", self.base_url, coin_id);

        // The history endpoint takes dd-mm-yyyy.
        let mut query = vec![
            ("date", date.format("%d-%m-%Y").to_string()),
            ("localization", "false".to_string()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("x_cg_pro_api_key", key.clone()));
        }

        let body = fetch_json(&self.client, &self.limiter, self.timeout, self.max_attempts, &url, &query).await?;

        match body.get("market_data") {
            Some(market_data) if market_data.is_object() => {
                info!("Fetched coingecko market data for {} on {}", coin_id, date);
                Ok(Some(market_data.clone()))
            }
            _ => {
                // Dates before a coin's listing have no snapshot.
                warn!("No market data for {} on {}", coin_id, date);
                Ok(None)
            }
        }
    }
}
