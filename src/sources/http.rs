use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use super::{FetchError, RateLimiter};

const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// One rate-limited GET with retry. 429, 5xx and transport errors back off
/// exponentially up to `max_attempts`; any other 4xx and malformed JSON fail
/// the page immediately.
pub(crate) async fn fetch_json(
    client: &Client,
    limiter: &RateLimiter,
    timeout: Duration,
    max_attempts: u32,
    url: &str,
    query: &[(&str, String)],
) -> Result<Value, FetchError> {
    let mut last_error = String::new();

    for attempt in 1..=max_attempts.max(1) {
        if attempt > 1 {
            let backoff = BACKOFF_BASE * 2u32.saturating_pow(attempt - 2);
            warn!("Retrying {} (attempt {}/{}) after {:?}", url, attempt, max_attempts, backoff);
            sleep(backoff).await;
        }

        limiter.acquire().await;

        let response = match client.get(url).query(query).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                last_error = e.to_string();
                continue;
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            last_error = format!("status {}", status.as_u16());
            continue;
        }
        if status.is_client_error() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        return response.json::<Value>().await.map_err(|e| FetchError::Json {
            url: url.to_string(),
            message: e.to_string(),
        });
    }

    Err(FetchError::RetriesExhausted {
        attempts: max_attempts.max(1),
        url: url.to_string(),
        message: last_error,
    })
}
