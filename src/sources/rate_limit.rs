use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Cooperative self-throttle for one external source.
///
/// The last-request instant lives behind a mutex held across the sleep, so
/// the budget stays global when concurrent fetches share one limiter via
/// `Arc`: callers queue up and each still waits out the full interval.
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let min_interval = if requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(60.0 / requests_per_minute as f64)
        };
        Self::with_interval(min_interval)
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the configured interval has passed since the previous
    /// acquisition, then stamp the new one.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn interval_derived_from_rpm() {
        assert_eq!(RateLimiter::per_minute(60).min_interval(), Duration::from_secs(1));
        assert_eq!(RateLimiter::per_minute(20).min_interval(), Duration::from_secs(3));
        assert_eq!(RateLimiter::per_minute(0).min_interval(), Duration::ZERO);
    }

    #[tokio::test]
    async fn sequential_acquisitions_respect_interval() {
        let limiter = RateLimiter::with_interval(Duration::from_millis(50));
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        // 4 requests means 3 full intervals of waiting
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_budget() {
        let limiter = Arc::new(RateLimiter::with_interval(Duration::from_millis(40)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
