//! Rate budget calculation for async API clients.
//!
//! A budget is picked in priority order:
//!
//! 1. a fixed per-hour limit configured by the user or plugin
//! 2. a dynamic rate check: one request whose response is parsed for the remaining
//!    quota and reset window, minus a 5% safety margin
//! 3. the global `api.requests_per_hour` fallback

use std::sync::Arc;
use std::time::Duration;

use crate::client::api_client::ApiClient;
use crate::error::{HarvestError, Result};
use crate::http::{HttpMethod, HttpResponse};
use crate::retry::{RetryConfig, with_retry};
use crate::scheduler::calc_tick_interval;

/// Fallback budget when nothing more specific is known.
pub const DEFAULT_RATE_LIMIT_PER_HOUR: u32 = 18_000;

/// Share of a reported quota the client allows itself to use.
pub const SAFETY_MARGIN: f64 = 0.95;

/// Assumed response time used to size the worker pool.
///
/// Requests are sent at a fixed pace, so slow servers need more workers to
/// keep that pace.
pub const ASSUMED_RESPONSE_TIME: Duration = Duration::from_secs(5);

const HOUR: Duration = Duration::from_secs(3600);

/// `requests` allowed per `per`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudget {
    pub requests: u32,
    pub per: Duration,
}

impl RateBudget {
    pub fn per_hour(requests: u32) -> Self {
        Self {
            requests,
            per: HOUR,
        }
    }

    /// Interval between two requests.
    pub fn tick_interval(&self) -> Result<Duration> {
        calc_tick_interval(self.requests, self.per)
    }

    /// Workers needed to keep the pace while responses take
    /// [`ASSUMED_RESPONSE_TIME`].
    pub fn workers(&self) -> usize {
        let windows = (self.per.as_secs_f64() / ASSUMED_RESPONSE_TIME.as_secs_f64()).floor();
        let windows = (windows as u64).max(1);
        ((u64::from(self.requests) / windows) as usize).max(1)
    }
}

/// Reads a budget from a rate check response.
///
/// Returning a zero `per` means "unknown" and selects the global fallback.
pub type RateCheckParser = Arc<dyn Fn(&HttpResponse) -> Result<RateBudget> + Send + Sync>;

/// Chooses the request budget for an API.
#[derive(Clone)]
pub struct RateLimitCalculator {
    /// Fixed limit that overrides everything else.
    pub user_rate_limit_per_hour: Option<u32>,
    /// Limit used when neither a fixed limit nor a rate check applies.
    pub global_rate_limit_per_hour: u32,
    /// Retries for a failing rate check.
    pub max_retry: usize,
    /// Rate check request method.
    pub method: HttpMethod,
    /// Rate check request path, relative to the client's endpoint.
    pub rate_check_path: String,
    /// Plugin parser for the rate check response.
    pub dynamic_rate_limit: Option<RateCheckParser>,
}

impl Default for RateLimitCalculator {
    fn default() -> Self {
        Self {
            user_rate_limit_per_hour: None,
            global_rate_limit_per_hour: DEFAULT_RATE_LIMIT_PER_HOUR,
            max_retry: 3,
            method: HttpMethod::Options,
            rate_check_path: String::new(),
            dynamic_rate_limit: None,
        }
    }
}

impl std::fmt::Debug for RateLimitCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitCalculator")
            .field("user_rate_limit_per_hour", &self.user_rate_limit_per_hour)
            .field("global_rate_limit_per_hour", &self.global_rate_limit_per_hour)
            .field("max_retry", &self.max_retry)
            .field("method", &self.method)
            .field("rate_check_path", &self.rate_check_path)
            .field("dynamic", &self.dynamic_rate_limit.is_some())
            .finish()
    }
}

impl RateLimitCalculator {
    /// Calculator with a fixed per-hour limit.
    pub fn fixed(per_hour: u32) -> Self {
        Self {
            user_rate_limit_per_hour: Some(per_hour),
            ..Self::default()
        }
    }

    /// Calculator that queries the API with `parser`.
    pub fn dynamic(parser: RateCheckParser) -> Self {
        Self {
            dynamic_rate_limit: Some(parser),
            ..Self::default()
        }
    }

    /// Pick the budget for `client`.
    ///
    /// # Errors
    /// Fails when the rate check keeps failing after `max_retry` retries, when the
    /// parser rejects the rate check response, or when the resulting budget is zero.
    pub async fn calculate(&self, client: &ApiClient) -> Result<RateBudget> {
        if let Some(limit) = self.user_rate_limit_per_hour.filter(|l| *l > 0) {
            tracing::debug!(requests_per_hour = limit, "Using fixed rate limit");
            return Ok(RateBudget::per_hour(limit));
        }

        if let Some(parser) = &self.dynamic_rate_limit {
            let response = with_retry(
                || client.request(self.method, &self.rate_check_path, &[], &[], None),
                RetryConfig::with_max_retries(self.max_retry),
                client.endpoint().as_str(),
                None,
            )
            .await?;

            match response {
                Some(response) => {
                    let reported = parser(&response)?;
                    if !reported.per.is_zero() {
                        let requests = (f64::from(reported.requests) * SAFETY_MARGIN).floor() as u32;
                        let budget = RateBudget {
                            requests: requests.max(1),
                            per: reported.per,
                        };
                        tracing::debug!(
                            requests = budget.requests,
                            per = ?budget.per,
                            "Using reported rate limit"
                        );
                        return Ok(budget);
                    }
                    tracing::debug!("Rate check returned no window, using global rate limit");
                }
                None => tracing::debug!("Rate check response ignored, using global rate limit"),
            }
        }

        if self.global_rate_limit_per_hour == 0 {
            return Err(HarvestError::config("api.requests_per_hour must be positive"));
        }
        Ok(RateBudget::per_hour(self.global_rate_limit_per_hour))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MockTransport;

    const ENDPOINT: &str = "https://api.example.com/";

    fn client(transport: &MockTransport) -> ApiClient {
        ApiClient::new(ENDPOINT, Arc::new(transport.clone())).expect("client")
    }

    fn header_parser() -> RateCheckParser {
        Arc::new(|response: &HttpResponse| {
            let remaining = response
                .header("x-ratelimit-remaining")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| HarvestError::parse("missing x-ratelimit-remaining"))?;
            let reset_secs = response
                .header("x-ratelimit-reset-after")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            Ok(RateBudget {
                requests: remaining,
                per: Duration::from_secs(reset_secs),
            })
        })
    }

    #[test]
    fn budget_derives_tick_interval_and_workers() {
        let budget = RateBudget::per_hour(18_000);
        assert_eq!(budget.tick_interval().expect("interval"), Duration::from_millis(200));
        // 3600s / 5s = 720 windows
        assert_eq!(budget.workers(), 25);

        let tiny = RateBudget {
            requests: 3,
            per: Duration::from_secs(2),
        };
        assert_eq!(tiny.workers(), 3);
        assert_eq!(RateBudget::per_hour(10).workers(), 1);
    }

    #[tokio::test]
    async fn fixed_limit_wins() {
        let transport = MockTransport::new();
        let mut calculator = RateLimitCalculator::dynamic(header_parser());
        calculator.user_rate_limit_per_hour = Some(1200);

        let budget = calculator.calculate(&client(&transport)).await.expect("budget");
        assert_eq!(budget, RateBudget::per_hour(1200));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn rate_check_applies_safety_margin() {
        let transport = MockTransport::new();
        transport.push_response_with_headers(
            HttpMethod::Options,
            ENDPOINT,
            200,
            vec![
                ("X-RateLimit-Remaining".into(), "5000".into()),
                ("X-RateLimit-Reset-After".into(), "3600".into()),
            ],
            Vec::new(),
        );

        let budget = RateLimitCalculator::dynamic(header_parser())
            .calculate(&client(&transport))
            .await
            .expect("budget");
        assert_eq!(budget.requests, 4750);
        assert_eq!(budget.per, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn zero_window_falls_back_to_global() {
        let transport = MockTransport::new();
        transport.push_response_with_headers(
            HttpMethod::Options,
            ENDPOINT,
            200,
            vec![("X-RateLimit-Remaining".into(), "10".into())],
            Vec::new(),
        );

        let mut calculator = RateLimitCalculator::dynamic(header_parser());
        calculator.global_rate_limit_per_hour = 7200;
        let budget = calculator.calculate(&client(&transport)).await.expect("budget");
        assert_eq!(budget, RateBudget::per_hour(7200));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_check_is_retried_on_transport_failure() {
        let transport = MockTransport::new();
        transport.push_error(HttpMethod::Options, ENDPOINT, "connection reset");
        transport.push_response_with_headers(
            HttpMethod::Options,
            ENDPOINT,
            200,
            vec![
                ("X-RateLimit-Remaining".into(), "100".into()),
                ("X-RateLimit-Reset-After".into(), "60".into()),
            ],
            Vec::new(),
        );

        let budget = RateLimitCalculator::dynamic(header_parser())
            .calculate(&client(&transport))
            .await
            .expect("budget");
        assert_eq!(budget.requests, 95);
        assert_eq!(transport.count(ENDPOINT), 2);
    }

    #[tokio::test]
    async fn no_rate_check_uses_global_and_rejects_zero() {
        let transport = MockTransport::new();
        let budget = RateLimitCalculator::default()
            .calculate(&client(&transport))
            .await
            .expect("budget");
        assert_eq!(budget, RateBudget::per_hour(DEFAULT_RATE_LIMIT_PER_HOUR));

        let calculator = RateLimitCalculator {
            global_rate_limit_per_hour: 0,
            ..RateLimitCalculator::default()
        };
        let err = calculator
            .calculate(&client(&transport))
            .await
            .expect_err("zero budget");
        assert!(matches!(err, HarvestError::Config { .. }));
    }
}
