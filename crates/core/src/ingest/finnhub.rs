use crate::config::{env_parse, Settings};
use crate::domain::contract::{WireProfile, WireQuote};
use crate::domain::market::{Profile, Quote};
use crate::ingest::error::{FetchCause, FetchError};
use crate::ingest::metrics::ApiMetrics;
use crate::ingest::provider::QuoteSource;
use crate::ingest::rate_limiter::RateLimiter;
use anyhow::Context;
use chrono::Utc;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://finnhub.io/api/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_QUOTA_RETRIES: u32 = 3;
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

const QUOTE_ENDPOINT: &str = "quote";
const PROFILE_ENDPOINT: &str = "stock/profile2";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    /// Retries for transport errors and 5xx; backoff doubles from `backoff_base`.
    pub max_retries: u32,
    pub backoff_base: Duration,
    /// Ceiling on 429-driven retries of a single request.
    pub max_quota_retries: u32,
    /// Stall used when a 429 carries no usable `Retry-After`.
    pub default_retry_after: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_RETRIES,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            max_quota_retries: DEFAULT_QUOTA_RETRIES,
            default_retry_after: Duration::from_secs(DEFAULT_RETRY_AFTER_SECS),
        }
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let api_key = settings.require_finnhub_api_key()?;
        let base_url = settings
            .finnhub_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let mut out = Self::new(base_url, api_key);
        if let Some(n) = env_parse::<u64>("QUOTE_TIMEOUT_SECS") {
            out.timeout = Duration::from_secs(n);
        }
        if let Some(n) = env_parse::<u32>("QUOTE_MAX_RETRIES") {
            out.max_retries = n;
        }
        if let Some(n) = env_parse::<u64>("QUOTE_BACKOFF_BASE_MS") {
            out.backoff_base = Duration::from_millis(n);
        }
        if let Some(n) = env_parse::<u32>("QUOTE_MAX_QUOTA_RETRIES") {
            out.max_quota_retries = n;
        }
        if let Some(n) = env_parse::<u64>("QUOTE_DEFAULT_RETRY_AFTER_SECS") {
            out.default_retry_after = Duration::from_secs(n);
        }
        Ok(out)
    }
}

/// HTTP quote client. One pooled connection set; every attempt goes through the shared limiter.
#[derive(Debug, Clone)]
pub struct FinnhubClient {
    http: reqwest::Client,
    config: ClientConfig,
    limiter: Arc<RateLimiter>,
    metrics: Arc<ApiMetrics>,
}

impl FinnhubClient {
    pub fn new(
        config: ClientConfig,
        limiter: Arc<RateLimiter>,
        metrics: Arc<ApiMetrics>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build quote API http client")?;

        tracing::info!(base_url = %config.base_url, "quote API client initialized");

        Ok(Self {
            http,
            config,
            limiter,
            metrics,
        })
    }

    pub fn from_settings(
        settings: &Settings,
        limiter: Arc<RateLimiter>,
        metrics: Arc<ApiMetrics>,
    ) -> anyhow::Result<Self> {
        Self::new(ClientConfig::from_settings(settings)?, limiter, metrics)
    }

    pub fn metrics(&self) -> &Arc<ApiMetrics> {
        &self.metrics
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        symbol: &str,
    ) -> Result<T, FetchCause> {
        let url = self.url(endpoint);
        let mut retries: u32 = 0;
        let mut quota_rejections: u32 = 0;

        loop {
            self.limiter.acquire().await;
            self.metrics.record_call();

            let res = self
                .http
                .get(&url)
                .query(&[("symbol", symbol), ("token", self.config.api_key.as_str())])
                .send()
                .await;

            let res = match res {
                Ok(r) => r,
                Err(err) => {
                    let detail = format!("{endpoint} request failed: {err}");
                    self.backoff_or_give_up(&mut retries, symbol, detail).await?;
                    continue;
                }
            };

            let status = res.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                quota_rejections += 1;
                self.metrics.record_quota_rejection();
                if quota_rejections > self.config.max_quota_retries {
                    return Err(FetchCause::QuotaExceeded {
                        attempts: quota_rejections,
                    });
                }
                let retry_after =
                    parse_retry_after(res.headers()).unwrap_or(self.config.default_retry_after);
                tracing::warn!(
                    %symbol,
                    endpoint,
                    attempt = quota_rejections,
                    retry_after_secs = retry_after.as_secs(),
                    "rate limit exceeded (429); waiting for the budget window"
                );
                self.metrics.record_retry();
                self.limiter.on_quota_rejected(retry_after);
                continue;
            }

            if status.is_server_error() {
                let detail = format!("{endpoint} HTTP {status}");
                self.backoff_or_give_up(&mut retries, symbol, detail).await?;
                continue;
            }

            let text = match res.text().await {
                Ok(t) => t,
                Err(err) => {
                    let detail = format!("failed to read {endpoint} response: {err}");
                    self.backoff_or_give_up(&mut retries, symbol, detail).await?;
                    continue;
                }
            };

            if status == StatusCode::NOT_FOUND {
                return Err(FetchCause::NotFound);
            }
            if !status.is_success() {
                return Err(FetchCause::Rejected {
                    status: status.as_u16(),
                    message: truncate(&text, 200),
                });
            }

            return serde_json::from_str::<T>(&text).map_err(|err| {
                FetchCause::Malformed(format!(
                    "{endpoint} response does not parse ({err}): {}",
                    truncate(&text, 200)
                ))
            });
        }
    }

    /// Sleeps the next backoff step, or returns the terminal error once retries are spent.
    async fn backoff_or_give_up(
        &self,
        retries: &mut u32,
        symbol: &str,
        detail: String,
    ) -> Result<(), FetchCause> {
        if *retries >= self.config.max_retries {
            tracing::debug!(%symbol, retries = *retries, error = %detail, "giving up after retries");
            return Err(FetchCause::Transient(detail));
        }
        *retries += 1;
        self.metrics.record_retry();
        let backoff = backoff_delay(self.config.backoff_base, *retries);
        tracing::debug!(%symbol, attempt = *retries, ?backoff, error = %detail, "quote API call failed; retrying");
        tokio::time::sleep(backoff).await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl QuoteSource for FinnhubClient {
    fn provider_name(&self) -> &'static str {
        "finnhub"
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, FetchError> {
        let fetched_at = Utc::now();
        self.request_json::<WireQuote>(QUOTE_ENDPOINT, symbol)
            .await
            .and_then(|wire| wire.validate_and_into_quote(symbol, fetched_at))
            .map_err(|cause| FetchError::new(symbol, cause))
    }

    async fn get_profile(&self, symbol: &str) -> Result<Profile, FetchError> {
        self.request_json::<WireProfile>(PROFILE_ENDPOINT, symbol)
            .await
            .and_then(|wire| wire.validate_and_into_profile(symbol))
            .map_err(|cause| FetchError::new(symbol, cause))
    }
}

/// `base * 2^(retry-1)`, saturating instead of overflowing for large retry counts.
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let v = headers.get(RETRY_AFTER)?.to_str().ok()?;
    v.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::rate_limiter::RateLimitConfig;
    use chrono::NaiveDate;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> FinnhubClient {
        let mut config = ClientConfig::new(server.uri(), "test-key");
        config.backoff_base = Duration::from_millis(5);
        config.default_retry_after = Duration::ZERO;
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::unthrottled(6_000)));
        FinnhubClient::new(config, limiter, Arc::new(ApiMetrics::default())).unwrap()
    }

    fn quote_body() -> serde_json::Value {
        serde_json::json!({"c": 105.0, "h": 106.0, "l": 99.0, "o": 100.0, "pc": 100.0,
                           "t": 1769547600, "v": 2_500_000})
    }

    #[tokio::test]
    async fn fetches_quote_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .and(query_param("symbol", "AAPL"))
            .and(query_param("token", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(quote_body()))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server);
        let q = c.get_quote("AAPL").await.unwrap();
        assert_eq!(q.price, 105.0);
        assert_eq!(q.volume, 2_500_000);
        assert!((q.change_percent() - 5.0).abs() < 1e-9);
        assert_eq!(c.metrics().snapshot().calls_made, 1);
    }

    #[tokio::test]
    async fn retries_server_errors_three_times_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .expect(4)
            .mount(&server)
            .await;

        let c = client(&server);
        let err = c.get_quote("MSFT").await.unwrap_err();
        assert_eq!(err.symbol, "MSFT");
        assert!(matches!(err.cause, FetchCause::Transient(_)));

        let m = c.metrics().snapshot();
        assert_eq!(m.calls_made, 4);
        assert_eq!(m.calls_retried, 3);
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .respond_with(ResponseTemplate::new(200).set_body_json(quote_body()))
            .mount(&server)
            .await;

        let c = client(&server);
        assert!(c.get_quote("NVDA").await.is_ok());
        assert_eq!(c.metrics().snapshot().calls_made, 2);
    }

    #[tokio::test]
    async fn quota_rejections_do_not_consume_generic_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .respond_with(ResponseTemplate::new(200).set_body_json(quote_body()))
            .mount(&server)
            .await;

        let mut config = ClientConfig::new(server.uri(), "k");
        config.max_retries = 0;
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::unthrottled(6_000)));
        let c = FinnhubClient::new(config, limiter, Arc::new(ApiMetrics::default())).unwrap();

        assert!(c.get_quote("TSLA").await.is_ok());
        let m = c.metrics().snapshot();
        assert_eq!(m.quota_rejected, 2);
        assert_eq!(m.calls_made, 3);
    }

    #[tokio::test]
    async fn quota_retry_ceiling_surfaces_quota_exceeded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .respond_with(ResponseTemplate::new(429))
            .expect(4)
            .mount(&server)
            .await;

        let c = client(&server);
        let err = c.get_quote("AMD").await.unwrap_err();
        assert_eq!(err.cause, FetchCause::QuotaExceeded { attempts: 4 });
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .and(query_param("symbol", "GONE"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .and(query_param("symbol", "DENY"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server);
        assert_eq!(c.get_quote("GONE").await.unwrap_err().cause, FetchCause::NotFound);
        assert_eq!(
            c.get_quote("DENY").await.unwrap_err().cause,
            FetchCause::Rejected {
                status: 403,
                message: "forbidden".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unparseable_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server);
        assert!(matches!(
            c.get_quote("X").await.unwrap_err().cause,
            FetchCause::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn full_fetch_degrades_when_profile_is_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quote"))
            .respond_with(ResponseTemplate::new(200).set_body_json(quote_body()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/stock/profile2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let c = client(&server);
        let as_of = NaiveDate::from_ymd_opt(2026, 1, 27).unwrap();
        let s = c.get_full("NEWCO", as_of).await.unwrap();
        assert_eq!(s.name, "NEWCO");
        assert_eq!(s.exchange, "Unknown");
        assert_eq!(s.market_cap, None);
        assert_eq!(c.metrics().snapshot().calls_made, 2);
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut h = HeaderMap::new();
        h.insert(RETRY_AFTER, "17".parse().unwrap());
        assert_eq!(parse_retry_after(&h), Some(Duration::from_secs(17)));
        h.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&h), None);
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        // Well past 32 retries the shift would overflow a u32.
        assert_eq!(backoff_delay(base, 40), base * u32::MAX);
    }
}
