//! Paced, retrying HTTP access to one Zentao installation.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

/// 429 and 5xx are worth another attempt; anything else is the caller's problem.
pub fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: usize,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Doubling delay before retry number `retry` (zero-based), never above the ceiling.
    pub fn delay(&self, retry: usize) -> Duration {
        let factor = 2u32.checked_pow(retry as u32).unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.ceiling)
    }

    /// A server-sent `Retry-After` (seconds) wins over the computed delay, within the ceiling.
    fn delay_for(&self, retry: usize, headers: &HeaderMap) -> Duration {
        headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(|secs| Duration::from_secs(secs).min(self.ceiling))
            .unwrap_or_else(|| self.delay(retry))
    }
}

/// Request pacing: one request per `interval` on average, up to `burst` back to back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub interval: Duration,
    pub burst: u32,
}

impl RateLimit {
    /// Spreads an hourly request budget evenly; the burst is at most one second's worth.
    pub fn per_hour(requests_per_hour: u32) -> Option<Self> {
        if requests_per_hour == 0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs(3600) / requests_per_hour,
            burst: (requests_per_hour / 3600).max(1),
        })
    }
}

/// Generic cell rate pacer; callers reserve a slot under the lock and sleep outside it.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    tolerance: Duration,
    next_due: Mutex<Instant>,
}

impl RequestPacer {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            interval: limit.interval,
            tolerance: limit.interval.saturating_mul(limit.burst.saturating_sub(1)),
            next_due: Mutex::new(Instant::now()),
        }
    }

    pub async fn wait_turn(&self) {
        let wait = {
            let mut next_due = self.next_due.lock().await;
            let now = Instant::now();
            let allowed_at = next_due.checked_sub(self.tolerance).unwrap_or(now);
            *next_due = (*next_due).max(now) + self.interval;
            allowed_at.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Concurrent requests against one installation.
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    /// `None` leaves pacing to the connection's hourly limit.
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 4,
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json(&self) -> Result<serde_json::Value, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Unsupported(String),
    #[error("remote database query failed: {0}")]
    Database(String),
    #[error("fetcher is shut down")]
    Closed,
}

/// HTTP client bound to one connection: bounded in flight, paced, retried.
#[derive(Debug)]
pub struct HttpFetcher {
    label: String,
    client: reqwest::Client,
    permits: Semaphore,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(label: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            label: label.into(),
            client,
            permits: Semaphore::new(config.max_in_flight.max(1)),
            pacer: config.rate_limit.map(RequestPacer::new),
            retry: config.retry,
        })
    }

    /// Later and waiting requests fail with [`FetchError::Closed`].
    pub fn shutdown(&self) {
        self.permits.close();
    }

    pub async fn get(&self, url: &str, headers: HeaderMap) -> Result<FetchedResponse, FetchError> {
        self.send(url, |client| client.get(url).headers(headers.clone()))
            .await
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        self.send(url, |client| client.post(url).json(body)).await
    }

    /// Sends the request `build` produces, rebuilding it for every attempt.
    pub async fn send<F>(&self, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _permit = self.permits.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("http_fetch", connection = %self.label, url);
        self.attempts(build).instrument(span).await
    }

    async fn attempts<F>(&self, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut retry = 0;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }
            let wait = match build(&self.client).send().await {
                Ok(resp) if resp.status().is_success() => return collect(resp).await,
                Ok(resp) => {
                    let status = resp.status();
                    if !should_retry_status(status) || retry >= self.retry.retries {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    debug!(%status, retry, "retrying http request");
                    self.retry.delay_for(retry, resp.headers())
                }
                Err(err) => {
                    if !should_retry_error(&err) || retry >= self.retry.retries {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, retry, "retrying http request");
                    self.retry.delay(retry)
                }
            };
            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }
}

async fn collect(resp: Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    let body = resp.bytes().await?.to_vec();
    Ok(FetchedResponse {
        status,
        final_url,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_fetcher() -> HttpFetcher {
        HttpFetcher::new(
            "1",
            HttpClientConfig {
                retry: RetryPolicy {
                    retries: 2,
                    first_delay: Duration::from_millis(1),
                    ceiling: Duration::from_millis(5),
                },
                ..Default::default()
            },
        )
        .expect("fetcher")
    }

    #[test]
    fn retry_delays_double_up_to_the_ceiling() {
        let policy = RetryPolicy {
            retries: 5,
            first_delay: Duration::from_millis(100),
            ceiling: Duration::from_millis(350),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
        assert_eq!(policy.delay(40), Duration::from_millis(350));
    }

    #[test]
    fn retry_after_header_overrides_the_backoff() {
        let policy = RetryPolicy {
            retries: 1,
            first_delay: Duration::from_millis(10),
            ceiling: Duration::from_secs(3),
        };
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(policy.delay_for(0, &headers), Duration::from_secs(2));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("60"));
        assert_eq!(policy.delay_for(0, &headers), Duration::from_secs(3));
        assert_eq!(policy.delay_for(0, &HeaderMap::new()), Duration::from_millis(10));
    }

    #[test]
    fn hourly_budget_becomes_a_rate_limit() {
        let fast = RateLimit::per_hour(18_000).expect("limit");
        assert_eq!(fast.burst, 5);
        assert_eq!(fast.interval, Duration::from_millis(200));

        let slow = RateLimit::per_hour(60).expect("limit");
        assert_eq!(slow.burst, 1);
        assert_eq!(slow.interval, Duration::from_secs(60));

        assert_eq!(RateLimit::per_hour(0), None);
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_allows_a_burst_then_spaces_requests() {
        let pacer = RequestPacer::new(RateLimit {
            interval: Duration::from_secs(1),
            burst: 2,
        });
        let start = Instant::now();
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(start.elapsed() < Duration::from_millis(10));
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api.php/v1/users"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api.php/v1/users"))
            .and(header("Token", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"users": []})))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert("Token", HeaderValue::from_static("abc"));
        let url = format!("{}/api.php/v1/users", server.uri());
        let resp = quick_fetcher().get(&url, headers).await.expect("fetch");

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.json().expect("json")["users"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/missing", server.uri());
        let err = quick_fetcher()
            .get(&url, HeaderMap::new())
            .await
            .expect_err("404");
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_requests() {
        let fetcher = quick_fetcher();
        fetcher.shutdown();
        let err = fetcher
            .get("http://127.0.0.1:9/never", HeaderMap::new())
            .await
            .expect_err("closed");
        assert!(matches!(err, FetchError::Closed));
    }
}
