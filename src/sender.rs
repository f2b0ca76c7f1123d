use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, sleep_until, Instant};

use crate::clock::Clock;
use crate::error::DeliveryError;
use crate::telemetry::RequestLedger;
use crate::types::WebhookPayload;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

const RETRY_AFTER: &str = "retry-after";
const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Status and headers of a completed HTTP exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    headers: HashMap<String, String>,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
        }
    }

    /// Header names are case-insensitive.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn parse_header<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.header(name).and_then(|v| v.trim().parse().ok())
    }
}

/// Outbound HTTP seam. One call is one POST of `payload` as JSON.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        payload: &WebhookPayload,
    ) -> Result<TransportResponse, DeliveryError>;
}

/// `reqwest`-backed transport.
#[cfg(feature = "http")]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        payload: &WebhookPayload,
    ) -> Result<TransportResponse, DeliveryError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Network(err.to_string())
                }
            })?;

        let mut result = TransportResponse::new(response.status().as_u16());
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                result = result.with_header(name.as_str(), value);
            }
        }
        Ok(result)
    }
}

/// Bounds on how long a sender keeps retrying throttled requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed for one logical send, including the first.
    pub max_attempts: u32,
    /// Cap on the sum of all 429 backoffs for one logical send.
    pub max_total_delay: Duration,
    /// Used when a 429 carries no `Retry-After`.
    pub default_retry_after: Duration,
    /// Added on top of every `Retry-After`.
    pub grace: Duration,
    /// Upper bound of random extra delay per backoff.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_total_delay: Duration::from_secs(120),
            default_retry_after: Duration::from_secs(1),
            grace: Duration::from_secs(1),
            jitter: Duration::ZERO,
        }
    }
}

/// Remote quota as last reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitState {
    pub remaining_requests: u32,
    /// `None` when the endpoint reported no reset time.
    pub reset_at: Option<Instant>,
}

impl RateLimitState {
    /// When the next request must wait, the instant it may go.
    fn blocked_until(&self, now: Instant) -> Option<Instant> {
        match self.reset_at {
            Some(reset_at) if self.remaining_requests == 0 && now < reset_at => Some(reset_at),
            _ => None,
        }
    }
}

/// Result of a successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub status: u16,
    /// HTTP attempts spent, 429 retries included.
    pub attempts: u32,
}

/// Serialized, quota-aware sender for one destination endpoint.
///
/// Each call runs with the rate-limit state locked, so at most one request
/// per destination is in flight and sends complete in call order.
pub struct RateLimitedSender {
    url: RwLock<String>,
    state: Mutex<RateLimitState>,
    transport: Arc<dyn Transport>,
    ledger: Arc<RequestLedger>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl RateLimitedSender {
    pub fn new(
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
        ledger: Arc<RequestLedger>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            url: RwLock::new(url.into()),
            state: Mutex::new(RateLimitState::default()),
            transport,
            ledger,
            clock,
            policy,
        }
    }

    pub async fn url(&self) -> String {
        self.url.read().await.clone()
    }

    /// Point future sends at a new URL. Rate-limit state is kept.
    pub async fn set_url(&self, url: &str) {
        let mut guard = self.url.write().await;
        if guard.as_str() != url {
            *guard = url.to_string();
        }
    }

    pub async fn state(&self) -> RateLimitState {
        *self.state.lock().await
    }

    /// Deliver `payload`, waiting out any known quota and retrying 429s
    /// within the retry policy.
    pub async fn send(&self, payload: &WebhookPayload) -> Result<Delivery, DeliveryError> {
        let mut state = self.state.lock().await;
        let url = self.url().await;
        let mut attempts = 0u32;
        let mut waited = Duration::ZERO;

        loop {
            if let Some(until) = state.blocked_until(Instant::now()) {
                tracing::debug!(
                    url = %url,
                    wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "waiting for rate limit reset"
                );
                sleep_until(until).await;
            }

            attempts += 1;
            metric_inc("webhook.send.attempt");
            let response = match self.transport.post(&url, payload).await {
                Ok(response) => response,
                Err(err) => {
                    metric_inc("webhook.send.failed");
                    tracing::debug!(
                        url = %url,
                        attempt = attempts,
                        error = %err,
                        "webhook request failed"
                    );
                    return Err(err);
                }
            };
            self.ledger.record(self.clock.now()).await;

            if response.status == 429 {
                metric_inc("webhook.send.throttled");
                let retry_after = response
                    .parse_header::<f64>(RETRY_AFTER)
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                    .unwrap_or(self.policy.default_retry_after)
                    .min(self.policy.max_total_delay);
                let delay = retry_after
                    .saturating_add(self.policy.grace)
                    .saturating_add(jitter_delay(self.policy.jitter));

                state.remaining_requests = 0;
                state.reset_at = Instant::now().checked_add(delay);

                if attempts >= self.policy.max_attempts
                    || waited.saturating_add(delay) > self.policy.max_total_delay
                {
                    tracing::warn!(
                        url = %url,
                        attempts,
                        waited_ms = waited.as_millis() as u64,
                        "giving up on throttled webhook request"
                    );
                    return Err(DeliveryError::ThrottledExhausted { attempts, waited });
                }

                tracing::warn!(
                    url = %url,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "webhook throttled, backing off"
                );
                waited += delay;
                sleep(delay).await;
                continue;
            }

            state.remaining_requests = response.parse_header(RATE_LIMIT_REMAINING).unwrap_or(0);
            state.reset_at = response
                .parse_header::<f64>(RATE_LIMIT_RESET)
                .and_then(|epoch| self.reset_instant(epoch));

            if response.is_success() {
                return Ok(Delivery {
                    status: response.status,
                    attempts,
                });
            }

            metric_inc("webhook.send.failed");
            tracing::debug!(url = %url, status = response.status, "webhook rejected delivery");
            return Err(DeliveryError::Rejected {
                status: response.status,
            });
        }
    }

    /// Map an epoch-seconds reset header onto the tokio clock.
    /// Zero or garbage means the endpoint has no known limit. A reset further
    /// out than the throttle budget is cut down to the budget.
    fn reset_instant(&self, epoch_secs: f64) -> Option<Instant> {
        if !epoch_secs.is_finite() || epoch_secs <= 0.0 {
            return None;
        }
        let now_secs = self.clock.now().timestamp_millis() as f64 / 1000.0;
        let ahead = Duration::try_from_secs_f64((epoch_secs - now_secs).max(0.0))
            .unwrap_or(Duration::MAX)
            .min(self.policy.max_total_delay);
        Instant::now().checked_add(ahead)
    }
}

fn jitter_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=max_ms))
}
