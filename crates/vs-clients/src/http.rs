//! Shared HTTP plumbing: one pooled `reqwest` client for the whole
//! process, per-host minimum-interval throttling, and a retry loop with
//! jittered exponential backoff that honors server-provided `Retry-After`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use vs_core::config::HttpConfig;
use vs_core::error::{ErrorClass, SyncError};

/// Backoff never exceeds this, regardless of attempt count.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Extra jitter added on top of a server-provided `Retry-After`.
const RETRY_AFTER_JITTER_MAX: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// HttpCore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HttpCore {
    client: reqwest::Client,
    cfg: HttpConfig,
    /// Per-host throttle gates; the mutex serialises the interval check so
    /// concurrent callers to the same host queue up behind each other.
    gates: Arc<DashMap<String, Arc<Mutex<Instant>>>>,
}

/// A response the retry loop has already vetted: status is non-error or the
/// caller asked to see it.
pub struct RawResponse {
    pub status: StatusCode,
    pub body: String,
}

impl HttpCore {
    pub fn new(cfg: HttpConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(cfg.max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| {
                SyncError::permanent("http", "build_client", e.to_string()).with_source(e)
            })?;
        Ok(Self {
            client,
            cfg,
            gates: Arc::new(DashMap::new()),
        })
    }

    /// Issue a JSON request and decode the response body.
    ///
    /// Transient failures are retried up to `max_retry_attempts` with
    /// strictly non-decreasing jittered backoff; everything else surfaces
    /// after exactly one attempt.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        component: &'static str,
        operation: &str,
        method: Method,
        url: &str,
        bearer: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<T, SyncError> {
        let raw = self
            .request_raw(component, operation, method, url, bearer, body, false)
            .await?;
        serde_json::from_str(&raw.body).map_err(|e| {
            SyncError::permanent(
                component,
                operation,
                format!("response schema mismatch: {e}"),
            )
            .with_source(e)
        })
    }

    /// Like [`request_json`] but a 404 yields `Ok(None)` instead of an
    /// error; used for existence rechecks.
    pub async fn request_json_opt<T: DeserializeOwned>(
        &self,
        component: &'static str,
        operation: &str,
        method: Method,
        url: &str,
        bearer: Option<&str>,
        body: Option<&serde_json::Value>,
    ) -> Result<Option<T>, SyncError> {
        let raw = self
            .request_raw(component, operation, method, url, bearer, body, true)
            .await?;
        if raw.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        serde_json::from_str(&raw.body)
            .map(Some)
            .map_err(|e| {
                SyncError::permanent(
                    component,
                    operation,
                    format!("response schema mismatch: {e}"),
                )
                .with_source(e)
            })
    }

    /// The retry loop proper. When `pass_404` is set a 404 response is
    /// returned to the caller rather than converted into an error.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_raw(
        &self,
        component: &'static str,
        operation: &str,
        method: Method,
        url: &str,
        bearer: Option<&str>,
        body: Option<&serde_json::Value>,
        pass_404: bool,
    ) -> Result<RawResponse, SyncError> {
        let host = host_of(url);
        let max_attempts = self.cfg.max_retry_attempts.max(1);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.throttle(&host).await;

            let mut req = self.client.request(method.clone(), url);
            if let Some(token) = bearer {
                req = req.bearer_auth(token);
            }
            if let Some(json) = body {
                req = req.json(json);
            }

            let outcome = match req.send().await {
                Err(e) => Err((classify_reqwest(&e), e.to_string(), None)),
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after(&resp);
                    let text = resp.text().await.unwrap_or_default();
                    match SyncError::class_for_status(status.as_u16()) {
                        None => Ok(RawResponse { status, body: text }),
                        Some(ErrorClass::NotFound) if pass_404 => {
                            Ok(RawResponse { status, body: text })
                        }
                        Some(class) => Err((
                            class,
                            format!("HTTP {}: {}", status.as_u16(), truncate(&text, 300)),
                            retry_after,
                        )),
                    }
                }
            };

            match outcome {
                Ok(resp) => return Ok(resp),
                Err((class, message, retry_after)) => {
                    if class == ErrorClass::Transient && attempt < max_attempts {
                        let delay = match retry_after {
                            Some(advertised) => advertised + jitter_upto(RETRY_AFTER_JITTER_MAX),
                            None => self.backoff_delay(attempt),
                        };
                        debug!(
                            component,
                            operation,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "transient failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    if class == ErrorClass::Transient {
                        warn!(component, operation, attempt, "retries exhausted");
                    }
                    return Err(SyncError::new(class, component, operation, message)
                        .with_attempt(attempt));
                }
            }
        }
    }

    /// Exponential backoff for the given 1-indexed attempt, with up to 50%
    /// additive jitter. Monotonic in `attempt` before jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.cfg.base_backoff_ms.max(1));
        let exp = base.saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1).min(16)));
        let capped = exp.min(MAX_BACKOFF);
        capped + jitter_upto(capped / 2)
    }

    /// Enforce the per-host minimum inter-request interval.
    async fn throttle(&self, host: &str) {
        let min_interval = Duration::from_millis(self.cfg.min_request_interval_ms);
        if min_interval.is_zero() {
            return;
        }
        let gate = self
            .gates
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Instant::now() - min_interval)))
            .clone();
        let mut last = gate.lock().await;
        let elapsed = last.elapsed();
        if elapsed < min_interval {
            tokio::time::sleep(min_interval - elapsed).await;
        }
        *last = Instant::now();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| format!("{}:{}", h, u.port_or_known_default().unwrap_or(0))))
        .unwrap_or_else(|| url.to_string())
}

fn classify_reqwest(e: &reqwest::Error) -> ErrorClass {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ErrorClass::Transient
    } else if e.is_decode() {
        ErrorClass::Permanent
    } else {
        ErrorClass::Transient
    }
}

fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn jitter_upto(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = max.as_millis() as u64;
    Duration::from_millis(rand::random_range(0..=millis))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
