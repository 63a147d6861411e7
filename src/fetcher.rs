use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use rand::Rng as _;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, USER_AGENT};
use url::Url;

use crate::config::FetchPolicy;

/// Every way a remote request can end without data. The fetcher never
/// surfaces anything else.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchFailure {
    #[error("rate limited (429) after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("access forbidden (403)")]
    Forbidden,
    #[error("not found (404)")]
    NotFound,
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchFailure {
    /// The sub-source itself is unreachable, as opposed to one page failing.
    pub fn is_access_error(&self) -> bool {
        matches!(self, Self::Forbidden | Self::NotFound)
    }
}

/// Issues one JSON GET at a time, with a randomized delay before every
/// request and status-specific backoff between retries.
#[derive(Debug)]
pub struct Fetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
    user_agent: String,
    requests_issued: AtomicU64,
}

impl Fetcher {
    pub fn new(policy: FetchPolicy, user_agent: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build remote http client")?;
        Ok(Self {
            client,
            policy,
            user_agent: user_agent.into(),
            requests_issued: AtomicU64::new(0),
        })
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Total HTTP requests sent, retries included.
    pub fn requests_issued(&self) -> u64 {
        self.requests_issued.load(Ordering::Relaxed)
    }

    pub async fn fetch_json(&self, url: &Url) -> Result<serde_json::Value, FetchFailure> {
        self.fetch_decoded(url, Ok).await
    }

    /// Fetches `url` and hands the payload to `decode`. A `Decode` failure
    /// from `decode` is retried like a malformed body.
    pub async fn fetch_decoded<T>(
        &self,
        url: &Url,
        decode: impl Fn(serde_json::Value) -> Result<T, FetchFailure> + Send + Sync,
    ) -> Result<T, FetchFailure> {
        let mut max_attempts = self.policy.max_retries.max(1);
        let mut forbidden_seen = false;
        let mut last_failure = FetchFailure::Transport("no attempt made".to_owned());
        let mut attempt = 0_u32;

        while attempt < max_attempts {
            attempt += 1;
            self.politeness_delay().await;

            let failure = match self.attempt(url).await.and_then(&decode) {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            match failure {
                FetchFailure::RateLimited { .. } => {
                    let wait = self.policy.rate_limit_backoff * attempt;
                    tracing::warn!(%url, attempt, wait_ms = wait.as_millis() as u64, "rate limited; backing off");
                    sleep(wait).await;
                    last_failure = FetchFailure::RateLimited { attempts: attempt };
                }
                FetchFailure::Forbidden => {
                    if forbidden_seen {
                        return Err(FetchFailure::Forbidden);
                    }
                    forbidden_seen = true;
                    // One retry after a 403, even when the retry budget is spent.
                    max_attempts = max_attempts.max(attempt + 1);
                    tracing::warn!(%url, attempt, "access forbidden; retrying once");
                    sleep(self.policy.forbidden_backoff).await;
                    last_failure = FetchFailure::Forbidden;
                }
                FetchFailure::NotFound | FetchFailure::InvalidRequest(_) => return Err(failure),
                FetchFailure::Status(code) if !(500..600).contains(&code) => return Err(failure),
                other => {
                    tracing::debug!(%url, attempt, error = %other, "request failed");
                    if attempt < max_attempts {
                        sleep(self.policy.retry_delay).await;
                    }
                    last_failure = other;
                }
            }
        }

        tracing::warn!(%url, error = %last_failure, "giving up after retries");
        Err(last_failure)
    }

    async fn attempt(&self, url: &Url) -> Result<serde_json::Value, FetchFailure> {
        self.requests_issued.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .get(url.clone())
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| FetchFailure::Transport(err.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::TOO_MANY_REQUESTS => return Err(FetchFailure::RateLimited { attempts: 0 }),
            StatusCode::FORBIDDEN => return Err(FetchFailure::Forbidden),
            StatusCode::NOT_FOUND => return Err(FetchFailure::NotFound),
            status => return Err(FetchFailure::Status(status.as_u16())),
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| FetchFailure::Transport(err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| FetchFailure::Decode(err.to_string()))
    }

    async fn politeness_delay(&self) {
        let min = self.policy.min_delay.as_millis() as u64;
        let max = self.policy.max_delay.as_millis() as u64;
        let millis = if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        sleep(Duration::from_millis(millis)).await;
    }
}

async fn sleep(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}
