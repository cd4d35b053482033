//! Schema-validated HTTP client with retries, timeouts, and exponential
//! backoff (C4, §4.4). Every api client (C7) is built on top of one of
//! these rather than talking to `reqwest` directly, the same way the
//! teacher's per-chain RPC clients are all built on a shared retrier.

use rand::Rng;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::errors::ProviderError;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        HttpClientConfig {
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            backoff_factor: 2,
        }
    }
}

/// Thin wrapper over `reqwest::Client` that applies the retry/backoff/
/// schema-validation policy uniformly. `base_url` anchors every `path`
/// passed to `get`/`post`.
pub struct HttpClient {
    client: reqwest::Client,
    base_url: Url,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(base_url: Url, config: HttpClientConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(HttpClient { client, base_url, config })
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<T, ProviderError> {
        let url = self.build_url(path, query)?;
        self.execute_with_retry(|| self.client.get(url.clone()), cancel).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<T, ProviderError> {
        let url = self.build_url(path, &[])?;
        let body = body.clone();
        self.execute_with_retry(|| self.client.post(url.clone()).json(&body), cancel).await
    }

    fn build_url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, ProviderError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| ProviderError::Network(format!("invalid path {path}: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn execute_with_retry<T: DeserializeOwned>(
        &self,
        build_request: impl Fn() -> reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<T, ProviderError> {
        let mut attempt = 0u32;
        let mut delay = self.config.initial_backoff;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let outcome = tokio::select! {
                r = build_request().send() => r,
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            };

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let bytes = response
                            .bytes()
                            .await
                            .map_err(|e| ProviderError::Network(e.to_string()))?;
                        return serde_json::from_slice::<T>(&bytes)
                            .map_err(|e| ProviderError::Schema(e.to_string()));
                    }
                    if status.as_u16() == 429 {
                        let retry_after = response
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs);
                        if attempt >= self.config.max_attempts {
                            return Err(ProviderError::RateLimited { retry_after });
                        }
                        let wait = retry_after.unwrap_or(delay);
                        warn!(attempt, ?wait, "rate limited, backing off");
                        self.sleep_or_cancel(wait, cancel).await?;
                        delay *= self.config.backoff_factor;
                        continue;
                    }
                    let retryable = status.is_server_error();
                    if retryable && attempt < self.config.max_attempts {
                        debug!(attempt, %status, "retryable http error, backing off");
                        self.sleep_with_jitter(delay, cancel).await?;
                        delay *= self.config.backoff_factor;
                        continue;
                    }
                    return Err(ProviderError::Http { status: status.as_u16() });
                }
                Err(e) if e.is_timeout() => {
                    if attempt < self.config.max_attempts {
                        self.sleep_with_jitter(delay, cancel).await?;
                        delay *= self.config.backoff_factor;
                        continue;
                    }
                    return Err(ProviderError::Timeout);
                }
                Err(e) => {
                    if attempt < self.config.max_attempts {
                        self.sleep_with_jitter(delay, cancel).await?;
                        delay *= self.config.backoff_factor;
                        continue;
                    }
                    return Err(ProviderError::Network(e.to_string()));
                }
            }
        }
    }

    async fn sleep_with_jitter(
        &self,
        base: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 4).max(1));
        self.sleep_or_cancel(base + Duration::from_millis(jitter_ms), cancel).await
    }

    async fn sleep_or_cancel(
        &self,
        d: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        tokio::select! {
            _ = tokio::time::sleep(d) => Ok(()),
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        }
    }
}
