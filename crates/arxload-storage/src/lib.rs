//! Local artifact storage, disk preflight and streamed HTTP fetch utilities.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub mod part_file;
pub mod progress;
pub mod space;

pub use part_file::{part_path_for, ArtifactSink, PartFile};
pub use progress::{fmt_bytes, fmt_eta, ProgressConfig, ProgressSnapshot, ProgressTracker, MIB};
pub use space::{has_enough_space, GIB};

pub const CRATE_NAME: &str = "arxload-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub connect_timeout: Duration,
    /// Upper bound on the wait for any single body chunk.
    pub read_timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no body chunk received within {0:?}")]
    ReadTimeout(Duration),
    #[error(transparent)]
    Sink(#[from] anyhow::Error),
}

/// Outcome of a completed streamed download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamedBody {
    pub content_length: Option<u64>,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    read_timeout: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        // No overall request timeout: a snapshot body can take hours. Stalls are
        // bounded per chunk instead.
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            read_timeout: config.read_timeout,
            backoff: config.backoff,
        })
    }

    /// Issue the GET with retry/backoff and return the successful response.
    pub async fn open(&self, run_id: Uuid, url: &str) -> Result<reqwest::Response, FetchError> {
        let span = info_span!("http_fetch", %run_id, url = %redact_query(url));
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return Ok(resp);
                        }

                        let final_url = redact_query(resp.url().as_str());
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(status = status.as_u16(), attempt, "retryable http status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(error = %err, attempt, "retryable request error");
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }

            match last_request_error {
                Some(err) => Err(FetchError::Request(err)),
                None => Err(FetchError::HttpStatus {
                    status: 0,
                    url: redact_query(url),
                }),
            }
        }
        .instrument(span)
        .await
    }

    /// Stream `url` into `sink` chunk by chunk. The caller owns commit/discard.
    pub async fn download_to(
        &self,
        run_id: Uuid,
        url: &str,
        sink: &mut ArtifactSink,
    ) -> Result<StreamedBody, FetchError> {
        let mut resp = self.open(run_id, url).await?;
        let content_length = resp.content_length().filter(|n| *n > 0);
        sink.set_total(content_length);

        loop {
            let chunk = tokio::time::timeout(self.read_timeout, resp.chunk())
                .await
                .map_err(|_| FetchError::ReadTimeout(self.read_timeout))??;
            match chunk {
                Some(bytes) if bytes.is_empty() => continue,
                Some(bytes) => sink.write(&bytes).await?,
                None => break,
            }
        }

        Ok(StreamedBody {
            content_length,
            bytes: sink.bytes_written(),
        })
    }
}

/// Strip the query string so signed credentials never reach the logs.
pub fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{base}?<redacted>"),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetcher_builds_with_compression_and_user_agent() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("arxload/0.1".into()),
            ..HttpClientConfig::default()
        });
        assert!(fetcher.is_ok());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[test]
    fn signed_url_queries_are_redacted() {
        assert_eq!(
            redact_query("https://bucket.s3.amazonaws.com/snap.json?X-Amz-Signature=abc"),
            "https://bucket.s3.amazonaws.com/snap.json?<redacted>"
        );
        assert_eq!(redact_query("https://example.org/a.json"), "https://example.org/a.json");
    }
}
