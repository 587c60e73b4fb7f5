use arxload_storage::{redact_query, ArtifactSink, HttpFetcher};
use async_trait::async_trait;
use tracing::info;

use crate::{AcquireContext, AcquireError, AcquisitionStrategy, Readiness};

/// Plain HTTP GET of a pre-signed URL.
#[derive(Debug, Clone)]
pub struct SignedUrlStrategy {
    url: Option<String>,
    http: HttpFetcher,
}

impl SignedUrlStrategy {
    pub fn new(url: Option<String>, http: HttpFetcher) -> Self {
        Self { url, http }
    }
}

#[async_trait]
impl AcquisitionStrategy for SignedUrlStrategy {
    fn name(&self) -> &'static str {
        "signed-url"
    }

    async fn readiness(&self) -> Readiness {
        match self.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Readiness::Ready,
            _ => Readiness::Skip("ARXIV_URL not set".into()),
        }
    }

    async fn attempt(
        &self,
        ctx: &AcquireContext,
        sink: &mut ArtifactSink,
    ) -> Result<u64, AcquireError> {
        let url = self.url.as_deref().map(str::trim).unwrap_or_default();
        info!(url = %redact_query(url), "url download");
        let body = self.http.download_to(ctx.run_id, url, sink).await?;
        if let Some(expected) = body.content_length {
            if body.bytes < expected {
                return Err(AcquireError::ShortRead {
                    got: body.bytes,
                    expected,
                });
            }
        }
        Ok(body.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arxload_storage::HttpClientConfig;

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).expect("client")
    }

    #[tokio::test]
    async fn missing_url_is_a_skip() {
        assert_eq!(
            SignedUrlStrategy::new(None, http()).readiness().await,
            Readiness::Skip("ARXIV_URL not set".into())
        );
        assert!(matches!(
            SignedUrlStrategy::new(Some("   ".into()), http()).readiness().await,
            Readiness::Skip(_)
        ));
    }

    #[tokio::test]
    async fn configured_url_is_ready() {
        let strategy = SignedUrlStrategy::new(Some("https://example.org/snap.json?sig=1".into()), http());
        assert_eq!(strategy.readiness().await, Readiness::Ready);
    }
}
