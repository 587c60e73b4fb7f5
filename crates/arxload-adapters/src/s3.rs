use std::time::Duration;

use arxload_storage::ArtifactSink;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::config::ProvideCredentials;
use aws_sdk_s3::error::DisplayErrorContext;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::{AcquireContext, AcquireError, AcquisitionStrategy, Readiness};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Source {
    pub bucket: Option<String>,
    pub key: String,
    pub region: Option<String>,
    pub read_timeout: Duration,
}

/// Bucket fetch through the AWS SDK.
#[derive(Debug, Clone)]
pub struct S3Strategy {
    source: S3Source,
    sdk_config: OnceCell<SdkConfig>,
}

impl S3Strategy {
    pub fn new(source: S3Source) -> Self {
        Self {
            source,
            sdk_config: OnceCell::new(),
        }
    }

    /// Use a prepared SDK config instead of the default provider chain.
    pub fn with_sdk_config(source: S3Source, sdk_config: SdkConfig) -> Self {
        Self {
            source,
            sdk_config: OnceCell::new_with(Some(sdk_config)),
        }
    }

    async fn sdk_config(&self) -> &SdkConfig {
        self.sdk_config
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(BehaviorVersion::latest());
                if let Some(region) = &self.source.region {
                    loader = loader.region(aws_config::Region::new(region.clone()));
                }
                loader.load().await
            })
            .await
    }

    async fn client(&self) -> aws_sdk_s3::Client {
        aws_sdk_s3::Client::new(self.sdk_config().await)
    }

    /// Resolve credentials the same way the client will: env, profile,
    /// web identity, container and instance metadata.
    async fn credentials_readiness(&self) -> Readiness {
        let Some(provider) = self.sdk_config().await.credentials_provider() else {
            return Readiness::Skip("no AWS credentials provider".into());
        };
        match provider.provide_credentials().await {
            Ok(_) => Readiness::Ready,
            Err(err) => {
                debug!(error = %DisplayErrorContext(&err), "AWS credential resolution failed");
                Readiness::Skip(format!("no AWS credentials: {err}"))
            }
        }
    }
}

#[async_trait]
impl AcquisitionStrategy for S3Strategy {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn readiness(&self) -> Readiness {
        match &self.source.bucket {
            None => Readiness::Skip("S3_BUCKET not set".into()),
            Some(bucket) if bucket.trim().is_empty() => Readiness::Skip("S3_BUCKET not set".into()),
            Some(_) if self.source.key.trim().is_empty() => Readiness::Skip("S3_KEY not set".into()),
            Some(_) => self.credentials_readiness().await,
        }
    }

    async fn attempt(
        &self,
        _ctx: &AcquireContext,
        sink: &mut ArtifactSink,
    ) -> Result<u64, AcquireError> {
        let bucket = self
            .source
            .bucket
            .clone()
            .ok_or_else(|| AcquireError::Misconfigured("bucket not configured".into()))?;
        info!(bucket = %bucket, key = %self.source.key, "object storage download");

        let client = self.client().await;
        let mut output = client
            .get_object()
            .bucket(&bucket)
            .key(&self.source.key)
            .send()
            .await
            .map_err(|err| AcquireError::ObjectStorage(DisplayErrorContext(&err).to_string()))?;

        let total = output
            .content_length()
            .and_then(|n| u64::try_from(n).ok())
            .filter(|n| *n > 0);
        sink.set_total(total);

        loop {
            let next = tokio::time::timeout(self.source.read_timeout, output.body.next())
                .await
                .map_err(|_| AcquireError::Stalled(self.source.read_timeout))?;
            match next {
                Some(Ok(bytes)) => sink.write(&bytes).await?,
                Some(Err(err)) => {
                    return Err(AcquireError::ObjectStorage(
                        DisplayErrorContext(&err).to_string(),
                    ))
                }
                None => break,
            }
        }

        if let Some(expected) = total {
            if sink.bytes_written() != expected {
                return Err(AcquireError::ShortRead {
                    got: sink.bytes_written(),
                    expected,
                });
            }
        }
        Ok(sink.bytes_written())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{Credentials, SharedCredentialsProvider};

    fn source() -> S3Source {
        S3Source {
            bucket: Some("inha-capstone-02-arxiv".into()),
            key: "arxiv-metadata-oai-snapshot.json".into(),
            region: None,
            read_timeout: Duration::from_secs(60),
        }
    }

    fn static_credentials() -> SdkConfig {
        SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(SharedCredentialsProvider::new(Credentials::new(
                "AKIDEXAMPLE",
                "secret",
                None,
                None,
                "static",
            )))
            .build()
    }

    #[tokio::test]
    async fn config_without_a_credentials_provider_is_skipped() {
        let bare = SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .build();
        let strategy = S3Strategy::with_sdk_config(source(), bare);
        assert_eq!(
            strategy.readiness().await,
            Readiness::Skip("no AWS credentials provider".into())
        );
    }

    #[tokio::test]
    async fn missing_bucket_skips_the_strategy() {
        let strategy = S3Strategy::with_sdk_config(
            S3Source {
                bucket: Some("  ".into()),
                ..source()
            },
            static_credentials(),
        );
        assert!(matches!(strategy.readiness().await, Readiness::Skip(_)));
    }

    #[tokio::test]
    async fn credentials_from_the_provider_chain_make_the_source_ready() {
        let strategy = S3Strategy::with_sdk_config(source(), static_credentials());
        assert_eq!(strategy.readiness().await, Readiness::Ready);
    }
}
