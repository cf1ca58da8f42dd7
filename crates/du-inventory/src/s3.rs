use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::AggregatedBytes;
use bytes::Bytes;

use crate::{BlobFetcher, FetchError, StaticCredentials};

const CREDENTIALS_PROVIDER_NAME: &str = "du-static";

/// How to build the S3 client.
///
/// Unset fields fall back to the standard AWS resolution (env/config/role).
#[derive(Debug, Clone, Default)]
pub struct S3ClientConfig {
    pub region: Option<String>,
    pub credentials: Option<StaticCredentials>,
    /// Override endpoint, e.g. MinIO or another S3-compatible store.
    pub endpoint_url: Option<String>,
    /// Defaults to `true` when `endpoint_url` is set.
    pub force_path_style: Option<bool>,
}

impl S3ClientConfig {
    /// Fills unset endpoint options from `DU_S3_ENDPOINT_URL` / `DU_S3_FORCE_PATH_STYLE`.
    pub fn with_env_overrides(mut self) -> Result<Self, FetchError> {
        if self.endpoint_url.is_none() {
            self.endpoint_url = std::env::var("DU_S3_ENDPOINT_URL").ok();
        }
        if self.force_path_style.is_none() {
            self.force_path_style = parse_env_bool("DU_S3_FORCE_PATH_STYLE")?;
        }
        Ok(self)
    }

    fn path_style(&self) -> bool {
        self.force_path_style.unwrap_or(self.endpoint_url.is_some())
    }
}

pub async fn build_client(cfg: &S3ClientConfig) -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &cfg.region {
        loader = loader.region(Region::new(region.clone()));
    }
    if let Some(creds) = &cfg.credentials {
        loader = loader.credentials_provider(Credentials::new(
            creds.access_key_id.clone(),
            creds.secret_access_key.clone(),
            None,
            None,
            CREDENTIALS_PROVIDER_NAME,
        ));
    }
    let shared = loader.load().await;

    let mut b = aws_sdk_s3::config::Builder::from(&shared);
    if let Some(url) = &cfg.endpoint_url {
        b = b.endpoint_url(url.clone());
    }
    if cfg.path_style() {
        b = b.force_path_style(true);
    }
    aws_sdk_s3::Client::from_conf(b.build())
}

#[derive(Debug, Clone)]
pub struct S3BlobFetcher {
    client: aws_sdk_s3::Client,
}

impl S3BlobFetcher {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    pub async fn from_config(cfg: &S3ClientConfig) -> Self {
        Self::new(build_client(cfg).await)
    }

    async fn get_with_retry(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<aws_sdk_s3::operation::get_object::GetObjectOutput, FetchError> {
        const MAX_ATTEMPTS: usize = 3;
        const BASE_DELAY_MS: u64 = 50;
        const MAX_DELAY_MS: u64 = 1000;

        let mut attempt: usize = 0;
        let mut delay_ms: u64 = BASE_DELAY_MS;
        loop {
            attempt = attempt.saturating_add(1);
            match self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
            {
                Ok(out) => return Ok(out),
                Err(err) => {
                    if is_transient(&err) && attempt < MAX_ATTEMPTS {
                        let jitter = du_observe::time::unix_time_ms() % 37;
                        tracing::debug!(
                            target: "du_proof",
                            event = "s3_get_retry",
                            bucket = bucket,
                            key = key,
                            attempt = attempt as u64,
                            "transient s3 failure, retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(delay_ms.saturating_add(jitter)))
                            .await;
                        delay_ms = delay_ms.saturating_mul(2).min(MAX_DELAY_MS);
                        continue;
                    }
                    return Err(map_get_err(err, bucket, key));
                }
            }
        }
    }
}

#[async_trait]
impl BlobFetcher for S3BlobFetcher {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Bytes, FetchError> {
        let out = self.get_with_retry(bucket, key).await?;
        let bytes: AggregatedBytes = out.body.collect().await.map_err(|e| {
            FetchError::Transport(format!("get_object body collect failed: {e:?}"))
        })?;
        Ok(bytes.into_bytes())
    }
}

fn is_transient<E>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::TimeoutError(_) => true,
        SdkError::DispatchFailure(_) => true,
        SdkError::ResponseError(_) => true,
        SdkError::ConstructionFailure(_) => false,
        SdkError::ServiceError(_) => err
            .raw_response()
            .map(|raw| {
                let status: u16 = raw.status().into();
                status == 429 || status >= 500
            })
            .unwrap_or(false),
        _ => false,
    }
}

fn map_get_err(err: SdkError<GetObjectError>, bucket: &str, key: &str) -> FetchError {
    match err {
        SdkError::ServiceError(ref se) => {
            let status: Option<u16> = err.raw_response().map(|raw| raw.status().into());
            if se.err().is_no_such_key() {
                FetchError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else if se.err().code() == Some("NoSuchBucket") {
                FetchError::NoSuchBucket(bucket.to_string())
            } else if se.err().code() == Some("AccessDenied") || status == Some(403) {
                FetchError::AccessDenied {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                FetchError::Transport(format!("s3 get_object service error: {err:?}"))
            }
        }
        other => FetchError::Transport(format!("s3 get_object failed: {other:?}")),
    }
}

fn parse_env_bool(key: &str) -> Result<Option<bool>, FetchError> {
    match std::env::var(key) {
        Ok(v) => parse_bool(&v).map(Some).ok_or_else(|| {
            FetchError::Transport(format!(
                "invalid boolean env var {key}={v:?} (expected true/false/1/0)"
            ))
        }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(FetchError::Transport(format!(
            "read env var {key} failed: {e}"
        ))),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
