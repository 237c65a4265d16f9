//! S3-compatible backend.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{Credentials, StalledStreamProtectionConfig};
use aws_sdk_s3::presigning::PresigningConfig;
use chirps_cog_config::{ContainerNames, StorageConfig, optional_env, require_env};

use crate::{BlobStore, Container, StoreError};

/// Maximum number of download attempts (initial + retries).
const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

/// Base delay between download retries (doubles each attempt).
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Store backed by an S3-compatible object storage service.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    containers: ContainerNames,
}

impl S3Store {
    /// Creates a client from environment variables.
    ///
    /// Reads `S3_ACCESS_KEY_ID` and `S3_SECRET_ACCESS_KEY`, plus the
    /// optional `S3_ENDPOINT_URL` for non-AWS services.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`] if a required variable is unset.
    pub fn from_env(config: &StorageConfig) -> Result<Self, StoreError> {
        let access_key = require_env("S3_ACCESS_KEY_ID")?;
        let secret_key = require_env("S3_SECRET_ACCESS_KEY")?;
        let creds = Credentials::new(&access_key, &secret_key, None, None, "chirps-cog-env");

        let mut builder = aws_sdk_s3::Config::builder()
            .region(Region::new(config.region.clone()))
            .credentials_provider(creds)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled());

        if let Some(endpoint) = optional_env("S3_ENDPOINT_URL") {
            log::info!("Using S3 endpoint {endpoint}");
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            containers: config.containers.clone(),
        })
    }

    fn bucket(&self, container: Container) -> &str {
        container.resolve(&self.containers)
    }

    /// Single download attempt.
    async fn get_once(&self, container: Container, key: &str) -> Result<Vec<u8>, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(self.bucket(container))
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .is_some_and(aws_sdk_s3::operation::get_object::GetObjectError::is_no_such_key)
                {
                    StoreError::NotFound {
                        container,
                        key: key.to_string(),
                    }
                } else {
                    StoreError::Download {
                        container,
                        key: key.to_string(),
                        source: Box::new(e),
                    }
                }
            })?;

        let bytes = output.body.collect().await.map_err(|e| StoreError::Download {
            container,
            key: key.to_string(),
            source: Box::new(e),
        })?;

        Ok(bytes.into_bytes().to_vec())
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn put(
        &self,
        container: Container,
        key: &str,
        data: Vec<u8>,
    ) -> Result<(), StoreError> {
        let body = aws_sdk_s3::primitives::ByteStream::from(data);

        self.client
            .put_object()
            .bucket(self.bucket(container))
            .key(key)
            .body(body)
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| StoreError::Upload {
                container,
                key: key.to_string(),
                source: Box::new(e),
            })?;

        log::info!("  uploaded {container}/{key}");
        Ok(())
    }

    /// Retries up to [`MAX_DOWNLOAD_ATTEMPTS`] times on transient errors.
    async fn get(&self, container: Container, key: &str) -> Result<Vec<u8>, StoreError> {
        let mut last_err: Option<StoreError> = None;

        for attempt in 1..=MAX_DOWNLOAD_ATTEMPTS {
            match self.get_once(container, key).await {
                Ok(bytes) => return Ok(bytes),
                Err(e @ StoreError::Download { .. }) if attempt < MAX_DOWNLOAD_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                    log::warn!(
                        "  download attempt {attempt}/{MAX_DOWNLOAD_ATTEMPTS} of {container}/{key} \
                         failed, retrying in {delay:.1?}..."
                    );
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| StoreError::Download {
            container,
            key: key.to_string(),
            source: "all download attempts exhausted".into(),
        }))
    }

    async fn list_keys(
        &self,
        container: Container,
        prefix: &str,
    ) -> Result<Vec<String>, StoreError> {
        log::info!("Listing {container}/{prefix}*");

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(self.bucket(container))
                .prefix(prefix);

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(|e| StoreError::List {
                container,
                prefix: prefix.to_string(),
                source: Box::new(e),
            })?;

            for obj in output.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        keys.sort();
        log::info!("  found {} objects", keys.len());
        Ok(keys)
    }

    async fn presign_get(
        &self,
        container: Container,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        let presign_err = |e: Box<dyn std::error::Error + Send + Sync>| StoreError::Presign {
            container,
            key: key.to_string(),
            source: e,
        };

        let presigning = PresigningConfig::expires_in(ttl).map_err(|e| presign_err(Box::new(e)))?;
        let request = self
            .client
            .get_object()
            .bucket(self.bucket(container))
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| presign_err(Box::new(e)))?;

        Ok(request.uri().to_string())
    }
}

/// Content type for an object key, by extension.
fn content_type_for(key: &str) -> &'static str {
    let ext = key.rsplit('.').next().unwrap_or_default();
    match ext {
        "json" => "application/json",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_follow_extension() {
        assert_eq!(content_type_for("task_001.json"), "application/json");
        assert_eq!(content_type_for("1995/nigeria-cog-a.tif"), "image/tiff");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }
}
