//! S3-based remote store.
//!
//! This module provides remote state storage on AWS S3 (or compatible
//! services) for team deployments. Object `ETag`s serve as version markers and
//! writes use S3 conditional requests (`If-Match` / `If-None-Match`).

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info};

use crate::error::{BundleError, Result, StateError};

use super::remote::{RemoteObject, RemoteStore, VersionMarker};

/// S3-based remote store.
#[derive(Debug, Clone)]
pub struct S3RemoteStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

impl S3RemoteStore {
    /// Creates a new S3 remote store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        info!("Using S3 state backend: s3://{bucket}");
        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 remote store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        let prefix = prefix
            .map(|p| {
                let p = p.trim_matches('/');
                if p.is_empty() {
                    String::new()
                } else {
                    format!("{p}/")
                }
            })
            .unwrap_or_default();

        Self {
            client,
            bucket: bucket.to_string(),
            prefix,
        }
    }

    /// Gets the full S3 key for an object path.
    fn key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path.trim_start_matches('/'))
    }

    /// Maps a failed conditional request to a conflict, anything else to a backend error.
    fn map_write_error(path: &str, err: &SdkError<PutObjectError, HttpResponse>) -> BundleError {
        let status = err.raw_response().map(|r| r.status().as_u16());

        if status.is_some_and(is_precondition_status) {
            BundleError::State(StateError::Conflict {
                path: path.to_string(),
            })
        } else {
            BundleError::State(StateError::backend(format!("S3 write error on {path}: {err}")))
        }
    }
}

/// Returns true if an HTTP status denotes a failed or conflicting precondition.
const fn is_precondition_status(status: u16) -> bool {
    matches!(status, 409 | 412)
}

#[async_trait]
impl RemoteStore for S3RemoteStore {
    async fn get(&self, path: &str) -> Result<Option<RemoteObject>> {
        let key = self.key(path);
        debug!("Fetching s3://{}/{key}", self.bucket);

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let version = VersionMarker::new(response.e_tag().unwrap_or_default());
                let bytes = response.body.collect().await.map_err(|e| {
                    StateError::backend(format!("Failed to read S3 object: {e}"))
                })?;

                Ok(Some(RemoteObject {
                    bytes: bytes.to_vec(),
                    version,
                }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::backend(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    async fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        expected: Option<VersionMarker>,
    ) -> Result<VersionMarker> {
        let key = self.key(path);
        debug!("Writing s3://{}/{key}", self.bucket);

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .content_type("application/json");

        let request = match &expected {
            Some(marker) => request.if_match(marker.as_str()),
            None => request.if_none_match("*"),
        };

        let response = request
            .send()
            .await
            .map_err(|e| Self::map_write_error(path, &e))?;

        Ok(VersionMarker::new(response.e_tag().unwrap_or_default()))
    }

    async fn head_version(&self, path: &str) -> Result<Option<VersionMarker>> {
        let key = self.key(path);

        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;

        match result {
            Ok(response) => Ok(Some(VersionMarker::new(response.e_tag().unwrap_or_default()))),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(StateError::backend(format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }

    async fn delete(&self, path: &str, expected: Option<VersionMarker>) -> Result<()> {
        // DeleteObject has no portable conditional form; check the version first.
        if let Some(marker) = expected {
            match self.head_version(path).await? {
                None => return Ok(()),
                Some(current) if current != marker => {
                    return Err(StateError::Conflict {
                        path: path.to_string(),
                    }
                    .into());
                }
                Some(_) => {}
            }
        }

        let key = self.key(path);
        info!("Deleting s3://{}/{key}", self.bucket);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| StateError::backend(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_status() {
        assert!(is_precondition_status(412));
        assert!(is_precondition_status(409));
        assert!(!is_precondition_status(403));
        assert!(!is_precondition_status(500));
    }

    #[test]
    fn test_key_prefix() {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        let store = S3RemoteStore::with_client(Client::from_conf(config), "bucket", Some("/team/"));
        assert_eq!(store.key("/root/state/deployment.json"), "team/root/state/deployment.json");
    }
}
