//! Generic REST provisioner for the workspace API.
//!
//! Every resource type shares one request shape:
//! `POST {host}/api/2.0/bundle/{type}/{create|update|delete}`.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{BundleError, ProvisionError, Result};
use crate::state::ResourceKey;

use super::{DeleteOutcome, ResourceProvisioner};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// REST provisioner.
#[derive(Debug, Clone)]
pub struct RestProvisioner {
    /// HTTP client.
    client: Client,
    /// API base URL.
    host: String,
    /// API token.
    token: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    config: &'a Value,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    id: &'a str,
    name: &'a str,
    config: &'a Value,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: Value,
}

impl RestProvisioner {
    /// Creates a new REST provisioner.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(host: &str, token: &str) -> Result<Self> {
        Self::with_timeout(host, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a provisioner with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(host: &str, token: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProvisionError::permanent(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn endpoint(&self, resource_type: &str, operation: &str) -> String {
        format!("{}/api/2.0/bundle/{resource_type}/{operation}", self.host)
    }

    /// Sends one request and classifies failures by status.
    async fn post<B: Serialize + Sync>(
        &self,
        key: &ResourceKey,
        operation: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let url = self.endpoint(&key.resource_type, operation);
        trace!("POST {url} for {key}");

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .json(body)
            .send()
            .await
            .map_err(|e| ProvisionError::transient(format!("Request to {url} failed: {e}")))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &format!("{operation} {key}: HTTP {status}: {body}")))
    }
}

/// Maps a failed HTTP status to a provisioning error.
fn classify(status: StatusCode, message: &str) -> BundleError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProvisionError::transient(message).into()
    } else {
        ProvisionError::permanent(message).into()
    }
}

#[async_trait]
impl ResourceProvisioner for RestProvisioner {
    async fn create(&self, key: &ResourceKey, config: &Value) -> Result<String> {
        let response = self
            .post(key, "create", &CreateRequest { name: &key.name, config })
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProvisionError::permanent(format!(
                "create {key}: resource type not supported by the workspace"
            ))
            .into());
        }

        let created: CreateResponse = response.json().await.map_err(|e| {
            ProvisionError::InvalidResponse {
                message: format!("Failed to parse create response for {key}: {e}"),
            }
        })?;

        // Some APIs return numeric ids
        let id = match created.id {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            other => {
                return Err(ProvisionError::InvalidResponse {
                    message: format!("Unexpected id for {key}: {other}"),
                }
                .into());
            }
        };

        debug!("Created {key} with id {id}");
        Ok(id)
    }

    async fn update(&self, key: &ResourceKey, remote_id: &str, config: &Value) -> Result<()> {
        let response = self
            .post(
                key,
                "update",
                &UpdateRequest {
                    id: remote_id,
                    name: &key.name,
                    config,
                },
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ProvisionError::permanent(format!(
                "update {key}: remote resource {remote_id} no longer exists"
            ))
            .into());
        }

        debug!("Updated {key} ({remote_id})");
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey, remote_id: &str) -> Result<DeleteOutcome> {
        let response = self
            .post(key, "delete", &DeleteRequest { id: remote_id })
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("{key} ({remote_id}) was already deleted");
            Ok(DeleteOutcome::AlreadyAbsent)
        } else {
            debug!("Deleted {key} ({remote_id})");
            Ok(DeleteOutcome::Deleted)
        }
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}
