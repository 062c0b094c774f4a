//! HTTP client for a remote manager.
//!
//! Implements the collaborator contracts over the manager REST API. Every
//! request is retried on transient failures; status codes are mapped to
//! the error taxonomy (404 not found, 409 conflict, 400 bad request, 429
//! and 5xx transient).

use async_trait::async_trait;
use reqwest::{header, Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace};

use super::api::{
    BlueprintsApi, DeploymentsApi, ExecutionsApi, MaintenanceApi, PluginsApi, SecretsApi,
    SnapshotsApi,
};
use super::types::{
    Blueprint, DEFAULT_TENANT, Deployment, Execution, MaintenanceMode, Plugin, SecretOptions,
    SecretView, Snapshot, StartExecution,
};
use crate::error::{ClientError, ManagerError, Result};
use crate::execution::ExecutionStatus;
use crate::topology::Topology;

/// API prefix.
const API_PREFIX: &str = "/api/v3.1";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for transient failures.
const MAX_RETRIES: u32 = 3;

/// Delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// List envelope.
#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    items: Vec<T>,
}

/// Error body returned by the manager.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SecretKey {
    key: String,
}

#[derive(Debug, Deserialize)]
struct MaintenanceStatus {
    status: MaintenanceMode,
}

/// Request payload, kept so a retry can resend it.
#[derive(Debug, Clone)]
enum Payload {
    Empty,
    Json(Value),
    Bytes(Vec<u8>),
}

/// Manager REST client.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    tenant: String,
    download_dir: PathBuf,
    retry_delay: Duration,
}

impl RestClient {
    /// Creates a client for the manager at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ClientError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            tenant: String::from(DEFAULT_TENANT),
            download_dir: std::env::temp_dir(),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Sets the tenant sent with every request.
    #[must_use]
    pub fn with_tenant(mut self, tenant: &str) -> Self {
        self.tenant = tenant.to_string();
        self
    }

    /// Sets where snapshot archives are downloaded.
    #[must_use]
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// Sets the base delay between retries.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sends a request, retrying transient failures.
    async fn send(
        &self,
        method: Method,
        path: &str,
        payload: Payload,
        resource: (&str, &str),
    ) -> Result<Response> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!("Retry attempt {attempt} of {MAX_RETRIES} for {method} {path}");
                tokio::time::sleep(self.retry_delay * attempt).await;
            }

            match self
                .send_once(method.clone(), path, payload.clone(), resource)
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ManagerError::Client(ClientError::NetworkError {
                message: String::from("Max retries exceeded"),
            })
        }))
    }

    /// Sends a single request.
    async fn send_once(
        &self,
        method: Method,
        path: &str,
        payload: Payload,
        (resource, id): (&str, &str),
    ) -> Result<Response> {
        let url = format!("{}{API_PREFIX}{path}", self.base_url);
        trace!("{method} {url}");

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Tenant", &self.tenant);
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        request = match payload {
            Payload::Empty => request,
            Payload::Json(body) => request.json(&body),
            Payload::Bytes(bytes) => request
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes),
        };

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::network(format!("{method} {url}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);
            return Err(ClientError::RateLimited {
                retry_after_secs: retry_after,
            }
            .into());
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or(body);

        Err(match status.as_u16() {
            404 => ClientError::not_found(resource, id),
            409 => ClientError::conflict(resource, id, message),
            400 => ClientError::BadRequest { message },
            code => ClientError::api_error(code, message),
        }
        .into())
    }

    async fn json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        payload: Payload,
        resource: (&str, &str),
    ) -> Result<T> {
        let response = self.send(method, path, payload, resource).await?;
        response.json().await.map_err(|e| {
            ClientError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            }
            .into()
        })
    }

    async fn list_items<T: DeserializeOwned>(
        &self,
        path: &str,
        resource: &str,
    ) -> Result<Vec<T>> {
        let page: ListResponse<T> = self
            .json(Method::GET, path, Payload::Empty, (resource, ""))
            .await?;
        Ok(page.items)
    }
}

#[async_trait]
impl BlueprintsApi for RestClient {
    async fn upload(&self, blueprint_id: &str, topology: Topology) -> Result<Blueprint> {
        let body = serde_json::to_value(&topology)
            .map_err(|e| ManagerError::internal(e.to_string()))?;
        self.json(
            Method::PUT,
            &format!("/blueprints/{blueprint_id}"),
            Payload::Json(body),
            ("blueprint", blueprint_id),
        )
        .await
    }

    async fn get(&self, blueprint_id: &str) -> Result<Blueprint> {
        self.json(
            Method::GET,
            &format!("/blueprints/{blueprint_id}"),
            Payload::Empty,
            ("blueprint", blueprint_id),
        )
        .await
    }

    async fn list(&self) -> Result<Vec<Blueprint>> {
        Self::list_items(self, "/blueprints", "blueprint").await
    }
}

#[async_trait]
impl DeploymentsApi for RestClient {
    async fn create(
        &self,
        deployment_id: &str,
        blueprint_id: &str,
        inputs: Value,
    ) -> Result<Deployment> {
        self.json(
            Method::PUT,
            &format!("/deployments/{deployment_id}"),
            Payload::Json(json!({"blueprint_id": blueprint_id, "inputs": inputs})),
            ("deployment", deployment_id),
        )
        .await
    }

    async fn delete(&self, deployment_id: &str) -> Result<()> {
        self.send(
            Method::DELETE,
            &format!("/deployments/{deployment_id}"),
            Payload::Empty,
            ("deployment", deployment_id),
        )
        .await
        .map(drop)
    }

    async fn get(&self, deployment_id: &str) -> Result<Deployment> {
        self.json(
            Method::GET,
            &format!("/deployments/{deployment_id}"),
            Payload::Empty,
            ("deployment", deployment_id),
        )
        .await
    }

    async fn list(&self) -> Result<Vec<Deployment>> {
        Self::list_items(self, "/deployments", "deployment").await
    }

    async fn set_topology(&self, deployment_id: &str, topology: Topology) -> Result<()> {
        self.send(
            Method::PATCH,
            &format!("/deployments/{deployment_id}"),
            Payload::Json(json!({"topology": topology})),
            ("deployment", deployment_id),
        )
        .await
        .map(drop)
    }
}

#[async_trait]
impl ExecutionsApi for RestClient {
    async fn start(&self, request: StartExecution) -> Result<Execution> {
        let id = request.deployment_id.clone().unwrap_or_default();
        self.json(
            Method::POST,
            "/executions",
            Payload::Json(json!({
                "deployment_id": request.deployment_id,
                "workflow_id": request.workflow_id,
                "parameters": request.parameters,
                "with_token": request.with_token,
                "bypass_maintenance": request.bypass_maintenance,
            })),
            ("deployment", &id),
        )
        .await
    }

    async fn get(&self, execution_id: &str) -> Result<Execution> {
        self.json(
            Method::GET,
            &format!("/executions/{execution_id}"),
            Payload::Empty,
            ("execution", execution_id),
        )
        .await
    }

    async fn list(&self, deployment_id: &str) -> Result<Vec<Execution>> {
        Self::list_items(
            self,
            &format!("/executions?deployment_id={deployment_id}"),
            "execution",
        )
        .await
    }

    async fn set_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: String,
    ) -> Result<Execution> {
        self.json(
            Method::PATCH,
            &format!("/executions/{execution_id}"),
            Payload::Json(json!({"status": status, "error": error})),
            ("execution", execution_id),
        )
        .await
    }
}

#[async_trait]
impl SecretsApi for RestClient {
    async fn create(&self, key: &str, value: &str, options: SecretOptions) -> Result<SecretView> {
        self.json(
            Method::PUT,
            &format!("/secrets/{key}"),
            Payload::Json(json!({
                "value": value,
                "update_if_exists": options.update_if_exists,
                "is_hidden_value": options.is_hidden_value,
                "visibility": options.visibility,
            })),
            ("secret", key),
        )
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.send(
            Method::DELETE,
            &format!("/secrets/{key}"),
            Payload::Empty,
            ("secret", key),
        )
        .await
        .map(drop)
    }

    async fn get(&self, key: &str) -> Result<SecretView> {
        self.json(
            Method::GET,
            &format!("/secrets/{key}"),
            Payload::Empty,
            ("secret", key),
        )
        .await
    }

    async fn list(&self) -> Result<Vec<String>> {
        let keys: Vec<SecretKey> = Self::list_items(self, "/secrets", "secret").await?;
        Ok(keys.into_iter().map(|k| k.key).collect())
    }
}

#[async_trait]
impl PluginsApi for RestClient {
    async fn upload(&self, archive: &Path) -> Result<Plugin> {
        let bytes = tokio::fs::read(archive).await?;
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.json(Method::POST, "/plugins", Payload::Bytes(bytes), ("plugin", &name))
            .await
    }

    async fn delete(&self, plugin_id: &str) -> Result<()> {
        self.send(
            Method::DELETE,
            &format!("/plugins/{plugin_id}"),
            Payload::Empty,
            ("plugin", plugin_id),
        )
        .await
        .map(drop)
    }

    async fn list(&self) -> Result<Vec<Plugin>> {
        Self::list_items(self, "/plugins", "plugin").await
    }
}

#[async_trait]
impl MaintenanceApi for RestClient {
    async fn activate(&self) -> Result<()> {
        self.send(
            Method::POST,
            "/maintenance-mode/activate",
            Payload::Empty,
            ("maintenance mode", ""),
        )
        .await
        .map(drop)
    }

    async fn deactivate(&self) -> Result<()> {
        self.send(
            Method::POST,
            "/maintenance-mode/deactivate",
            Payload::Empty,
            ("maintenance mode", ""),
        )
        .await
        .map(drop)
    }

    async fn status(&self) -> Result<MaintenanceMode> {
        let status: MaintenanceStatus = self
            .json(
                Method::GET,
                "/maintenance-mode",
                Payload::Empty,
                ("maintenance mode", ""),
            )
            .await?;
        Ok(status.status)
    }
}

#[async_trait]
impl SnapshotsApi for RestClient {
    async fn get(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.json(
            Method::GET,
            &format!("/snapshots/{snapshot_id}"),
            Payload::Empty,
            ("snapshot", snapshot_id),
        )
        .await
    }

    async fn list(&self) -> Result<Vec<Snapshot>> {
        Self::list_items(self, "/snapshots", "snapshot").await
    }

    async fn create(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.json(
            Method::PUT,
            &format!("/snapshots/{snapshot_id}"),
            Payload::Empty,
            ("snapshot", snapshot_id),
        )
        .await
    }

    async fn upload(&self, snapshot_id: &str, archive: &Path) -> Result<Snapshot> {
        let bytes = tokio::fs::read(archive).await?;
        self.json(
            Method::PUT,
            &format!("/snapshots/{snapshot_id}/archive"),
            Payload::Bytes(bytes),
            ("snapshot", snapshot_id),
        )
        .await
    }

    async fn archive_path(&self, snapshot_id: &str) -> Result<PathBuf> {
        let response = self
            .send(
                Method::GET,
                &format!("/snapshots/{snapshot_id}/archive"),
                Payload::Empty,
                ("snapshot", snapshot_id),
            )
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::network(format!("snapshot download: {e}")))?;

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let path = self.download_dir.join(format!("{snapshot_id}.tar"));
        tokio::fs::write(&path, &bytes).await?;
        debug!("Snapshot {snapshot_id} downloaded to {}", path.display());
        Ok(path)
    }
}
