//! HTTP client for the compute API.
//!
//! Every request carries a bearer token for [`AUTH_SCOPES`]. Tokens come from
//! a [`TokenSource`]: a fixed token (tests, local development) or the
//! instance metadata server, whose tokens are cached until shortly before
//! they expire.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::provider::{ComputeProvider, ProviderResult};
use crate::types::{
    InstanceGroupManager, InstanceTemplate, ManagedInstance, NewInstanceGroupManager, Operation,
};

/// OAuth scopes requested for every provider call.
pub const AUTH_SCOPES: &[&str] = &["https://www.googleapis.com/auth/cloud-platform"];

/// Default compute API endpoint.
pub const DEFAULT_COMPUTE_URL: &str = "https://www.googleapis.com/compute/v1";

/// Default metadata-server token endpoint for the instance service account.
pub const DEFAULT_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh cached tokens this long before they expire.
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// Where access tokens come from.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// Send requests unauthenticated.
    None,

    /// Use a fixed bearer token.
    Static(String),

    /// Mint tokens from the metadata server at the given URL.
    Metadata { url: String },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManagedInstancesPage {
    #[serde(default)]
    managed_instances: Vec<ManagedInstance>,

    #[serde(default)]
    next_page_token: Option<String>,
}

/// Compute API client.
pub struct GceClient {
    client: reqwest::Client,
    base_url: String,
    tokens: TokenSource,
    cached: Mutex<Option<CachedToken>>,
}

impl GceClient {
    /// Create a new client against the given API base URL.
    pub fn new(
        base_url: impl Into<String>,
        tokens: TokenSource,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            cached: Mutex::new(None),
        })
    }

    fn templates_url(&self, project: &str) -> String {
        format!("{}/projects/{}/global/instanceTemplates", self.base_url, project)
    }

    fn managers_url(&self, project: &str, zone: &str) -> String {
        format!(
            "{}/projects/{}/zones/{}/instanceGroupManagers",
            self.base_url, project, zone
        )
    }

    async fn bearer_token(&self) -> ProviderResult<Option<String>> {
        match &self.tokens {
            TokenSource::None => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::Metadata { url } => {
                let mut cached = self.cached.lock().await;
                if let Some(token) = cached.as_ref() {
                    if token.expires_at > Instant::now() + TOKEN_EXPIRY_SLACK {
                        return Ok(Some(token.access_token.clone()));
                    }
                }

                debug!(url = %url, "Fetching access token from metadata server");
                let response = self
                    .client
                    .get(url)
                    .query(&[("scopes", AUTH_SCOPES.join(","))])
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .map_err(|e| ProviderError::Auth(e.to_string()))?;

                if !response.status().is_success() {
                    return Err(ProviderError::Auth(format!(
                        "metadata server returned {}",
                        response.status()
                    )));
                }

                let token: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::Auth(e.to_string()))?;
                let access_token = token.access_token.clone();
                *cached = Some(CachedToken {
                    access_token: token.access_token,
                    expires_at: Instant::now() + Duration::from_secs(token.expires_in),
                });
                Ok(Some(access_token))
            }
        }
    }

    /// Send a request and decode the JSON response body.
    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> ProviderResult<T> {
        let mut request = self.client.request(method.clone(), url);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(token) = self.bearer_token().await? {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            if status.as_u16() != 404 && status.as_u16() != 409 {
                warn!(method = %method, url = %url, status = %status, "Provider call failed");
            }
            return Err(ProviderError::status(status.as_u16(), message));
        }

        let text = response.text().await?;
        let value = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| ProviderError::UnexpectedResponse(e.to_string()))?
        };
        serde_json::from_value(value).map_err(|e| ProviderError::UnexpectedResponse(e.to_string()))
    }
}

#[async_trait]
impl ComputeProvider for GceClient {
    async fn create_instance_template(
        &self,
        project: &str,
        name: &str,
        properties: &serde_json::Value,
    ) -> ProviderResult<Operation> {
        let body = serde_json::json!({
            "name": name,
            "properties": properties,
        });
        self.send(Method::POST, &self.templates_url(project), &[], Some(&body))
            .await
    }

    async fn get_instance_template(
        &self,
        project: &str,
        name: &str,
    ) -> ProviderResult<InstanceTemplate> {
        let url = format!("{}/{}", self.templates_url(project), name);
        self.send(Method::GET, &url, &[], None).await
    }

    async fn create_instance_group_manager(
        &self,
        project: &str,
        manager: &NewInstanceGroupManager,
    ) -> ProviderResult<Operation> {
        let body = serde_json::json!({
            "name": manager.name,
            "baseInstanceName": manager.base_instance_name,
            "instanceTemplate": manager.instance_template,
            "targetSize": manager.target_size,
        });
        self.send(
            Method::POST,
            &self.managers_url(project, &manager.zone),
            &[],
            Some(&body),
        )
        .await
    }

    async fn get_instance_group_manager(
        &self,
        project: &str,
        name: &str,
        zone: &str,
    ) -> ProviderResult<InstanceGroupManager> {
        let url = format!("{}/{}", self.managers_url(project, zone), name);
        self.send(Method::GET, &url, &[], None).await
    }

    async fn resize_instance_group_manager(
        &self,
        project: &str,
        name: &str,
        zone: &str,
        size: i64,
    ) -> ProviderResult<Operation> {
        let url = format!("{}/{}/resize", self.managers_url(project, zone), name);
        let size = size.to_string();
        self.send(Method::POST, &url, &[("size", size.as_str())], None)
            .await
    }

    async fn list_managed_instances(
        &self,
        project: &str,
        name: &str,
        zone: &str,
    ) -> ProviderResult<Vec<ManagedInstance>> {
        let url = format!(
            "{}/{}/listManagedInstances",
            self.managers_url(project, zone),
            name
        );
        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let query: Vec<(&str, &str)> = match &page_token {
                Some(token) => vec![("pageToken", token.as_str())],
                None => Vec::new(),
            };
            let page: ManagedInstancesPage = self.send(Method::POST, &url, &query, None).await?;
            instances.extend(page.managed_instances);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(instances)
    }

    async fn delete_managed_instances(
        &self,
        project: &str,
        name: &str,
        zone: &str,
        instances: &[String],
    ) -> ProviderResult<Operation> {
        let url = format!(
            "{}/{}/deleteInstances",
            self.managers_url(project, zone),
            name
        );
        let body = serde_json::json!({
            "instances": instances,
            "skipInstancesOnValidationError": true,
        });
        self.send(Method::POST, &url, &[], Some(&body)).await
    }

    async fn delete(&self, url: &str) -> ProviderResult<Operation> {
        self.send(Method::DELETE, url, &[], None).await
    }

    async fn get(&self, url: &str) -> ProviderResult<serde_json::Value> {
        self.send(Method::GET, url, &[], None).await
    }
}
