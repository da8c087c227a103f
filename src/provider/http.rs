//! HTTP provider client.
//!
//! Talks to a REST API exposing resources under
//! `{endpoint}/resources/{type}[/{id}]`. Responses carry `{ id, attributes }`.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::{ProviderConfig, ResourceAddress};
use crate::error::{ConfigError, ProviderError, Result, StackError};
use crate::sensitive::Sensitive;

use super::{Attributes, ProviderClient, ProviderResult, RemoteState};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Provider backed by an HTTP API.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Bearer token.
    token: Option<Sensitive<String>>,
}

/// Request body for create.
#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    name: &'a str,
    attributes: &'a Attributes,
}

/// Request body for update.
#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    attributes: &'a Attributes,
}

/// Resource representation returned by the API.
#[derive(Debug, Deserialize)]
struct ResourceResponse {
    id: String,
    #[serde(default)]
    attributes: Attributes,
}

impl HttpProvider {
    /// Creates a client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::fatal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.map(Sensitive::new),
        })
    }

    /// Creates a client from the `provider` section, reading the token from
    /// the configured environment variable.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is configured or the client cannot be
    /// created.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let endpoint = config.endpoint.as_deref().ok_or_else(|| {
            StackError::Config(ConfigError::validation(
                "provider.endpoint is required to talk to a provider",
                "provider.endpoint",
            ))
        })?;

        let token = std::env::var(&config.token_env).ok();
        if token.is_none() {
            warn!(
                "{} is not set, calling the provider without credentials",
                config.token_env
            );
        }

        Self::with_timeout(endpoint, token, config.timeout_secs)
    }

    fn collection_url(&self, resource_type: &str) -> String {
        format!("{}/resources/{resource_type}", self.endpoint)
    }

    fn item_url(&self, resource_type: &str, id: &str) -> String {
        format!("{}/resources/{resource_type}/{id}", self.endpoint)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token.expose())),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> ProviderResult<Response> {
        self.authorize(request)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ProviderError::transient(format!("Request failed: {e}"))
                } else {
                    ProviderError::fatal(format!("Request failed: {e}"))
                }
            })
    }

    /// Maps an unsuccessful response to a classified error.
    async fn classify(response: Response) -> ProviderError {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();

        match status {
            StatusCode::TOO_MANY_REQUESTS
            | StatusCode::CONFLICT
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => ProviderError::Transient {
                message: format!("HTTP {}: {body}", status.as_u16()),
                retry_after,
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ProviderError::fatal(format!("Authentication failed (HTTP {})", status.as_u16()))
            }
            _ => ProviderError::fatal(format!("HTTP {}: {body}", status.as_u16())),
        }
    }

    async fn parse(resource_type: &str, response: Response) -> ProviderResult<RemoteState> {
        let body: ResourceResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::fatal(format!("Failed to parse response: {e}")))?;
        Ok(RemoteState {
            id: body.id,
            resource_type: resource_type.to_string(),
            attributes: body.attributes,
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProvider {
    fn name(&self) -> String {
        format!("http({})", self.endpoint)
    }

    async fn describe(&self, resource_type: &str, id: &str) -> ProviderResult<Option<RemoteState>> {
        trace!("GET {}", self.item_url(resource_type, id));
        let response = self
            .send(self.client.get(self.item_url(resource_type, id)))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("{resource_type} {id} not found");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        Self::parse(resource_type, response).await.map(Some)
    }

    async fn create(
        &self,
        address: &ResourceAddress,
        attributes: &Attributes,
    ) -> ProviderResult<RemoteState> {
        let url = self.collection_url(&address.resource_type);
        trace!("POST {url}");
        let response = self
            .send(self.client.post(url).json(&CreateRequest {
                name: &address.name,
                attributes,
            }))
            .await?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        Self::parse(&address.resource_type, response).await
    }

    async fn update(
        &self,
        resource_type: &str,
        id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<RemoteState> {
        let url = self.item_url(resource_type, id);
        trace!("PUT {url}");
        let response = self
            .send(self.client.put(url).json(&UpdateRequest { attributes }))
            .await?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        Self::parse(resource_type, response).await
    }

    async fn delete(&self, resource_type: &str, id: &str) -> ProviderResult<()> {
        let url = self.item_url(resource_type, id);
        trace!("DELETE {url}");
        let response = self.send(self.client.delete(url)).await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("{resource_type} {id} already gone");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        Ok(())
    }
}
