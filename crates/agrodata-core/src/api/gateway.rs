//! Single funnel for every outbound call.
//!
//! `HttpGateway` attaches default headers and the bearer token, bounds each
//! attempt with a hard timeout, retries transient failures with exponential
//! backoff and turns non-2xx responses into structured [`ApiError`]s.
//!
//! A gateway built with [`HttpGateway::with_credentials`] additionally guards
//! protected endpoints: it asks its [`CredentialProvider`] for a usable token
//! before sending, and on a 401 from the server refreshes once and replays
//! the request once. Auth endpoints skip both steps.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::TokenStore;
use crate::config::ApiConfig;

use super::endpoints::is_auth_endpoint;
use super::{ApiError, RetryPolicy};

/// Narrow view of the session manager that the gateway needs in order to
/// keep credentials fresh without owning them.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Pre-flight check. Returns whether the credential was refreshed; fails
    /// with a redirect-required error when there is no token or a needed
    /// refresh did not succeed.
    async fn ensure_valid_token(&self) -> Result<bool, ApiError>;

    /// The server answered 401 to a request sent with `rejected_token`.
    async fn refresh_after_unauthorized(&self, rejected_token: Option<&str>)
        -> Result<(), ApiError>;

    /// Even a refreshed credential was rejected; drop the session.
    async fn expire_session(&self);
}

/// One logical request, replayable after a refresh.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    endpoint: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl RequestSpec {
    pub fn new(method: Method, endpoint: &str) -> Self {
        Self {
            method,
            endpoint: endpoint.to_string(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn with_query(mut self, params: &[(&str, &str)]) -> Self {
        self.query = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    pub fn with_body<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to serialize request body: {}", e)))?;
        self.body = Some(body);
        Ok(self)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// HTTP gateway.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    config: Arc<ApiConfig>,
    retry: RetryPolicy,
    store: TokenStore,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl HttpGateway {
    /// Create a gateway with no credential provider: it attaches whatever
    /// token the store holds but never refreshes.
    pub fn new(config: ApiConfig, store: TokenStore) -> Result<Self, ApiError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            retry: config.retry_policy(),
            config: Arc::new(config),
            store,
            credentials: None,
        })
    }

    /// Create a gateway sharing this one's connection pool whose protected
    /// calls go through `provider`.
    pub fn with_credentials(&self, provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            client: self.client.clone(), // Cheap clone, shares connection pool
            config: Arc::clone(&self.config),
            retry: self.retry,
            store: self.store.clone(),
            credentials: Some(provider),
        }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    // ===== Verb helpers =====

    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        self.request(RequestSpec::new(Method::GET, endpoint).with_query(params))
            .await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(RequestSpec::new(Method::POST, endpoint).with_body(body)?)
            .await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(RequestSpec::new(Method::PUT, endpoint).with_body(body)?)
            .await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request(RequestSpec::new(Method::PATCH, endpoint).with_body(body)?)
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.request(RequestSpec::new(Method::DELETE, endpoint)).await
    }

    // ===== Request pipeline =====

    pub async fn request<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<T, ApiError> {
        let provider = self
            .credentials
            .as_ref()
            .filter(|_| !is_auth_endpoint(&spec.endpoint));

        let refreshed = match provider {
            Some(provider) => provider.ensure_valid_token().await?,
            None => false,
        };

        let sent_token = self.store.access_token();
        let first = self.execute_with_retry(&spec, sent_token.as_deref()).await;

        let provider = match provider {
            Some(provider) => provider,
            None => return first,
        };

        match first {
            // At most one refresh per request: a credential refreshed by the
            // pre-flight check and still rejected is not refreshed again.
            Err(err) if err.is_unauthorized() && refreshed => {
                warn!(endpoint = %spec.endpoint, "Freshly refreshed credential rejected");
                provider.expire_session().await;
                Err(ApiError::SessionExpired(
                    "credential rejected after refresh".to_string(),
                ))
            }
            Err(err) if err.is_unauthorized() => {
                warn!(endpoint = %spec.endpoint, "Credential rejected by server, refreshing once");
                provider
                    .refresh_after_unauthorized(sent_token.as_deref())
                    .await?;

                let token = self.store.access_token();
                match self.execute_with_retry(&spec, token.as_deref()).await {
                    Err(err) if err.is_unauthorized() => {
                        warn!(endpoint = %spec.endpoint, "Refreshed credential also rejected");
                        provider.expire_session().await;
                        Err(ApiError::SessionExpired(
                            "credential rejected after refresh".to_string(),
                        ))
                    }
                    replayed => replayed,
                }
            }
            other => other,
        }
    }

    async fn execute_with_retry<T: DeserializeOwned>(
        &self,
        spec: &RequestSpec,
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        let mut attempt = 0;

        loop {
            match self.execute_once(spec, token).await {
                Err(err) if self.retry.should_retry(&err, attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        method = %spec.method,
                        endpoint = %spec.endpoint,
                        retry = attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Request failed, backing off"
                    );
                    tokio::time::sleep(delay).await; // Exponential backoff
                }
                result => return result,
            }
        }
    }

    /// One network attempt. The timeout covers sending and reading the
    /// body; when it fires the in-flight future is dropped, which closes
    /// the underlying connection.
    async fn execute_once<T: DeserializeOwned>(
        &self,
        spec: &RequestSpec,
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        let url = self.config.url_for(&spec.endpoint);
        debug!(method = %spec.method, url = %url, "Sending request");

        let mut builder = self
            .client
            .request(spec.method.clone(), &url)
            .headers(Self::default_headers(token)?);
        if !spec.query.is_empty() {
            builder = builder.query(&spec.query);
        }
        if let Some(ref body) = spec.body {
            builder = builder.json(body);
        }

        let timeout = self.config.timeout;
        let attempt = async {
            let response = builder.send().await?;
            Self::read_response(response).await
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                debug!(url = %url, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(ApiError::Timeout(timeout))
            }
        }
    }

    fn default_headers(token: Option<&str>) -> Result<HeaderMap, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::InvalidRequest("access token is not a valid header value".to_string()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Classify a response: non-2xx becomes `Http`, 2xx must be JSON.
    async fn read_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), &body));
        }

        if status == StatusCode::NO_CONTENT {
            return serde_json::from_value(Value::Null)
                .map_err(|e| ApiError::InvalidResponse(format!("Empty response body: {}", e)));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !content_type.contains("application/json") {
            let shown = if content_type.is_empty() { "no content type" } else { content_type.as_str() };
            return Err(ApiError::InvalidResponse(format!("Expected JSON, got {}", shown)));
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }
}
