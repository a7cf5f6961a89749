//! Remote Data Gateway - access to the authoritative backend
//!
//! The queue and the orchestrator only see the [`RemoteGateway`] trait.
//! [`HttpGateway`] implements it against the backend REST API:
//! - Replaying queued actions (`{base}{endpoint}` with the action's method)
//! - Fetching entity collections (`GET {base}/{collection}`)
//! - Reading and writing the settings singleton (`GET/PUT {base}/config`)

use super::models::{ErrorKind, HttpMethod, QueuedAction};
use crate::config::SyncConfig;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Backend operations used by the sync core
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Replay a queued mutation
    async fn execute(&self, action: &QueuedAction) -> Result<Value, GatewayError>;

    /// Remote snapshot of a collection
    async fn get_entities(&self, collection: &str) -> Result<Vec<Value>, GatewayError>;

    /// Remote settings singleton (`Value::Null` when none exist yet)
    async fn get_config(&self) -> Result<Value, GatewayError>;

    async fn update_config(&self, settings: &Value) -> Result<(), GatewayError>;
}

// ============================================================================
// HTTP Gateway
// ============================================================================

/// REST client for the backend
pub struct HttpGateway {
    client: Client,
    base_url: String,
    /// Bearer token (cached in memory)
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpGateway {
    /// Create a gateway for `base_url` with a request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    /// Create a gateway from the loaded configuration
    pub fn from_config(config: &SyncConfig) -> Result<Self, GatewayError> {
        let mut gateway = Self::new(
            config.api_base_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        gateway.access_token = Arc::new(RwLock::new(config.api_token.clone()));

        Ok(gateway)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Set access token (after login)
    pub async fn set_token(&self, token: String) {
        let mut guard = self.access_token.write().await;
        *guard = Some(token);
    }

    /// Get current token
    pub async fn get_token(&self) -> Option<String> {
        self.access_token.read().await.clone()
    }

    /// Clear token (logout)
    pub async fn clear_token(&self) {
        let mut guard = self.access_token.write().await;
        *guard = None;
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match self.get_token().await {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn execute(&self, action: &QueuedAction) -> Result<Value, GatewayError> {
        let mut builder = self.request(to_method(action.method), &action.endpoint).await;

        if !action.payload.is_null()
            && !matches!(action.method, HttpMethod::Get | HttpMethod::Delete)
        {
            builder = builder.json(&action.payload);
        }

        log::debug!(
            "Executing action {} ({} {})",
            action.id,
            action.method.as_str(),
            action.endpoint
        );

        let response = builder.send().await?;
        handle_response(response).await
    }

    async fn get_entities(&self, collection: &str) -> Result<Vec<Value>, GatewayError> {
        let response = self.request(Method::GET, collection).await.send().await?;

        // Nothing stored remotely yet
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        match handle_response(response).await? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            _ => Err(GatewayError::InvalidResponse),
        }
    }

    async fn get_config(&self) -> Result<Value, GatewayError> {
        let response = self.request(Method::GET, "/config").await.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Value::Null);
        }

        handle_response(response).await
    }

    async fn update_config(&self, settings: &Value) -> Result<(), GatewayError> {
        let response = self
            .request(Method::PUT, "/config")
            .await
            .json(settings)
            .send()
            .await?;

        handle_response(response).await.map(|_| ())
    }
}

fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response from server")]
    InvalidResponse,

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Network, 5xx and rate limiting are transient; other 4xx are permanent
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Request(_)
            | GatewayError::RateLimitExceeded
            | GatewayError::ServerError { .. }
            | GatewayError::Unavailable(_) => true,
            GatewayError::Unauthorized
            | GatewayError::Rejected { .. }
            | GatewayError::InvalidResponse => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_transient() {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }
}

/// Decode a response body; empty bodies read as `Value::Null`
async fn handle_response(response: reqwest::Response) -> Result<Value, GatewayError> {
    let status = response.status();

    if !status.is_success() {
        return Err(handle_error(response).await);
    }

    let body = response.bytes().await?;
    if body.is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_slice(&body).map_err(|_| GatewayError::InvalidResponse)
}

/// Convert error response to GatewayError
async fn handle_error(response: reqwest::Response) -> GatewayError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED => GatewayError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => GatewayError::RateLimitExceeded,
        _ => {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            if status.is_server_error() {
                GatewayError::ServerError {
                    status: status.as_u16(),
                    message,
                }
            } else {
                GatewayError::Rejected {
                    status: status.as_u16(),
                    message,
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::ActionSpec;
    use chrono::Utc;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn gateway_for(server: &Server) -> HttpGateway {
        HttpGateway::new(server.url(), Duration::from_secs(5)).expect("Failed to create gateway")
    }

    fn action(method: HttpMethod, endpoint: &str, payload: Value) -> QueuedAction {
        QueuedAction::from_spec(ActionSpec::new("test", method, endpoint, payload), 3, Utc::now())
    }

    #[tokio::test]
    async fn test_token_management() {
        let gateway = HttpGateway::new("http://localhost", Duration::from_secs(1)).unwrap();
        assert!(gateway.get_token().await.is_none());

        gateway.set_token("test_token".to_string()).await;
        assert_eq!(gateway.get_token().await, Some("test_token".to_string()));

        gateway.clear_token().await;
        assert!(gateway.get_token().await.is_none());
    }

    #[tokio::test]
    async fn test_execute_sends_method_body_and_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/books")
            .match_header("authorization", "Bearer abc")
            .match_body(Matcher::Json(json!({"isbn": "9780261103573"})))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id": 7}"#)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        gateway.set_token("abc".to_string()).await;

        let response = gateway
            .execute(&action(HttpMethod::Post, "/books", json!({"isbn": "9780261103573"})))
            .await
            .unwrap();

        assert_eq!(response, json!({"id": 7}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_execute_empty_body_is_null() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("DELETE", "/books/1")
            .with_status(204)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        let response = gateway
            .execute(&action(HttpMethod::Delete, "/books/1", Value::Null))
            .await
            .unwrap();

        assert_eq!(response, Value::Null);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_classification() {
        let mut server = Server::new_async().await;
        let _server_error = server
            .mock("PUT", "/books/1")
            .with_status(503)
            .with_body("down for maintenance")
            .create_async()
            .await;
        let _rejected = server
            .mock("PUT", "/books/2")
            .with_status(422)
            .with_body("invalid isbn")
            .create_async()
            .await;

        let gateway = gateway_for(&server);

        let err = gateway
            .execute(&action(HttpMethod::Put, "/books/1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ServerError { status: 503, .. }));
        assert!(err.is_transient());

        let err = gateway
            .execute(&action(HttpMethod::Put, "/books/2", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 422, .. }));
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_get_entities_and_missing_collection() {
        let mut server = Server::new_async().await;
        let _books = server
            .mock("GET", "/books")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"isbn": "1"}, {"isbn": "2"}]"#)
            .create_async()
            .await;
        let _missing = server
            .mock("GET", "/wishlist")
            .with_status(404)
            .create_async()
            .await;

        let gateway = gateway_for(&server);

        let books = gateway.get_entities("books").await.unwrap();
        assert_eq!(books.len(), 2);

        let wishlist = gateway.get_entities("wishlist").await.unwrap();
        assert!(wishlist.is_empty());
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let mut server = Server::new_async().await;
        let get = server
            .mock("GET", "/config")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"theme": "dark"}"#)
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/config")
            .match_body(Matcher::Json(json!({"theme": "light"})))
            .with_status(200)
            .create_async()
            .await;

        let gateway = gateway_for(&server);

        assert_eq!(gateway.get_config().await.unwrap(), json!({"theme": "dark"}));
        gateway.update_config(&json!({"theme": "light"})).await.unwrap();

        get.assert_async().await;
        put.assert_async().await;
    }
}
