//! HTTP connection to a Bitbucket Server instance.
//!
//! Every request goes through [`RetryWithDelay`], so callers only ever see
//! rate limiting as extra latency.

use reqwest::{header, Client, Response, StatusCode};
use serde_json::Value;
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::models::ImportSource;
use crate::services::retry::RetryWithDelay;

/// Errors raised by the HTTP layer. None of them are retried here.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Remote answered with a non-2xx status.
    #[error("{endpoint} returned {status_code}: {message}")]
    Status {
        status_code: u16,
        endpoint: String,
        message: String,
    },

    /// Remote answered 2xx with a body that is not JSON.
    #[error("Invalid JSON from {endpoint}: {message}")]
    InvalidJson { endpoint: String, message: String },

    /// Page shape did not match `{values, isLastPage, nextPageStart}`.
    #[error("Invalid page from {endpoint}: {message}")]
    InvalidPage { endpoint: String, message: String },

    /// A page claimed more results but carried no cursor.
    #[error("Page reports more results but has no nextPageStart")]
    MissingCursor,

    /// Request never produced a response.
    #[error("Request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("Invalid client configuration: {0}")]
    Config(String),
}

impl ConnectionError {
    fn transport(endpoint: &str, err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "Request timed out".to_string()
        } else if err.is_connect() {
            "Failed to connect to server".to_string()
        } else {
            err.to_string()
        };
        Self::Transport {
            endpoint: endpoint.to_string(),
            message,
        }
    }

    /// HTTP status of a [`ConnectionError::Status`] error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

/// REST API family an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRoot {
    /// `rest/api/1.0`
    Core,
    /// `rest/branch-utils/1.0`, used for branch deletion.
    BranchUtils,
}

impl ApiRoot {
    fn prefix(self) -> &'static str {
        match self {
            Self::Core => "/rest/api/1.0",
            Self::BranchUtils => "/rest/branch-utils/1.0",
        }
    }
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Base URL of the Bitbucket Server instance (e.g., `https://bitbucket.example.com`).
    pub base_url: String,

    pub username: String,
    pub password: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl ConnectionConfig {
    pub fn from_source(source: &ImportSource, config: &PipelineConfig) -> Self {
        Self {
            base_url: source.base_url.clone(),
            username: source.username.clone(),
            password: source.password.clone(),
            timeout_secs: config.request_timeout_secs,
        }
    }
}

/// JSON-over-HTTP connection with basic auth and rate-limit retries.
#[derive(Debug, Clone)]
pub struct Connection {
    client: Client,
    config: ConnectionConfig,
    retry: RetryWithDelay,
}

impl Connection {
    pub fn new(config: ConnectionConfig, retry: RetryWithDelay) -> Result<Self, ConnectionError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConnectionError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            retry,
        })
    }

    fn url(&self, root: ApiRoot, path: &str) -> String {
        format!(
            "{}{}{}",
            self.config.base_url.trim_end_matches('/'),
            root.prefix(),
            path
        )
    }

    /// GET a core API path with query parameters.
    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ConnectionError> {
        let url = self.url(ApiRoot::Core, path);
        log::debug!("GET {} {:?}", path, query);

        let response = self
            .retry
            .run(|| {
                self.client
                    .get(&url)
                    .basic_auth(&self.config.username, Some(&self.config.password))
                    .query(query)
                    .send()
            })
            .await
            .map_err(|e| ConnectionError::transport(path, e))?;

        Self::handle_response(response, path).await
    }

    /// POST a JSON body to a core API path.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, ConnectionError> {
        let url = self.url(ApiRoot::Core, path);

        let response = self
            .retry
            .run(|| {
                self.client
                    .post(&url)
                    .basic_auth(&self.config.username, Some(&self.config.password))
                    .json(body)
                    .send()
            })
            .await
            .map_err(|e| ConnectionError::transport(path, e))?;

        Self::handle_response(response, path).await
    }

    /// DELETE with a JSON body under the given API root.
    pub async fn delete(
        &self,
        root: ApiRoot,
        path: &str,
        body: &Value,
    ) -> Result<Value, ConnectionError> {
        let url = self.url(root, path);

        let response = self
            .retry
            .run(|| {
                self.client
                    .delete(&url)
                    .basic_auth(&self.config.username, Some(&self.config.password))
                    .json(body)
                    .send()
            })
            .await
            .map_err(|e| ConnectionError::transport(path, e))?;

        Self::handle_response(response, path).await
    }

    /// Turn a response into JSON, or a [`ConnectionError`] for non-2xx statuses.
    async fn handle_response(response: Response, endpoint: &str) -> Result<Value, ConnectionError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ConnectionError::transport(endpoint, e))?;

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body).map_err(|e| ConnectionError::InvalidJson {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            });
        }

        // Bitbucket Server returns {"errors": [{"message": "..."}]}
        let body_message = serde_json::from_str::<Value>(&body).ok().and_then(|v| {
            v.get("errors")
                .and_then(|errors| errors.get(0))
                .and_then(|first| first.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        });

        let message = match (status, body_message) {
            (_, Some(msg)) => msg,
            (StatusCode::UNAUTHORIZED, None) => "Invalid credentials".to_string(),
            (StatusCode::FORBIDDEN, None) => "Access denied".to_string(),
            (StatusCode::NOT_FOUND, None) => "Resource not found".to_string(),
            _ => format!("Request failed ({}): {}", status.as_u16(), body),
        };

        Err(ConnectionError::Status {
            status_code: status.as_u16(),
            endpoint: endpoint.to_string(),
            message,
        })
    }
}
