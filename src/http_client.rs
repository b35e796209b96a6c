use anyhow::{Context, Result as AnyResult};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthManager, RefreshOutcome};
use crate::config::Config;
use crate::error::{ApiError, Result};
use crate::network::NetworkMonitor;

/// Header carrying the user's IANA timezone on client-originated calls
pub const TIMEZONE_HEADER: &str = "X-User-Timezone";

/// One outbound API call, relative to the configured base URL
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RequestSpec {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }
}

/// Successful response; `data` is `None` for an empty body
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub data: Option<Value>,
}

/// HTTP client for the clipper API.
///
/// Wraps every call: pre-emptive refresh, credential injection, one
/// refresh-and-retry on 401, classification of everything else.
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    auth_manager: Arc<AuthManager>,

    network: NetworkMonitor,

    base_url: String,

    timezone: String,

    /// Upper bound on attempts for a call rejected with 401
    max_retries: u32,

    /// Consecutive refresh failures after which the session is dropped
    max_refresh_failures: u32,
}

impl ApiClient {
    pub fn new(
        auth_manager: Arc<AuthManager>,
        network: NetworkMonitor,
        config: &Config,
    ) -> AnyResult<Self> {
        Ok(Self {
            client: build_http_client(config)?,
            auth_manager,
            network,
            base_url: config.api_base_url.clone(),
            timezone: config.user_timezone.clone(),
            max_retries: config.http_max_retries,
            max_refresh_failures: config.max_refresh_failures.max(1),
        })
    }

    /// Execute a call through the interceptor.
    ///
    /// Order within one call: offline check, pre-emptive refresh, headers,
    /// send, classify. Only the 401 path is retried, at most once per call.
    pub async fn request(&self, spec: &RequestSpec) -> Result<ApiResponse> {
        if !self.network.is_online() {
            tracing::debug!(path = %spec.path, "Offline, request not sent");
            return Err(ApiError::offline());
        }

        if self.auth_manager.needs_refresh().await {
            tracing::debug!("Access token expiring soon, refreshing before request");
            if !self.auth_manager.refresh().await.is_refreshed() {
                if self.on_refresh_failure().await {
                    return Err(ApiError::AuthError(
                        "Session ended after repeated refresh failures".to_string(),
                    ));
                }
                tracing::warn!("Pre-emptive refresh failed, sending with current token");
            }
        }

        let url = join_url(&self.base_url, &spec.path);
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            let token = self
                .auth_manager
                .current()
                .await
                .map(|credential| credential.access_token);

            tracing::debug!(
                method = %spec.method,
                url = %url,
                attempt = attempt + 1,
                authenticated = token.is_some(),
                "Sending HTTP request"
            );

            let response = match self.build(spec, &url, token.as_deref()).send().await {
                Ok(response) => response,
                Err(e) => {
                    let err = classify_transport_error(&e);
                    tracing::warn!(
                        error = %e,
                        url = %url,
                        attempt = attempt + 1,
                        "HTTP request error"
                    );
                    return Err(err);
                }
            };

            let status = response.status();
            if status.is_success() {
                tracing::debug!(status = %status, "Request successful");
                let data = read_json_body(response).await?;
                return Ok(ApiResponse {
                    status: status.as_u16(),
                    data,
                });
            }

            let message = read_error_message(response).await;

            if status == StatusCode::UNAUTHORIZED {
                if attempt < self.max_retries && !refreshed {
                    // A concurrent caller may already have replaced the token we sent
                    let stored = self
                        .auth_manager
                        .current()
                        .await
                        .map(|credential| credential.access_token);
                    if token.is_some() && stored.is_some() && stored != token {
                        tracing::debug!("Token changed since send, retrying without refresh");
                        refreshed = true;
                        attempt += 1;
                        continue;
                    }

                    tracing::warn!("Received 401, refreshing token and retrying...");

                    match self.auth_manager.refresh().await {
                        RefreshOutcome::Refreshed => {
                            refreshed = true;
                            attempt += 1;
                            continue;
                        }
                        RefreshOutcome::Rejected => {
                            return Err(ApiError::AuthError(format!(
                                "Session could not be renewed: {}",
                                message
                            )));
                        }
                        RefreshOutcome::Failed => {
                            if self.on_refresh_failure().await {
                                return Err(ApiError::AuthError(format!(
                                    "Session ended after repeated refresh failures: {}",
                                    message
                                )));
                            }
                            return Err(ApiError::RefreshFailed(message));
                        }
                    }
                }

                tracing::warn!(url = %url, "Request rejected after refresh, giving up");
                return Err(ApiError::AuthError(message));
            }

            tracing::error!(
                status = status.as_u16(),
                url = %url,
                response_body = %message,
                "HTTP request failed with error response"
            );
            return Err(ApiError::ServerError {
                status: status.as_u16(),
                message,
            });
        }
    }

    fn build(&self, spec: &RequestSpec, url: &str, token: Option<&str>) -> RequestBuilder {
        let mut builder = self
            .client
            .request(spec.method.clone(), url)
            .header(CONTENT_TYPE, "application/json")
            .header(TIMEZONE_HEADER, &self.timezone);

        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if !spec.query.is_empty() {
            builder = builder.query(&spec.query);
        }
        if let Some(body) = &spec.body {
            builder = builder.json(body);
        }
        builder
    }

    /// Drop the session once refresh has failed too many times in a row.
    /// Returns whether it did.
    async fn on_refresh_failure(&self) -> bool {
        let failures = self.auth_manager.consecutive_refresh_failures();
        if failures < self.max_refresh_failures {
            return false;
        }

        tracing::warn!(
            failures = failures,
            "Repeated refresh failures, forcing logout"
        );
        self.auth_manager.force_logout().await;
        true
    }
}

/// reqwest client with the configured timeouts; a timed-out call is aborted
pub(crate) fn build_http_client(config: &Config) -> AnyResult<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(config.http_connect_timeout))
        .timeout(Duration::from_secs(config.http_request_timeout))
        .build()
        .context("Failed to create HTTP client")
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Map a transport failure to a NetworkError, labelled for debugging
pub(crate) fn classify_transport_error(e: &reqwest::Error) -> ApiError {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    };

    ApiError::NetworkError {
        kind,
        message: e.to_string(),
    }
}

/// Error for a non-2xx response: 401 is an auth failure, the rest server errors
pub(crate) async fn error_from_response(response: Response) -> ApiError {
    let status = response.status();
    let message = read_error_message(response).await;
    if status == StatusCode::UNAUTHORIZED {
        ApiError::AuthError(message)
    } else {
        ApiError::ServerError {
            status: status.as_u16(),
            message,
        }
    }
}

async fn read_error_message(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    parse_error_message(status, &body)
}

async fn read_json_body(response: Response) -> Result<Option<Value>> {
    let text = response
        .text()
        .await
        .map_err(|e| classify_transport_error(&e))?;

    if text.trim().is_empty() {
        return Ok(None);
    }

    Ok(Some(
        serde_json::from_str(&text).unwrap_or(Value::String(text)),
    ))
}

/// Pull a human readable message out of an error body
pub(crate) fn parse_error_message(status: StatusCode, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let message = json
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| json.get("error").and_then(Value::as_str))
            .or_else(|| {
                json.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
            });
        if let Some(message) = message {
            return message.to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("Request failed")
            .to_string()
    } else {
        trimmed.to_string()
    }
}
