// Error handling module
// Classifies failures into the auth / network / server / validation taxonomy

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Network error label used when the client knows it is offline
pub const OFFLINE: &str = "offline";

/// Coarse failure class, as seen by message handlers and UI surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Auth,
    Network,
    Server,
    Validation,
    Internal,
}

/// Errors surfaced by the sync core
#[derive(Error, Debug)]
pub enum ApiError {
    /// The session is gone: rejected after a refresh, or the refresh
    /// endpoint itself refused it. Callers drop the credential.
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// 401 while the refresh could not complete (offline, timeout, 5xx).
    /// The stored credential is kept for the next attempt.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// Offline, timeout, connection reset
    #[error("Network error ({kind}): {message}")]
    NetworkError { kind: &'static str, message: String },

    /// Any other non-2xx response, message parsed from the body
    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    /// Malformed local payload, never retried
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Storage failures and programmer errors
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Error returned without touching the network while offline
    pub fn offline() -> Self {
        ApiError::NetworkError {
            kind: OFFLINE,
            message: "No network connection".to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::AuthError(_) | ApiError::RefreshFailed(_) => ErrorKind::Auth,
            ApiError::NetworkError { .. } => ErrorKind::Network,
            ApiError::ServerError { .. } => ErrorKind::Server,
            ApiError::ValidationError(_) => ErrorKind::Validation,
            ApiError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, ApiError::NetworkError { kind, .. } if *kind == OFFLINE)
    }

    /// Whether a failed write should be parked in the offline queue
    /// (network unreachable, server unavailable, refresh pending) instead
    /// of surfaced
    pub fn should_queue_write(&self) -> bool {
        match self {
            ApiError::NetworkError { .. } | ApiError::RefreshFailed(_) => true,
            ApiError::ServerError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Message safe to show to a UI surface
    pub fn public_message(&self) -> String {
        match self {
            ApiError::AuthError(msg)
            | ApiError::RefreshFailed(msg)
            | ApiError::ValidationError(msg) => msg.clone(),
            ApiError::NetworkError { message, .. } => message.clone(),
            ApiError::ServerError { message, .. } => message.clone(),
            ApiError::Internal(_) => "Internal error".to_string(),
        }
    }

    /// JSON reply body used by the message router and the bridge
    pub fn to_reply(&self) -> Value {
        json!({
            "success": false,
            "kind": self.kind(),
            "error": self.public_message(),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::AuthError(_) | ApiError::RefreshFailed(_) => StatusCode::UNAUTHORIZED,
            ApiError::NetworkError { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ServerError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(self.to_reply())).into_response()
    }
}

/// Result type alias for sync core operations
pub type Result<T> = std::result::Result<T, ApiError>;
