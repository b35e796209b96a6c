// Bridge authentication and CORS middleware

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::routes::AppState;

/// Bridge key middleware
///
/// Accepts "Bearer {BRIDGE_API_KEY}" in Authorization or the bare key in
/// x-api-key. With no key configured every request passes.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.bridge_api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if bearer == Some(expected) {
        return Ok(next.run(request).await);
    }

    let api_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    if api_key == Some(expected) {
        return Ok(next.run(request).await);
    }

    let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    tracing::warn!(
        "[{}] Bridge access with invalid or missing key: {} {}",
        request_id,
        request.method(),
        request.uri().path()
    );
    Err(ApiError::AuthError("Invalid or missing bridge key".to_string()))
}

/// Create CORS middleware layer
///
/// UI surfaces run from extension origins, so every origin, method and
/// header is allowed. Handles OPTIONS preflight requests automatically.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::SyncContext;
    use crate::messaging::{MessageBus, MessageRouter, MESSAGE_TIMEOUT};
    use crate::storage::MemoryStore;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn create_test_state(key: Option<&str>) -> AppState {
        let context = SyncContext::new(
            Config::for_api("http://127.0.0.1:9"),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        let router = Arc::new(MessageRouter::new(context.clone()));
        AppState {
            bus: Arc::new(MessageBus::spawn(router, MESSAGE_TIMEOUT)),
            context,
            bridge_api_key: key.map(str::to_string),
        }
    }

    async fn test_handler() -> &'static str {
        "OK"
    }

    fn create_test_app(state: AppState) -> Router {
        Router::new()
            .route("/test", get(test_handler))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                auth_middleware,
            ))
            .with_state(state)
    }

    async fn status_for(key: Option<&str>, header: Option<(&str, &str)>) -> StatusCode {
        let app = create_test_app(create_test_state(key));
        let mut builder = Request::builder().uri("/test");
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        let response = app
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        response.status()
    }

    #[tokio::test]
    async fn test_open_bridge_without_key() {
        assert_eq!(status_for(None, None).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_valid_bearer_token() {
        let status = status_for(Some("k-123"), Some(("authorization", "Bearer k-123"))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_valid_x_api_key() {
        let status = status_for(Some("k-123"), Some(("x-api-key", "k-123"))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejected_keys() {
        assert_eq!(
            status_for(Some("k-123"), Some(("authorization", "Bearer wrong"))).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(Some("k-123"), Some(("authorization", "k-123"))).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(Some("k-123"), Some(("x-api-key", "wrong"))).await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_for(Some("k-123"), None).await, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_cors_layer_handles_preflight_options() {
        let app = Router::new()
            .route("/test", get(test_handler))
            .layer(cors_layer());

        let request = Request::builder()
            .method("OPTIONS")
            .uri("/test")
            .header("origin", "chrome-extension://abcdef")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "content-type")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        assert!(response
            .headers()
            .contains_key("access-control-allow-methods"));
    }
}
